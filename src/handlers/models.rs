//! Model listing with a short-lived cache and a built-in fallback

use super::HandlerContext;
use crate::error::{Error, Result};
use crate::transport::RelayHttpClient;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// A selectable model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_default: bool,
}

impl ModelInfo {
    fn builtin(id: &str, display_name: &str, description: &str, is_default: bool) -> Self {
        Self {
            id: id.to_string(),
            model: id.to_string(),
            display_name: display_name.to_string(),
            description: description.to_string(),
            is_default,
        }
    }

    /// Fill display fields the remote left blank
    fn normalized(mut self) -> Self {
        if self.model.is_empty() {
            self.model = self.id.clone();
        }
        if self.display_name.is_empty() {
            self.display_name = self.id.clone();
        }
        self
    }
}

/// Hard-coded list used whenever the remote catalog is unavailable
pub fn fallback_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo::builtin(
            "gpt-5-codex",
            "GPT-5 Codex",
            "Tuned for agentic coding",
            true,
        ),
        ModelInfo::builtin("gpt-5", "GPT-5", "General purpose reasoning model", false),
        ModelInfo::builtin("o4-mini", "o4-mini", "Fast, lower-cost reasoning", false),
    ]
}

/// Where the listed models came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    Remote,
    Fallback,
}

/// Remote catalog
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn fetch(&self, provider: Option<&str>, limit: Option<u32>) -> Result<Vec<ModelInfo>>;
}

#[derive(Deserialize)]
struct RemoteModels {
    #[serde(default)]
    data: Vec<ModelInfo>,
}

#[async_trait]
impl ModelProvider for RelayHttpClient {
    async fn fetch(&self, provider: Option<&str>, limit: Option<u32>) -> Result<Vec<ModelInfo>> {
        let mut query = Vec::new();
        if let Some(provider) = provider {
            query.push(("provider", provider.to_string()));
        }
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        let models: RemoteModels = self.get_json("/v1/models", &query).await?;
        Ok(models.data)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListModelsRequest {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListModelsResponse {
    pub success: bool,
    pub data: Vec<ModelInfo>,
    pub source: ModelSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

type CacheKey = (Option<String>, Option<u32>);

/// Model catalog with a per-(provider, limit) cache
pub struct ModelCatalog {
    provider: Option<Arc<dyn ModelProvider>>,
    ttl: Duration,
    cache: Mutex<HashMap<CacheKey, (Instant, Vec<ModelInfo>)>>,
}

impl ModelCatalog {
    pub fn new(provider: Option<Arc<dyn ModelProvider>>, ttl: Duration) -> Self {
        Self {
            provider,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// List models, preferring a fresh cache entry, then the remote catalog
    pub async fn list(&self, req: &ListModelsRequest) -> ListModelsResponse {
        let key = (req.provider.clone(), req.limit);

        if let Some((at, models)) = self.cache.lock().await.get(&key) {
            if at.elapsed() < self.ttl {
                return ListModelsResponse {
                    success: true,
                    data: models.clone(),
                    source: ModelSource::Remote,
                    error: None,
                };
            }
        }

        match self.fetch_remote(req).await {
            Ok(models) => {
                self.cache
                    .lock()
                    .await
                    .insert(key, (Instant::now(), models.clone()));
                ListModelsResponse {
                    success: true,
                    data: models,
                    source: ModelSource::Remote,
                    error: None,
                }
            }
            Err(e) => {
                tracing::debug!("Using fallback model list: {}", e);
                let mut data = fallback_models();
                if let Some(limit) = req.limit {
                    data.truncate(limit as usize);
                }
                ListModelsResponse {
                    success: true,
                    data,
                    source: ModelSource::Fallback,
                    error: None,
                }
            }
        }
    }

    async fn fetch_remote(&self, req: &ListModelsRequest) -> Result<Vec<ModelInfo>> {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| Error::Config("No remote model catalog configured".to_string()))?;
        let models = provider
            .fetch(req.provider.as_deref(), req.limit)
            .await?;
        if models.is_empty() {
            return Err(Error::Rpc("Remote catalog returned no models".to_string()));
        }
        Ok(models.into_iter().map(ModelInfo::normalized).collect())
    }
}

pub async fn list_models(ctx: Arc<HandlerContext>, req: ListModelsRequest) -> ListModelsResponse {
    ctx.models.list(&req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ModelProvider for CountingProvider {
        async fn fetch(&self, _provider: Option<&str>, limit: Option<u32>) -> Result<Vec<ModelInfo>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Transport("offline".to_string()));
            }
            let mut models = vec![ModelInfo {
                id: "remote-1".to_string(),
                model: String::new(),
                display_name: String::new(),
                description: "from relay".to_string(),
                is_default: true,
            }];
            if limit == Some(0) {
                models.clear();
            }
            Ok(models)
        }
    }

    fn catalog(fail: bool, ttl: Duration) -> (Arc<CountingProvider>, ModelCatalog) {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            fail,
        });
        let catalog = ModelCatalog::new(Some(provider.clone() as Arc<dyn ModelProvider>), ttl);
        (provider, catalog)
    }

    #[tokio::test]
    async fn test_remote_results_are_cached_per_key() {
        let (provider, catalog) = catalog(false, Duration::from_secs(60));
        let req = ListModelsRequest {
            provider: Some("openai".to_string()),
            limit: Some(5),
        };

        let first = catalog.list(&req).await;
        assert_eq!(first.source, ModelSource::Remote);
        assert_eq!(first.data[0].display_name, "remote-1");
        catalog.list(&req).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        catalog.list(&ListModelsRequest::default()).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_cache_refetches() {
        let (provider, catalog) = catalog(false, Duration::from_millis(0));
        catalog.list(&ListModelsRequest::default()).await;
        catalog.list(&ListModelsRequest::default()).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_falls_back() {
        let (_, catalog) = catalog(true, Duration::from_secs(60));
        let resp = catalog
            .list(&ListModelsRequest {
                provider: None,
                limit: Some(2),
            })
            .await;
        assert!(resp.success);
        assert_eq!(resp.source, ModelSource::Fallback);
        assert_eq!(resp.data.len(), 2);
        assert!(resp.data[0].is_default);
    }

    #[tokio::test]
    async fn test_empty_remote_list_falls_back() {
        let (_, catalog) = catalog(false, Duration::from_secs(60));
        let resp = catalog
            .list(&ListModelsRequest {
                provider: None,
                limit: Some(0),
            })
            .await;
        assert_eq!(resp.source, ModelSource::Fallback);
    }

    #[tokio::test]
    async fn test_no_provider_uses_fallback() {
        let catalog = ModelCatalog::new(None, Duration::from_secs(60));
        let resp = catalog.list(&ListModelsRequest::default()).await;
        assert_eq!(resp.source, ModelSource::Fallback);
        assert_eq!(resp.data, fallback_models());
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["source"], "fallback");
        assert_eq!(json["data"][0]["displayName"], "GPT-5 Codex");
    }
}
