//! HTTP requests to the relay, sharing the socket's bearer credential

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Shared bearer credential; rotating it affects the socket and HTTP alike
pub type TokenHandle = Arc<RwLock<String>>;

/// Thin JSON client for the relay's HTTP API
#[derive(Clone)]
pub struct RelayHttpClient {
    http: reqwest::Client,
    base_url: String,
    token: TokenHandle,
}

impl RelayHttpClient {
    /// Create a client for `base_url` authenticated with `token`
    pub fn new(base_url: &str, token: TokenHandle, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// `GET` a JSON document
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let token = self.token.read().await.clone();
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;
        Self::decode(response).await
    }

    /// `POST` a JSON body and decode the JSON reply
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let token = self.token.read().await.clone();
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!(
                "Relay returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }
        Ok(response.json::<T>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let client = RelayHttpClient::new(
            "https://relay.example/",
            Arc::new(RwLock::new("t".to_string())),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(client.url("/v1/models"), "https://relay.example/v1/models");
        assert_eq!(client.url("v1/sessions"), "https://relay.example/v1/sessions");
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_an_error() {
        let client = RelayHttpClient::new(
            "http://127.0.0.1:9",
            Arc::new(RwLock::new("t".to_string())),
            Duration::from_millis(500),
        )
        .unwrap();
        let result: Result<serde_json::Value> = client.get_json("/v1/models", &[]).await;
        assert!(result.is_err());
    }
}
