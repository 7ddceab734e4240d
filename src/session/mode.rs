//! Session mode and inbound message decoding

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fmt;

/// Operator-selected permission level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionLevel {
    #[default]
    Default,
    ReadOnly,
    SafeYolo,
    Yolo,
}

impl PermissionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::Default => "default",
            PermissionLevel::ReadOnly => "read-only",
            PermissionLevel::SafeYolo => "safe-yolo",
            PermissionLevel::Yolo => "yolo",
        }
    }

    /// Agent `(approval-policy, sandbox)` pair for this level
    pub fn agent_policy(&self) -> AgentPolicy {
        let (approval_policy, sandbox) = match self {
            PermissionLevel::Default => ("untrusted", "workspace-write"),
            PermissionLevel::ReadOnly => ("never", "read-only"),
            PermissionLevel::SafeYolo => ("on-failure", "workspace-write"),
            PermissionLevel::Yolo => ("on-failure", "danger-full-access"),
        };
        AgentPolicy {
            approval_policy,
            sandbox,
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PermissionLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(PermissionLevel::Default),
            "read-only" => Ok(PermissionLevel::ReadOnly),
            "safe-yolo" => Ok(PermissionLevel::SafeYolo),
            "yolo" => Ok(PermissionLevel::Yolo),
            other => Err(Error::Validation(format!("Unknown permission mode: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentPolicy {
    pub approval_policy: &'static str,
    pub sandbox: &'static str,
}

/// Permission level plus optional model; immutable
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mode {
    pub permission_level: PermissionLevel,
    pub model: Option<String>,
}

impl Mode {
    pub fn new(permission_level: PermissionLevel, model: Option<String>) -> Self {
        Self {
            permission_level,
            model,
        }
    }

    /// Canonical JSON form; object keys are sorted
    pub fn canonical_json(&self) -> String {
        json!({
            "model": self.model,
            "permissionLevel": self.permission_level.as_str(),
        })
        .to_string()
    }

    /// Lowercase hex SHA-256 of the canonical JSON
    pub fn hash(&self) -> String {
        let digest = Sha256::digest(self.canonical_json().as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Decoded inbound user message
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub text: String,
    pub attachments: Vec<String>,
    pub permission_level: Option<PermissionLevel>,
    /// `None`: keep the current model; `Some(x)`: replace it with `x`
    pub model: Option<Option<String>>,
}

impl InboundMessage {
    /// Decode `{role:"user", content:{type:"text", text}, meta:{...}}`
    pub fn decode(value: &Value) -> Result<Self> {
        let role = value.get("role").and_then(Value::as_str).unwrap_or("user");
        if role != "user" {
            return Err(Error::Validation(format!("Unexpected message role: {}", role)));
        }
        let content = value
            .get("content")
            .ok_or_else(|| Error::Validation("Message has no content".to_string()))?;
        let text = match content.get("type").and_then(Value::as_str) {
            Some("text") => content
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Validation("Text content has no text".to_string()))?
                .to_string(),
            other => {
                return Err(Error::Validation(format!(
                    "Unsupported content type: {}",
                    other.unwrap_or("none")
                )))
            }
        };

        let meta = value.get("meta");
        let permission_level = match meta
            .and_then(|m| m.get("permissionMode"))
            .and_then(Value::as_str)
        {
            Some(level) => Some(level.parse()?),
            None => None,
        };
        let model = meta
            .and_then(|m| m.get("model"))
            .map(|m| m.as_str().map(str::to_string));
        let attachments = meta
            .and_then(|m| m.get("attachments"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            text,
            attachments,
            permission_level,
            model,
        })
    }

    /// Mode this message asks for, given the mode currently requested
    pub fn resolve_mode(&self, current: &Mode) -> Mode {
        Mode {
            permission_level: self.permission_level.unwrap_or(current.permission_level),
            model: match &self.model {
                Some(model) => model.clone(),
                None => current.model.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_policy_mapping() {
        let cases = [
            (PermissionLevel::Default, "untrusted", "workspace-write"),
            (PermissionLevel::ReadOnly, "never", "read-only"),
            (PermissionLevel::SafeYolo, "on-failure", "workspace-write"),
            (PermissionLevel::Yolo, "on-failure", "danger-full-access"),
        ];
        for (level, approval, sandbox) in cases {
            let policy = level.agent_policy();
            assert_eq!(policy.approval_policy, approval);
            assert_eq!(policy.sandbox, sandbox);
            assert_eq!(level.as_str().parse::<PermissionLevel>().unwrap(), level);
        }
        assert!("root".parse::<PermissionLevel>().is_err());
    }

    #[test]
    fn test_mode_hash_equality() {
        let a = Mode::new(PermissionLevel::Default, None);
        let b = Mode::new(PermissionLevel::Default, None);
        let c = Mode::new(PermissionLevel::Default, Some("gpt-5".into()));
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
        assert_eq!(a.hash().len(), 64);
        assert_eq!(
            a.canonical_json(),
            r#"{"model":null,"permissionLevel":"default"}"#
        );
    }

    #[test]
    fn test_decode_message_with_meta() {
        let msg = InboundMessage::decode(&json!({
            "role": "user",
            "content": {"type": "text", "text": "fix bug"},
            "meta": {"permissionMode": "yolo", "model": null, "attachments": ["a.png"]}
        }))
        .unwrap();
        assert_eq!(msg.text, "fix bug");
        assert_eq!(msg.permission_level, Some(PermissionLevel::Yolo));
        assert_eq!(msg.model, Some(None));
        assert_eq!(msg.attachments, vec!["a.png".to_string()]);
    }

    #[test]
    fn test_resolve_mode_keeps_or_replaces() {
        let current = Mode::new(PermissionLevel::ReadOnly, Some("o4-mini".into()));

        let plain = InboundMessage::decode(&json!({
            "role": "user", "content": {"type": "text", "text": "x"}
        }))
        .unwrap();
        assert_eq!(plain.resolve_mode(&current), current);

        let cleared = InboundMessage::decode(&json!({
            "role": "user", "content": {"type": "text", "text": "x"}, "meta": {"model": null}
        }))
        .unwrap();
        assert_eq!(
            cleared.resolve_mode(&current),
            Mode::new(PermissionLevel::ReadOnly, None)
        );
    }

    #[test]
    fn test_decode_rejects_bad_messages() {
        assert!(InboundMessage::decode(&json!({"role": "agent", "content": {}})).is_err());
        assert!(InboundMessage::decode(&json!({"content": {"type": "image"}})).is_err());
        assert!(InboundMessage::decode(&json!({
            "content": {"type": "text", "text": "x"}, "meta": {"permissionMode": "root"}
        }))
        .is_err());
    }
}
