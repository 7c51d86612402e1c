//! Stored trigger payloads
//!
//! Inbound trigger payloads are kept as tagged JSON so stored hook calls stay
//! readable and replayable without knowledge of the code that wrote them.
//! The `format` tag names the payload source and its schema version.

use serde::{Deserialize, Serialize};

/// A raw trigger payload together with its format tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format")]
pub enum StoredPayload {
    /// Webhook delivery from GitHub, body kept verbatim
    #[serde(rename = "github.v1")]
    GitHubV1 {
        /// Value of the `X-GitHub-Event` header (`push`, `pull_request`, ...)
        event: String,
        body: serde_json::Value,
    },
}

impl StoredPayload {
    pub fn github(event: impl Into<String>, body: serde_json::Value) -> Self {
        StoredPayload::GitHubV1 {
            event: event.into(),
            body,
        }
    }

    /// The format tag this payload is stored under
    pub fn format(&self) -> &'static str {
        match self {
            StoredPayload::GitHubV1 { .. } => "github.v1",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    pub fn from_json(value: serde_json::Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }
}
