//! Suggestion service client

use serde::{Deserialize, Serialize};

use super::CollaboratorError;

/// Risk classification of a suggested command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// A command suggestion authored by the suggestion service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSuggestion {
    pub id: String,
    pub command: String,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub session_id: Option<String>,
}

pub struct SuggestionServiceClient {
    http: reqwest::Client,
    base_url: String,
}

impl SuggestionServiceClient {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    /// Resolve a suggestion by id. Not retried: the caller surfaces
    /// failures to the requesting user immediately.
    pub async fn get(&self, id: &str) -> Result<PendingSuggestion, CollaboratorError> {
        let response = self
            .http
            .get(format!("{}/suggestions/{}", self.base_url, id))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CollaboratorError::NotFound {
                service: "suggestion service",
                id: id.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(CollaboratorError::Status {
                service: "suggestion service",
                status: response.status(),
            });
        }

        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_service_payload() {
        let suggestion: PendingSuggestion = serde_json::from_str(
            r#"{"id":"s1","command":"df -h","risk_level":"low","requires_approval":false}"#,
        )
        .unwrap();

        assert_eq!(suggestion.risk_level, RiskLevel::Low);
        assert!(!suggestion.requires_approval);
        assert!(suggestion.session_id.is_none());
    }
}
