//! RAG agent client

use serde::Serialize;
use serde_json::Value;

use super::CollaboratorError;

#[derive(Debug, Serialize)]
pub struct RagQueryRequest<'a> {
    pub query: &'a str,
    pub user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area_id: Option<&'a str>,
    /// Recent terminal lines, oldest first, when the client opted in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_context: Option<Vec<String>>,
}

pub struct RagClient {
    http: reqwest::Client,
    base_url: String,
}

impl RagClient {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    /// Submit a query. The response body is passed through to clients
    /// verbatim as a `rag_response` event; the gateway does not model
    /// the RAG answer schema.
    pub async fn query(&self, request: &RagQueryRequest<'_>) -> Result<Value, CollaboratorError> {
        let response = self
            .http
            .post(format!("{}/query", self.base_url))
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CollaboratorError::Status {
                service: "rag agent",
                status: response.status(),
            });
        }

        Ok(response.json().await?)
    }
}
