//! Session service client
//!
//! The session service is the durable system of record; the gateway
//! pushes lifecycle changes and command audit records to it. These calls
//! are idempotent on the service side, so they are the only ones the
//! gateway retries.

use serde::Serialize;

use super::{with_retry, CollaboratorError};
use crate::session::types::{SessionSnapshot, SessionStatus};
use crate::ws::protocol::CommandAudit;

pub struct SessionServiceClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct StatusPatch {
    status: SessionStatus,
}

fn expect_success(response: reqwest::Response) -> Result<(), CollaboratorError> {
    if !response.status().is_success() {
        return Err(CollaboratorError::Status {
            service: "session service",
            status: response.status(),
        });
    }
    Ok(())
}

impl SessionServiceClient {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    /// Record a freshly created session. Single attempt: creation is
    /// surfaced to the user immediately and the next status push will
    /// also carry the session.
    pub async fn register(&self, snapshot: &SessionSnapshot) -> Result<(), CollaboratorError> {
        let response = self
            .http
            .post(format!("{}/sessions", self.base_url))
            .json(snapshot)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CollaboratorError::Status {
                service: "session service",
                status: response.status(),
            });
        }
        Ok(())
    }

    /// Persist a status transition, retried with backoff.
    pub async fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), CollaboratorError> {
        let url = format!("{}/sessions/{}/status", self.base_url, session_id);
        with_retry("session status update", || {
            // Build a fresh request per attempt; the future owns it
            let request = self.http.patch(&url).json(&StatusPatch { status });
            async move { expect_success(request.send().await?) }
        })
        .await
    }

    /// Persist a command audit record, retried with backoff.
    pub async fn log_command(
        &self,
        session_id: &str,
        audit: &CommandAudit,
    ) -> Result<(), CollaboratorError> {
        let url = format!("{}/sessions/{}/commands", self.base_url, session_id);
        with_retry("command audit", || {
            let request = self.http.post(&url).json(audit);
            async move { expect_success(request.send().await?) }
        })
        .await
    }
}
