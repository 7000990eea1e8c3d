//! Collaborator service clients
//!
//! Thin HTTP clients for the services the gateway depends on. Every
//! failure here is survivable: callers log, emit a non-fatal status
//! event, and keep the session running. Retries are reserved for the
//! idempotent calls (status persistence, command audit) with bounded
//! exponential backoff.

pub mod rag;
pub mod session_service;
pub mod suggestion;
pub mod vulnerability;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;

/// Per-request timeout for collaborator calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Retry attempts for idempotent calls.
const RETRY_ATTEMPTS: u32 = 3;
/// Base backoff delay; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{service} returned {status}")]
    Status {
        service: &'static str,
        status: reqwest::StatusCode,
    },

    #[error("{service} has no record of {id}")]
    NotFound { service: &'static str, id: String },
}

/// All collaborator clients, sharing one connection pool.
pub struct Collaborators {
    pub session: session_service::SessionServiceClient,
    pub suggestion: suggestion::SuggestionServiceClient,
    pub vulnerability: vulnerability::VulnerabilityServiceClient,
    pub rag: rag::RagClient,
}

impl Collaborators {
    pub fn new(config: &Config) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static options");

        Self {
            session: session_service::SessionServiceClient::new(
                http.clone(),
                config.session_service_url.clone(),
            ),
            suggestion: suggestion::SuggestionServiceClient::new(
                http.clone(),
                config.suggestion_service_url.clone(),
            ),
            vulnerability: vulnerability::VulnerabilityServiceClient::new(
                http.clone(),
                config.vuln_service_url.clone(),
            ),
            rag: rag::RagClient::new(http, config.rag_agent_url.clone()),
        }
    }
}

/// Run an idempotent operation with bounded exponential backoff.
pub(crate) async fn with_retry<T, F, Fut>(
    op_name: &str,
    mut op: F,
) -> Result<T, CollaboratorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollaboratorError>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut last_err = None;

    for attempt in 1..=RETRY_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt < RETRY_ATTEMPTS {
                    debug!("{} attempt {} failed, retrying: {}", op_name, attempt, e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                } else {
                    warn!("{} failed after {} attempts: {}", op_name, attempt, e);
                }
                last_err = Some(e);
            }
        }
    }

    Err(last_err.expect("loop runs at least once"))
}
