//! Suggested-command execution
//!
//! Commands are authored by the suggestion service; the gateway resolves
//! them by id, applies the risk gate, writes them to the session's stdin
//! through the same single-writer path as typed input, and emits an
//! audit trail (`command_starting` then `command_executed` or
//! `command_failed`). Each (suggestion, session) pair executes at most
//! once for the session's lifetime.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};

use crate::clients::suggestion::{PendingSuggestion, RiskLevel};
use crate::clients::Collaborators;
use crate::session::Session;
use crate::ws::mux::Attachment;
use crate::ws::protocol::{CommandAudit, ServerEvent, SuggestionOutcome};

/// Decide whether a suggestion may run right now.
///
/// Low-risk commands run unconditionally. Medium/high risk commands
/// that the service flagged for approval need the client to acknowledge
/// the risk explicitly.
fn approval_required(suggestion: &PendingSuggestion, acknowledge_risk: bool) -> bool {
    matches!(suggestion.risk_level, RiskLevel::Medium | RiskLevel::High)
        && suggestion.requires_approval
        && !acknowledge_risk
}

/// Execute a suggestion on behalf of `initiator`.
pub async fn execute(
    session: Arc<Session>,
    collaborators: Arc<Collaborators>,
    suggestion_id: String,
    acknowledge_risk: bool,
    initiator: Arc<Attachment>,
) {
    let suggestion = match collaborators.suggestion.get(&suggestion_id).await {
        Ok(s) => s,
        Err(e) => {
            warn!(
                "Session {}: suggestion {} could not be resolved: {}",
                session.id, suggestion_id, e
            );
            initiator.send_event(&ServerEvent::SuggestionStatus {
                suggestion_id,
                status: SuggestionOutcome::Error,
                message: Some(format!("suggestion lookup failed: {e}")),
            });
            return;
        }
    };

    if approval_required(&suggestion, acknowledge_risk) {
        initiator.send_event(&ServerEvent::SuggestionStatus {
            suggestion_id: suggestion.id.clone(),
            status: SuggestionOutcome::RequiresApproval,
            message: Some(format!(
                "{:?}-risk command requires explicit acknowledgement",
                suggestion.risk_level
            )),
        });
        return;
    }

    // Replay guard: claim the id before anything observable happens
    if !session.consume_suggestion(&suggestion.id) {
        initiator.send_event(&ServerEvent::SuggestionStatus {
            suggestion_id: suggestion.id.clone(),
            status: SuggestionOutcome::Error,
            message: Some("already executed".to_string()),
        });
        return;
    }

    let mut audit = CommandAudit {
        session_id: session.id.clone(),
        suggestion_id: suggestion.id.clone(),
        command: suggestion.command.clone(),
        risk_level: suggestion.risk_level,
        initiated_by: initiator.remote_addr.clone(),
        duration_ms: None,
        error: None,
        timestamp: Utc::now(),
    };

    session.broadcast(&ServerEvent::CommandStarting(audit.clone()));

    let started = Instant::now();
    let result = session
        .write_stdin(format!("{}\n", suggestion.command).into_bytes())
        .await;
    audit.duration_ms = Some(started.elapsed().as_millis() as u64);
    audit.timestamp = Utc::now();

    match result {
        Ok(()) => {
            info!(
                "Session {}: executed suggestion {} ({:?} risk) for {}",
                session.id, suggestion.id, suggestion.risk_level, initiator.remote_addr
            );
            session.broadcast(&ServerEvent::CommandExecuted(audit.clone()));
            initiator.send_event(&ServerEvent::SuggestionStatus {
                suggestion_id: suggestion.id.clone(),
                status: SuggestionOutcome::Executed,
                message: None,
            });
        }
        Err(e) => {
            // The write never reached the remote; allow a retry
            session.release_suggestion(&suggestion.id);
            audit.error = Some(e.to_string());
            warn!(
                "Session {}: suggestion {} failed: {}",
                session.id, suggestion.id, e
            );
            session.broadcast(&ServerEvent::CommandFailed(audit.clone()));
            initiator.send_event(&ServerEvent::SuggestionStatus {
                suggestion_id: suggestion.id.clone(),
                status: SuggestionOutcome::Error,
                message: Some(e.to_string()),
            });
        }
    }

    // Durable audit record, fail-soft
    if let Err(e) = collaborators.session.log_command(&session.id, &audit).await {
        warn!(
            "Session {}: command audit persistence failed: {}",
            session.id, e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suggestion(risk_level: RiskLevel, requires_approval: bool) -> PendingSuggestion {
        PendingSuggestion {
            id: "s1".into(),
            command: "systemctl restart nginx".into(),
            risk_level,
            requires_approval,
            session_id: None,
        }
    }

    #[test]
    fn low_risk_runs_without_acknowledgement() {
        assert!(!approval_required(&suggestion(RiskLevel::Low, true), false));
        assert!(!approval_required(&suggestion(RiskLevel::Low, false), false));
    }

    #[test]
    fn flagged_high_risk_needs_acknowledgement() {
        assert!(approval_required(&suggestion(RiskLevel::High, true), false));
        assert!(approval_required(&suggestion(RiskLevel::Medium, true), false));

        // Acknowledged: runs
        assert!(!approval_required(&suggestion(RiskLevel::High, true), true));
    }

    #[test]
    fn unflagged_high_risk_runs() {
        assert!(!approval_required(&suggestion(RiskLevel::High, false), false));
    }
}
