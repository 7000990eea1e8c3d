//! Post-connect fingerprinting and vulnerability notification
//!
//! Runs once per session after it reaches Connected, entirely on
//! auxiliary exec channels - the interactive pty never sees a probe.
//! A small global worker pool bounds how many sessions fingerprint
//! concurrently. Results flow to the vulnerability service; high
//! findings are pushed to clients, and a count summary is always
//! broadcast, even when the catalog comes back empty.

pub mod os;
pub mod software;

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::clients::vulnerability::{Severity, VulnerabilitySummary};
use crate::clients::Collaborators;
use crate::session::types::OsFamily;
use crate::session::Session;
use crate::ws::protocol::{ServerEvent, StatusKind};

/// Kick off fingerprinting for a freshly connected session.
pub fn spawn(session: Arc<Session>, collaborators: Arc<Collaborators>, pool: Arc<Semaphore>) {
    tokio::spawn(async move {
        let Ok(_permit) = pool.acquire_owned().await else {
            // Pool closed: gateway is shutting down
            return;
        };
        run(session, collaborators).await;
    });
}

async fn run(session: Arc<Session>, collaborators: Arc<Collaborators>) {
    let Some(runtime) = session.runtime() else {
        debug!("Session {}: no runtime, skipping fingerprint", session.id);
        return;
    };
    let controller = runtime.controller;

    let os_info = os::detect(&controller, &session.id).await;
    session.set_os_info(os_info.clone());

    if os_info.family != OsFamily::Unknown {
        info!("Session {}: detected {}", session.id, os_info.label());
        session.broadcast(&ServerEvent::status(
            StatusKind::OsDetected,
            format!("Detected {}", os_info.label()),
        ));
    } else {
        debug!("Session {}: OS detection inconclusive", session.id);
    }

    let software = software::probe(&controller, os_info.family, &session.id).await;
    info!(
        "Session {}: fingerprint found {} software components",
        session.id,
        software.len()
    );

    let alerts = match collaborators
        .vulnerability
        .check(&session.id, &os_info, &software)
        .await
    {
        Ok(alerts) => alerts,
        Err(e) => {
            // Degrade to an empty result; the summary still goes out
            warn!("Session {}: vulnerability check failed: {}", session.id, e);
            Vec::new()
        }
    };

    for alert in alerts.iter().filter(|a| a.severity == Severity::High) {
        session.broadcast(&ServerEvent::VulnerabilityAlert(alert.clone()));
    }

    session.broadcast(&ServerEvent::VulnerabilitySummary(
        VulnerabilitySummary::from_alerts(&session.id, &alerts),
    ));
}
