//! Vulnerability service client

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CollaboratorError;
use crate::session::types::OsInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// One piece of software detected on the remote host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftwareRecord {
    pub name: String,
    pub version: String,
    /// Component class, e.g. "web_server", "database", "runtime"
    pub software_type: String,
    /// How the version was obtained, e.g. "dpkg", "rpm", "version_flag"
    pub detection_method: String,
}

/// Vulnerability finding returned by the catalog service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VulnerabilityAlert {
    pub id: String,
    pub session_id: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub affected_software: String,
    /// External technique reference (e.g. an ATT&CK id)
    #[serde(default)]
    pub technique_id: Option<String>,
    #[serde(default)]
    pub mitigation: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Count summary always broadcast after a check, even when empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VulnerabilitySummary {
    pub high_risk: usize,
    pub medium_risk: usize,
    pub low_risk: usize,
    pub total: usize,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}

impl VulnerabilitySummary {
    pub fn from_alerts(session_id: &str, alerts: &[VulnerabilityAlert]) -> Self {
        let high_risk = alerts.iter().filter(|a| a.severity == Severity::High).count();
        let medium_risk = alerts
            .iter()
            .filter(|a| a.severity == Severity::Medium)
            .count();
        let low_risk = alerts.iter().filter(|a| a.severity == Severity::Low).count();

        Self {
            high_risk,
            medium_risk,
            low_risk,
            total: alerts.len(),
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Serialize)]
struct CheckRequest<'a> {
    session_id: &'a str,
    os_info: &'a OsInfo,
    software: &'a [SoftwareRecord],
}

#[derive(Deserialize)]
struct CheckResponse {
    #[serde(default)]
    alerts: Vec<VulnerabilityAlert>,
}

pub struct VulnerabilityServiceClient {
    http: reqwest::Client,
    base_url: String,
}

impl VulnerabilityServiceClient {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    /// Match detected software against the vulnerability catalog.
    pub async fn check(
        &self,
        session_id: &str,
        os_info: &OsInfo,
        software: &[SoftwareRecord],
    ) -> Result<Vec<VulnerabilityAlert>, CollaboratorError> {
        let response = self
            .http
            .post(format!("{}/vulnerabilities/check", self.base_url))
            .json(&CheckRequest {
                session_id,
                os_info,
                software,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CollaboratorError::Status {
                service: "vulnerability service",
                status: response.status(),
            });
        }

        let body: CheckResponse = response.json().await?;
        Ok(body.alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(severity: Severity) -> VulnerabilityAlert {
        VulnerabilityAlert {
            id: "v1".into(),
            session_id: "s1".into(),
            severity,
            title: "outdated openssh".into(),
            description: String::new(),
            affected_software: "openssh 7.2".into(),
            technique_id: None,
            mitigation: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn summary_counts_by_severity() {
        let alerts = vec![
            alert(Severity::High),
            alert(Severity::High),
            alert(Severity::Medium),
            alert(Severity::Low),
        ];

        let summary = VulnerabilitySummary::from_alerts("s1", &alerts);
        assert_eq!(summary.high_risk, 2);
        assert_eq!(summary.medium_risk, 1);
        assert_eq!(summary.low_risk, 1);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.session_id, "s1");
    }

    #[test]
    fn empty_summary_is_all_zeroes() {
        let summary = VulnerabilitySummary::from_alerts("s1", &[]);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.high_risk, 0);
    }
}
