//! Gateway configuration
//!
//! All configuration is environment-driven so the gateway can run unchanged
//! in containers and CI. Required values are validated once at startup;
//! a bad environment is a fatal error (exit code 1), never a silent default.

use std::path::PathBuf;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;

/// Default HTTP listen port
const DEFAULT_PORT: u16 = 8085;
/// Default maximum concurrent sessions
const DEFAULT_MAX_SESSIONS: usize = 20;
/// Default SSH connect timeout (seconds)
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
/// Default WebSocket keep-alive ping interval (seconds)
const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;
/// Default per-write WebSocket deadline (seconds)
const DEFAULT_WRITE_DEADLINE_SECS: u64 = 3;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Runtime configuration for the terminal gateway.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port (`SERVER_PORT`)
    pub server_port: u16,
    /// HS256 secret for bearer-token validation (`JWT_SECRET`)
    pub jwt_secret: String,
    /// Expected `iss` claim (`JWT_ISSUER`)
    pub jwt_issuer: String,
    /// Expected `aud` claim (`JWT_AUDIENCE`)
    pub jwt_audience: String,
    /// Allowed WebSocket origins (`CORS_ALLOWED_ORIGINS`, comma separated)
    pub allowed_origins: Vec<String>,
    /// Directory holding known_hosts and client key material (`SSH_KEY_DIR`)
    pub ssh_key_dir: PathBuf,
    /// Concurrent session cap (`MAX_SESSIONS`)
    pub max_sessions: usize,
    /// SSH dial timeout (`CONNECT_TIMEOUT`, seconds)
    pub connect_timeout: Duration,
    /// WebSocket ping interval (`KEEP_ALIVE_INTERVAL`, seconds)
    pub keep_alive_interval: Duration,
    /// Bound applied to every WebSocket write (`WRITE_DEADLINE`, seconds)
    pub write_deadline: Duration,
    /// Collaborator base URLs
    pub session_service_url: String,
    pub suggestion_service_url: String,
    pub vuln_service_url: String,
    pub rag_agent_url: String,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let jwt_secret = require("JWT_SECRET")?;

        let ssh_key_dir = PathBuf::from(require("SSH_KEY_DIR")?);

        // ENCRYPTION_KEY is consumed by the session service for
        // credential-at-rest; the gateway only refuses to start a
        // production deployment without a usable key.
        if std::env::var("ENVIRONMENT").as_deref() == Ok("production") {
            let raw = require("ENCRYPTION_KEY")?;
            let decoded = BASE64.decode(raw.trim()).map_err(|e| ConfigError::Invalid {
                name: "ENCRYPTION_KEY",
                reason: format!("not valid base64: {e}"),
            })?;
            if decoded.len() != 32 {
                return Err(ConfigError::Invalid {
                    name: "ENCRYPTION_KEY",
                    reason: format!("expected 32 bytes after decoding, got {}", decoded.len()),
                });
            }
        }

        Ok(Self {
            server_port: parse_or("SERVER_PORT", DEFAULT_PORT)?,
            jwt_secret,
            jwt_issuer: optional("JWT_ISSUER").unwrap_or_else(|| "aiss-api".to_string()),
            jwt_audience: optional("JWT_AUDIENCE").unwrap_or_else(|| "aiss-terminal".to_string()),
            allowed_origins: optional("CORS_ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().trim_end_matches('/').to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            ssh_key_dir,
            max_sessions: parse_or("MAX_SESSIONS", DEFAULT_MAX_SESSIONS)?,
            connect_timeout: Duration::from_secs(parse_or(
                "CONNECT_TIMEOUT",
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )?),
            keep_alive_interval: Duration::from_secs(parse_or(
                "KEEP_ALIVE_INTERVAL",
                DEFAULT_KEEP_ALIVE_SECS,
            )?),
            write_deadline: Duration::from_secs(parse_or(
                "WRITE_DEADLINE",
                DEFAULT_WRITE_DEADLINE_SECS,
            )?),
            session_service_url: service_url("SESSION_SERVICE_URL", 8084),
            suggestion_service_url: service_url("SUGGESTION_SERVICE_URL", 8084),
            vuln_service_url: service_url("VULN_SERVICE_URL", 8086),
            rag_agent_url: service_url("RAG_AGENT_URL", 8082),
        })
    }

    /// Path to the TOFU known-hosts file inside `ssh_key_dir`.
    pub fn known_hosts_path(&self) -> PathBuf {
        self.ssh_key_dir.join("known_hosts")
    }

    /// Check an Origin header value against the allow-list.
    ///
    /// An empty allow-list rejects every browser origin; same-process
    /// clients that send no Origin header are always accepted.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(o) => {
                let o = o.trim_end_matches('/');
                self.allowed_origins.iter().any(|a| a == o)
            }
        }
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match optional(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e| ConfigError::Invalid {
            name,
            reason: format!("{e}"),
        }),
    }
}

fn service_url(name: &str, default_port: u16) -> String {
    optional(name).unwrap_or_else(|| format!("http://localhost:{default_port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            server_port: DEFAULT_PORT,
            jwt_secret: "secret".into(),
            jwt_issuer: "aiss-api".into(),
            jwt_audience: "aiss-terminal".into(),
            allowed_origins: vec!["https://app.example.com".into()],
            ssh_key_dir: PathBuf::from("/tmp"),
            max_sessions: 20,
            connect_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(30),
            write_deadline: Duration::from_secs(3),
            session_service_url: String::new(),
            suggestion_service_url: String::new(),
            vuln_service_url: String::new(),
            rag_agent_url: String::new(),
        }
    }

    #[test]
    fn origin_allowed_matches_exact_and_strips_slash() {
        let cfg = test_config();

        assert!(cfg.origin_allowed(Some("https://app.example.com")));
        assert!(cfg.origin_allowed(Some("https://app.example.com/")));
        assert!(!cfg.origin_allowed(Some("https://evil.example.com")));
        // Non-browser clients send no Origin header
        assert!(cfg.origin_allowed(None));
    }

    #[test]
    fn empty_allowlist_rejects_browser_origins() {
        let mut cfg = test_config();
        cfg.allowed_origins.clear();

        assert!(!cfg.origin_allowed(Some("https://app.example.com")));
        assert!(cfg.origin_allowed(None));
    }
}
