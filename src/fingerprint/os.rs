//! Remote OS detection
//!
//! Ordered probe pipeline over auxiliary exec channels:
//!
//! 1. `cmd.exe /c ver` - a hit means Windows; parse the version cohort.
//! 2. `/etc/os-release` - NAME / VERSION_ID / ID for modern Linux.
//! 3. `uname -a` - classify macOS / FreeBSD / Linux; for Linux, refine
//!    via `/etc/redhat-release` then `/etc/debian_version`.
//!
//! Every probe failing leaves the OS as Unknown; detection is best
//! effort and never fails the session.

use std::time::Duration;

use tracing::debug;

use crate::session::types::{OsFamily, OsInfo};
use crate::ssh::HandleController;

/// Per-probe command timeout.
pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn detect(controller: &HandleController, session_id: &str) -> OsInfo {
    // Windows first: on anything else "cmd.exe" fails fast
    if let Ok(out) = controller.run_command("cmd.exe /c ver", PROBE_TIMEOUT).await {
        if out.succeeded() {
            if let Some(info) = parse_windows_ver(&out.stdout) {
                debug!("Session {}: OS probe hit windows ({})", session_id, info.version);
                return info;
            }
        }
    }

    if let Ok(out) = controller
        .run_command("cat /etc/os-release", PROBE_TIMEOUT)
        .await
    {
        if out.succeeded() {
            if let Some(info) = parse_os_release(&out.stdout) {
                debug!("Session {}: OS probe hit os-release ({})", session_id, info.label());
                return info;
            }
        }
    }

    if let Ok(out) = controller.run_command("uname -a", PROBE_TIMEOUT).await {
        if out.succeeded() {
            if let Some(mut info) = classify_uname(&out.stdout) {
                if info.family == OsFamily::Linux {
                    refine_linux(controller, &mut info).await;
                }
                debug!("Session {}: OS probe hit uname ({})", session_id, info.label());
                return info;
            }
        }
    }

    debug!("Session {}: all OS probes failed", session_id);
    OsInfo::unknown()
}

/// Older distributions without os-release: redhat-release first, then
/// debian_version.
async fn refine_linux(controller: &HandleController, info: &mut OsInfo) {
    if let Ok(out) = controller
        .run_command("cat /etc/redhat-release", PROBE_TIMEOUT)
        .await
    {
        if out.succeeded() {
            if let Some((distro, version)) = parse_redhat_release(&out.stdout) {
                info.distribution = Some(distro);
                info.version = version;
                return;
            }
        }
    }

    if let Ok(out) = controller
        .run_command("cat /etc/debian_version", PROBE_TIMEOUT)
        .await
    {
        if out.succeeded() {
            let version = out.stdout.trim();
            if !version.is_empty() {
                info.distribution = Some("Debian".to_string());
                info.version = version.to_string();
            }
        }
    }
}

/// `Microsoft Windows [Version 10.0.19045.3570]`
pub(crate) fn parse_windows_ver(output: &str) -> Option<OsInfo> {
    let line = output.lines().find(|l| l.contains("Windows"))?;
    let version = line
        .split(['[', ']'])
        .find(|part| part.starts_with("Version"))
        .and_then(|part| part.strip_prefix("Version"))
        .map(|v| v.trim().to_string())
        .unwrap_or_default();

    Some(OsInfo {
        family: OsFamily::Windows,
        version,
        distribution: Some("Windows".to_string()),
    })
}

/// Parse the NAME / VERSION_ID / VERSION / ID fields of os-release.
pub(crate) fn parse_os_release(content: &str) -> Option<OsInfo> {
    let mut name = None;
    let mut version_id = None;
    let mut version = None;
    let mut id = None;

    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "NAME" => name = Some(value),
            "VERSION_ID" => version_id = Some(value),
            "VERSION" => version = Some(value),
            "ID" => id = Some(value),
            _ => {}
        }
    }

    let distribution = name.or(id)?;
    let version = version_id
        .or_else(|| {
            version.map(|v| {
                v.split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_string()
            })
        })
        .unwrap_or_default();

    Some(OsInfo {
        family: OsFamily::Linux,
        version,
        distribution: Some(distribution),
    })
}

/// Classify a `uname -a` line by kernel name; the release field becomes
/// the version.
pub(crate) fn classify_uname(output: &str) -> Option<OsInfo> {
    let line = output.trim();
    if line.is_empty() {
        return None;
    }
    let release = line.split_whitespace().nth(2).unwrap_or_default().to_string();

    let family = if line.starts_with("Darwin") {
        OsFamily::Macos
    } else if line.starts_with("FreeBSD") {
        OsFamily::Freebsd
    } else if line.starts_with("Linux") {
        OsFamily::Linux
    } else {
        return None;
    };

    Some(OsInfo {
        family,
        version: release,
        distribution: None,
    })
}

/// `CentOS Linux release 7.9.2009 (Core)` -> ("CentOS Linux", "7.9.2009")
pub(crate) fn parse_redhat_release(content: &str) -> Option<(String, String)> {
    let line = content.lines().next()?.trim();
    let (distro, rest) = line.split_once(" release ")?;
    let version = rest.split_whitespace().next()?.to_string();
    Some((distro.trim().to_string(), version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_ver_parses_cohort() {
        let info =
            parse_windows_ver("\nMicrosoft Windows [Version 10.0.19045.3570]\n").unwrap();
        assert_eq!(info.family, OsFamily::Windows);
        assert_eq!(info.version, "10.0.19045.3570");
        assert_eq!(info.label(), "Windows 10.0.19045.3570");
    }

    #[test]
    fn windows_ver_rejects_unix_noise() {
        assert!(parse_windows_ver("sh: cmd.exe: command not found").is_none());
    }

    #[test]
    fn os_release_prefers_version_id() {
        let content = r#"
NAME="Ubuntu"
VERSION="22.04.3 LTS (Jammy Jellyfish)"
ID=ubuntu
VERSION_ID="22.04"
"#;
        let info = parse_os_release(content).unwrap();
        assert_eq!(info.distribution.as_deref(), Some("Ubuntu"));
        assert_eq!(info.version, "22.04");
        assert_eq!(info.label(), "Ubuntu 22.04");
    }

    #[test]
    fn os_release_falls_back_to_version_field() {
        let content = "NAME=\"Arch Linux\"\nID=arch\nVERSION=\"rolling\"\n";
        let info = parse_os_release(content).unwrap();
        assert_eq!(info.version, "rolling");
    }

    #[test]
    fn uname_classification() {
        let linux = classify_uname(
            "Linux web01 5.15.0-91-generic #101-Ubuntu SMP x86_64 GNU/Linux",
        )
        .unwrap();
        assert_eq!(linux.family, OsFamily::Linux);
        assert_eq!(linux.version, "5.15.0-91-generic");

        let mac =
            classify_uname("Darwin mbp.local 23.2.0 Darwin Kernel Version 23.2.0 arm64").unwrap();
        assert_eq!(mac.family, OsFamily::Macos);

        let bsd = classify_uname("FreeBSD gw 13.2-RELEASE FreeBSD 13.2-RELEASE amd64").unwrap();
        assert_eq!(bsd.family, OsFamily::Freebsd);

        assert!(classify_uname("SunOS sol 5.11").is_none());
        assert!(classify_uname("").is_none());
    }

    #[test]
    fn redhat_release_line() {
        let (distro, version) =
            parse_redhat_release("CentOS Linux release 7.9.2009 (Core)").unwrap();
        assert_eq!(distro, "CentOS Linux");
        assert_eq!(version, "7.9.2009");

        assert!(parse_redhat_release("cat: /etc/redhat-release: No such file").is_none());
    }
}
