//! Software inventory probes
//!
//! Fixed catalog of components checked after OS detection. Each entry
//! lists candidate commands in preference order - version flags first,
//! then the package manager - and the first probe that yields a version
//! wins. Everything runs on auxiliary exec channels and is best effort.

use tracing::debug;

use super::os::PROBE_TIMEOUT;
use crate::clients::vulnerability::SoftwareRecord;
use crate::session::types::OsFamily;
use crate::ssh::HandleController;

struct Probe {
    command: &'static str,
    method: &'static str,
}

struct CatalogEntry {
    name: &'static str,
    software_type: &'static str,
    probes: &'static [Probe],
}

/// Linux catalog. macOS/FreeBSD reuse the version-flag probes and skip
/// the package-manager fallbacks, which simply fail fast there.
const CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        name: "kernel",
        software_type: "kernel",
        probes: &[Probe {
            command: "uname -r",
            method: "uname",
        }],
    },
    CatalogEntry {
        name: "openssh",
        software_type: "service",
        probes: &[
            Probe {
                command: "ssh -V 2>&1",
                method: "version_flag",
            },
            Probe {
                command: "dpkg-query -W -f '${Version}' openssh-server 2>/dev/null",
                method: "dpkg",
            },
            Probe {
                command: "rpm -q --qf '%{VERSION}' openssh-server 2>/dev/null",
                method: "rpm",
            },
        ],
    },
    CatalogEntry {
        name: "bash",
        software_type: "shell",
        probes: &[Probe {
            command: "bash --version 2>&1",
            method: "version_flag",
        }],
    },
    CatalogEntry {
        name: "python",
        software_type: "runtime",
        probes: &[
            Probe {
                command: "python3 --version 2>&1",
                method: "version_flag",
            },
            Probe {
                command: "python --version 2>&1",
                method: "version_flag",
            },
        ],
    },
    CatalogEntry {
        name: "openssl",
        software_type: "library",
        probes: &[Probe {
            command: "openssl version 2>&1",
            method: "version_flag",
        }],
    },
    CatalogEntry {
        name: "nginx",
        software_type: "web_server",
        probes: &[
            Probe {
                command: "nginx -v 2>&1",
                method: "version_flag",
            },
            Probe {
                command: "dpkg-query -W -f '${Version}' nginx 2>/dev/null",
                method: "dpkg",
            },
        ],
    },
    CatalogEntry {
        name: "apache",
        software_type: "web_server",
        probes: &[
            Probe {
                command: "apache2 -v 2>&1",
                method: "version_flag",
            },
            Probe {
                command: "httpd -v 2>&1",
                method: "version_flag",
            },
        ],
    },
    CatalogEntry {
        name: "mysql",
        software_type: "database",
        probes: &[Probe {
            command: "mysql --version 2>&1",
            method: "version_flag",
        }],
    },
    CatalogEntry {
        name: "postgresql",
        software_type: "database",
        probes: &[Probe {
            command: "psql --version 2>&1",
            method: "version_flag",
        }],
    },
    CatalogEntry {
        name: "docker",
        software_type: "container_runtime",
        probes: &[Probe {
            command: "docker --version 2>&1",
            method: "version_flag",
        }],
    },
];

/// Run the catalog for the detected OS family.
pub async fn probe(
    controller: &HandleController,
    family: OsFamily,
    session_id: &str,
) -> Vec<SoftwareRecord> {
    // Windows hosts get no unix probes; the catalog is unix-shaped
    if matches!(family, OsFamily::Windows | OsFamily::Unknown) {
        return Vec::new();
    }

    let mut records = Vec::new();

    for entry in CATALOG {
        for probe in entry.probes {
            let Ok(out) = controller.run_command(probe.command, PROBE_TIMEOUT).await else {
                continue;
            };
            // Some probes print to stderr and exit zero, some package
            // queries exit nonzero on absence - the version pattern is
            // the real signal.
            let Some(version) = extract_version(&out.stdout) else {
                continue;
            };

            debug!(
                "Session {}: {} {} via {}",
                session_id, entry.name, version, probe.method
            );
            records.push(SoftwareRecord {
                name: entry.name.to_string(),
                version,
                software_type: entry.software_type.to_string(),
                detection_method: probe.method.to_string(),
            });
            break;
        }
    }

    records
}

/// Pull the first dotted version number out of probe output, keeping a
/// short alphanumeric suffix (`9.6p1`, `1.24.0`, `5.2.21(1)-release`
/// yields `5.2.21`).
pub(crate) fn extract_version(output: &str) -> Option<String> {
    let bytes = output.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }

        // Candidate start; require at least one dot-separated component
        let start = i;
        let mut j = i;
        let mut dots = 0;
        while j < bytes.len() {
            let b = bytes[j];
            if b.is_ascii_digit() {
                j += 1;
            } else if b == b'.' && j + 1 < bytes.len() && bytes[j + 1].is_ascii_digit() {
                dots += 1;
                j += 1;
            } else {
                break;
            }
        }

        if dots == 0 {
            i = j.max(i + 1);
            continue;
        }

        // Keep a trailing patch marker like "p1"
        let mut end = j;
        while end < bytes.len() && bytes[end].is_ascii_alphanumeric() {
            end += 1;
        }

        return Some(output[start..end].to_string());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_common_version_formats() {
        assert_eq!(
            extract_version("OpenSSH_9.6p1 Ubuntu-3ubuntu13, OpenSSL 3.0.13").as_deref(),
            Some("9.6p1")
        );
        assert_eq!(
            extract_version("GNU bash, version 5.2.21(1)-release").as_deref(),
            Some("5.2.21")
        );
        assert_eq!(extract_version("Python 3.12.3").as_deref(), Some("3.12.3"));
        assert_eq!(
            extract_version("nginx version: nginx/1.24.0").as_deref(),
            Some("1.24.0")
        );
        assert_eq!(
            extract_version("Docker version 26.1.3, build b72abbb").as_deref(),
            Some("26.1.3")
        );
        assert_eq!(
            extract_version("psql (PostgreSQL) 16.3").as_deref(),
            Some("16.3")
        );
        assert_eq!(
            extract_version("5.15.0-91-generic\n").as_deref(),
            Some("5.15.0")
        );
    }

    #[test]
    fn rejects_output_without_versions() {
        assert!(extract_version("command not found").is_none());
        assert!(extract_version("").is_none());
        assert!(extract_version("error 404").is_none());
    }
}
