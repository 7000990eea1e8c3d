//! Known-hosts store with trust-on-first-use semantics
//!
//! The store file lives in the gateway's key directory, never in a user
//! home. First contact appends the offered key and logs a security
//! warning; every later contact must match byte-for-byte. A changed key
//! aborts the connection - there is no accept-anyway mode. Removing a
//! stale key (`remove_host`) is the administrative override.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches the stored entry
    Verified,
    /// Host not seen before (first contact)
    Unknown { fingerprint: String },
    /// Key differs from the stored entry (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// Stored entry: (key_type, base64_key)
#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// File-backed known-hosts set shared by all dialers.
pub struct KnownHostsStore {
    /// Cache of host -> keys (multiple key types per host are allowed)
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    /// Path to the known_hosts file
    path: PathBuf,
}

impl KnownHostsStore {
    /// Open (or create) the store at `path`.
    ///
    /// The parent directory must already exist - a gateway without a
    /// configured key directory must not dial at all. File permissions
    /// are forced to owner read/write only.
    pub fn open(path: PathBuf) -> Result<Self, SshError> {
        let parent = path
            .parent()
            .ok_or_else(|| SshError::KeyError("known_hosts path has no parent".to_string()))?;
        if !parent.is_dir() {
            return Err(SshError::KeyError(format!(
                "SSH key directory {} does not exist",
                parent.display()
            )));
        }

        if !path.exists() {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&path)
                .map_err(SshError::IoError)?;
            drop(file);
        }
        restrict_permissions(&path)?;

        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path,
        };
        store.load()?;
        Ok(store)
    }

    /// Load all entries from the file into the in-memory cache.
    fn load(&self) -> Result<(), SshError> {
        let file = fs::File::open(&self.path).map_err(SshError::IoError)?;
        let reader = BufReader::new(file);
        let mut hosts = self.hosts.write();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line.map_err(SshError::IoError)?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // Format: hostname keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                let normalized = Self::normalize_hostname(hostname);
                hosts.entry(normalized).or_default().push(entry.clone());
                entry_count += 1;
            }
        }

        info!(
            "Loaded {} known host entries ({} unique hosts) from {}",
            entry_count,
            hosts.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Normalize hostname for lookup: `[host]:port` keeps its port
    /// marker, bare hostnames are lowercased.
    fn normalize_hostname(host: &str) -> String {
        host.trim().to_lowercase()
    }

    /// Lookup key for host:port. Port 22 is stored bare, everything else
    /// in the `[host]:port` form, matching OpenSSH.
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// SHA256 fingerprint of a public key, OpenSSH presentation.
    pub fn fingerprint(key: &PublicKey) -> String {
        Self::fingerprint_bytes(&key.public_key_bytes())
    }

    fn fingerprint_bytes(key_bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key_bytes);
        let hash = hasher.finalize();
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    /// Verify a host's offered public key against the store.
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_key_b64 = BASE64.encode(key.public_key_bytes());
        let actual_key_type = key.algorithm().to_string();
        let fingerprint = Self::fingerprint(key);

        let hosts = self.hosts.read();
        let Some(entries) = hosts.get(&lookup_key) else {
            debug!("Unknown host: {}", lookup_key);
            return HostKeyVerification::Unknown { fingerprint };
        };

        for entry in entries {
            if entry.key_type != actual_key_type {
                continue;
            }
            if entry.key_data == actual_key_b64 {
                debug!(
                    "Host key verified for {} (type: {})",
                    lookup_key, actual_key_type
                );
                return HostKeyVerification::Verified;
            }
            let expected_fingerprint = Self::fingerprint_from_b64(&entry.key_data);
            warn!(
                "HOST KEY CHANGED for {} (type: {})! Expected {}, got {}",
                lookup_key, actual_key_type, expected_fingerprint, fingerprint
            );
            return HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint: fingerprint,
            };
        }

        // Host known, but not for this key type
        debug!(
            "Host {} known but no {} key stored, treating as first contact",
            lookup_key, actual_key_type
        );
        HostKeyVerification::Unknown { fingerprint }
    }

    fn fingerprint_from_b64(stored_b64: &str) -> String {
        match BASE64.decode(stored_b64) {
            Ok(bytes) => Self::fingerprint_bytes(&bytes),
            Err(_) => "unknown".to_string(),
        }
    }

    /// Record a first-contact key: cache plus append to the store file.
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        let lookup_key = Self::make_key(host, port);
        let key_b64 = BASE64.encode(key.public_key_bytes());
        let key_type = key.algorithm().to_string();

        {
            let mut hosts = self.hosts.write();
            hosts.entry(lookup_key.clone()).or_default().push(HostKeyEntry {
                key_type: key_type.clone(),
                key_data: key_b64.clone(),
            });
        }

        self.append_to_file(&lookup_key, &key_type, &key_b64)?;

        warn!(
            "TOFU: recorded new host key for {} (type: {}, fingerprint: {})",
            lookup_key,
            key_type,
            Self::fingerprint(key)
        );
        Ok(())
    }

    fn append_to_file(&self, host: &str, key_type: &str, key_b64: &str) -> Result<(), SshError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(SshError::IoError)?;
        restrict_permissions(&self.path)?;

        writeln!(file, "{} {} {}", host, key_type, key_b64).map_err(SshError::IoError)?;
        Ok(())
    }

    /// Administrative override for key rotation: forget a host entirely.
    pub fn remove_host(&self, host: &str, port: u16) -> Result<(), SshError> {
        let lookup_key = Self::make_key(host, port);

        {
            let mut hosts = self.hosts.write();
            hosts.remove(&lookup_key);
        }

        self.rewrite_without_host(&lookup_key)?;

        info!("Removed host key for {} from known_hosts", lookup_key);
        Ok(())
    }

    fn rewrite_without_host(&self, remove_host: &str) -> Result<(), SshError> {
        if !self.path.exists() {
            return Ok(());
        }

        let content = fs::read_to_string(&self.path).map_err(SshError::IoError)?;
        let filtered: Vec<&str> = content
            .lines()
            .filter(|line| {
                let parts: Vec<&str> = line.split_whitespace().collect();
                if parts.is_empty() {
                    return true;
                }
                !parts[0]
                    .split(',')
                    .any(|h| Self::normalize_hostname(h) == remove_host)
            })
            .collect();

        fs::write(&self.path, filtered.join("\n") + "\n").map_err(SshError::IoError)?;
        restrict_permissions(&self.path)?;
        Ok(())
    }

    /// Number of hosts currently cached (for diagnostics and tests).
    pub fn host_count(&self) -> usize {
        self.hosts.read().len()
    }
}

/// Force owner read/write only (0600) on the store file.
#[cfg(unix)]
fn restrict_permissions(path: &std::path::Path) -> Result<(), SshError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path).map_err(SshError::IoError)?;
    let mut perms = metadata.permissions();
    if perms.mode() & 0o777 != 0o600 {
        perms.set_mode(0o600);
        fs::set_permissions(path, perms).map_err(SshError::IoError)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &std::path::Path) -> Result<(), SshError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn make_key_formats_ports() {
        assert_eq!(KnownHostsStore::make_key("example.com", 22), "example.com");
        assert_eq!(
            KnownHostsStore::make_key("Example.com", 2222),
            "[example.com]:2222"
        );
    }

    #[test]
    fn open_requires_parent_directory() {
        let err = KnownHostsStore::open(PathBuf::from("/nonexistent-dir/known_hosts"));
        assert!(err.is_err());
    }

    #[test]
    fn open_creates_file_with_owner_only_permissions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");

        let store = KnownHostsStore::open(path.clone()).unwrap();
        assert_eq!(store.host_count(), 0);
        assert!(path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn load_parses_existing_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(
            &path,
            "# comment\nexample.com ssh-ed25519 QUFBQQ==\n[alt.example.com]:2222 ssh-rsa QkJCQg==\n",
        )
        .unwrap();

        let store = KnownHostsStore::open(path).unwrap();
        assert_eq!(store.host_count(), 2);
    }

    const KEY_A: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";
    const KEY_B: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAfuCHKVTjquxvt6CM6tdG4SLp1Btn/nOeHHE5UOzRdf";

    fn parse_key(openssh: &str) -> PublicKey {
        PublicKey::from_openssh(openssh).unwrap()
    }

    #[test]
    fn tofu_first_contact_then_match_then_mismatch() {
        let dir = tempdir().unwrap();
        let store = KnownHostsStore::open(dir.path().join("known_hosts")).unwrap();
        let key_a = parse_key(KEY_A);
        let key_b = parse_key(KEY_B);

        // First contact: unknown
        assert!(matches!(
            store.verify("host.example.com", 22, &key_a),
            HostKeyVerification::Unknown { .. }
        ));

        store.add_host("host.example.com", 22, &key_a).unwrap();

        // Second contact with the same key: verified
        assert_eq!(
            store.verify("host.example.com", 22, &key_a),
            HostKeyVerification::Verified
        );

        // A different key for the same host must be flagged, not stored
        assert!(matches!(
            store.verify("host.example.com", 22, &key_b),
            HostKeyVerification::Changed { .. }
        ));
        assert_eq!(
            store.verify("host.example.com", 22, &key_a),
            HostKeyVerification::Verified
        );
    }

    #[test]
    fn accepted_keys_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let key_a = parse_key(KEY_A);

        {
            let store = KnownHostsStore::open(path.clone()).unwrap();
            store.add_host("host.example.com", 2200, &key_a).unwrap();
        }

        let reopened = KnownHostsStore::open(path).unwrap();
        assert_eq!(
            reopened.verify("host.example.com", 2200, &key_a),
            HostKeyVerification::Verified
        );
    }

    #[test]
    fn remove_host_rewrites_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(
            &path,
            "example.com ssh-ed25519 QUFBQQ==\nother.example.com ssh-ed25519 QkJCQg==\n",
        )
        .unwrap();

        let store = KnownHostsStore::open(path.clone()).unwrap();
        store.remove_host("example.com", 22).unwrap();

        assert_eq!(store.host_count(), 1);
        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.contains("QUFBQQ=="));
        assert!(content.contains("other.example.com"));
    }
}
