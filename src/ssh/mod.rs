//! SSH layer - dialing, host-key trust, pty allocation, auxiliary exec
//!
//! Built on russh. Host keys are verified with trust-on-first-use against
//! an owner-only known_hosts file; a changed key always aborts the
//! connection. The `Handle` returned by a successful dial is owned by a
//! single task (see `exec`), everything else talks to it through a
//! controller channel.

mod client;
mod config;
mod error;
mod exec;
pub mod known_hosts;

pub use client::{DialOutcome, SshClient};
pub use config::{AuthMethod, DialConfig};
pub use error::SshError;
pub use exec::{spawn_handle_owner, CommandOutput, HandleCommand, HandleController};
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
