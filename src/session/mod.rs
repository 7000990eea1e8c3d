//! Session engine - registry, lifecycle, pty loop, recent output
//!
//! The registry exclusively owns sessions; a session exclusively owns
//! its SSH plumbing and attachment list. See the module docs of
//! `registry` and `pty` for the locking and task layout.

pub mod output_ring;
pub mod pty;
pub mod registry;
#[allow(clippy::module_inception)]
mod session;
pub mod types;

pub use output_ring::OutputRing;
pub use pty::{PtyCommand, PumpKind};
pub use registry::{RegistryError, SessionRegistry, SessionUpdate};
pub use session::{Session, SessionError, SessionRuntime};
