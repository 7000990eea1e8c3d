//! termgate - the AISS terminal gateway
//!
//! An interactive multi-client SSH proxy: browser WebSocket clients
//! attach to server-side SSH sessions, share one pty with ordered
//! input and fanned-out output, and get pause/resume, query-mode RAG
//! routing, gated suggestion execution, and post-connect fingerprinting
//! on top.

// mimalloc keeps latency steady under the high-frequency small
// allocations of pty chunks and WebSocket frames
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod api;
pub mod auth;
pub mod clients;
pub mod config;
pub mod fingerprint;
pub mod query;
pub mod session;
pub mod ssh;
pub mod suggest;
pub mod ws;
