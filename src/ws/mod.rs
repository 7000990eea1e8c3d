//! WebSocket surface - wire protocol, fan-out, connection handling

pub mod handler;
pub mod mux;
pub mod protocol;
