//! Intercepting proxy server: listener lifecycle, CONNECT handling and
//! WebSocket relay.

pub mod runtime;
pub mod websocket;

pub use runtime::{ProxyRuntime, ProxyState};
