//! proxyscope: a local intercepting HTTP(S) proxy for traffic inspection.
//!
//! The proxy accepts connections on a configurable local port, records every
//! exchange into a bounded in-memory store, and can decrypt HTTPS traffic by
//! minting per-host certificates from a locally generated root CA. A rule
//! engine mutates requests and responses in flight, and WebSocket upgrades
//! are relayed frame by frame with both directions captured.
//!
//! Entry point is [`ProxyRuntime`]: configure it through its settings cell,
//! call [`ProxyRuntime::start`], and observe traffic via the session store.

pub mod codec;
pub mod logging;
pub mod models;
pub mod proxy;
pub mod rules;
pub mod settings;
pub mod storage;
pub mod tls;

pub use proxy::{ProxyRuntime, ProxyState};
pub use settings::ProxySettings;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
