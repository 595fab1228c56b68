//! Runtime configuration cells
//!
//! Settings and rules live in watch cells: writers apply transform functions,
//! readers take the latest snapshot, and anyone who cares can subscribe for
//! change notifications.

use crate::models::RuleDefinition;
use crate::tls::CertificateAuthority;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::watch;

/// Current proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Bind address for the listening socket.
    pub host: String,
    pub port: u16,
    /// When true, CONNECT requests are MITM'd instead of tunnelled opaquely.
    pub ssl_decryption_enabled: bool,
    /// Cap on captured/previewed body bytes per leg.
    pub max_body_capture_bytes: usize,
    /// Where root CA artifacts are persisted.
    pub certificate_dir: PathBuf,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9090,
            ssl_decryption_enabled: false,
            max_body_capture_bytes: 512 * 1024,
            certificate_dir: CertificateAuthority::default_certificate_dir(),
        }
    }
}

/// Shared-state cell with latest-value reads, transform updates and change
/// notification.
pub struct WatchCell<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone> WatchCell<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn current(&self) -> T {
        self.tx.borrow().clone()
    }

    pub fn update(&self, transform: impl FnOnce(&mut T)) {
        self.tx.send_modify(transform);
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T: Clone + Default> Default for WatchCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub type SettingsRepository = WatchCell<ProxySettings>;
pub type RuleRepository = WatchCell<Vec<RuleDefinition>>;
