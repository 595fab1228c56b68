//! Root certificate distribution
//!
//! Clients trust the interception root by downloading it from the proxy
//! itself: any plain-HTTP request to `/SSL` on a recognized host serves the
//! root certificate PEM. The synthetic hostname resolves through the proxy
//! only, so onboarding instructions work regardless of how the device reaches
//! the listener.

use crate::settings::ProxySettings;
use crate::tls::authority::{normalize_hostname, CertificateAuthority};
use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;

/// Hostname intercepted by the proxy itself; never resolved via DNS.
pub const INTERNAL_CERT_HOST: &str = "cmp-proxy";

/// Path that serves the root certificate.
pub const CERT_ROUTE_PATH: &str = "/SSL";

pub struct CertificateDistributionService {
    authority: Arc<CertificateAuthority>,
}

impl CertificateDistributionService {
    pub fn new(authority: Arc<CertificateAuthority>) -> Self {
        Self { authority }
    }

    /// Root certificate PEM, generating the root pair first if absent.
    pub fn root_certificate_pem(&self) -> anyhow::Result<String> {
        self.authority.read_root_certificate_pem()
    }

    /// Root certificate PEM if one already exists on disk; never generates.
    pub fn existing_root_certificate_pem(&self) -> anyhow::Result<Option<String>> {
        self.authority.root_certificate_pem_if_present()
    }

    /// URLs a client on this machine or the local network can use to fetch
    /// the root certificate through the proxy.
    pub fn onboarding_urls(&self, settings: &ProxySettings) -> Vec<String> {
        let mut urls = vec![
            format!("http://{}:{}{}", INTERNAL_CERT_HOST, settings.port, CERT_ROUTE_PATH),
            format!("http://{}:{}{}", settings.host, settings.port, CERT_ROUTE_PATH),
        ];
        if let Some(ip) = detect_lan_ip() {
            let url = format!("http://{}:{}{}", ip, settings.port, CERT_ROUTE_PATH);
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        urls
    }
}

/// Whether a request Host header refers to the proxy's own certificate
/// endpoint. Matches the synthetic hostname, loopback spellings, the
/// configured bind host and the machine's LAN address.
pub fn is_certificate_host(host: &str, settings: &ProxySettings) -> bool {
    let host = normalize_hostname(host);
    if host == INTERNAL_CERT_HOST
        || host == "localhost"
        || host == "127.0.0.1"
        || host == "::1"
        || host == "[::1]"
    {
        return true;
    }
    if host == normalize_hostname(&settings.host) {
        return true;
    }
    matches!(detect_lan_ip(), Some(ip) if host == ip.to_string())
}

/// Best-effort local network address. Opens a UDP socket and "connects" it to
/// a public address to learn which interface the OS would route through; no
/// packets are sent.
pub fn detect_lan_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("8.8.8.8", 80)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_loopback() || ip.is_unspecified() {
        None
    } else {
        Some(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_and_loopback_hosts_are_recognized() {
        let settings = ProxySettings::default();
        assert!(is_certificate_host("cmp-proxy", &settings));
        assert!(is_certificate_host("CMP-PROXY", &settings));
        assert!(is_certificate_host("localhost", &settings));
        assert!(is_certificate_host("127.0.0.1", &settings));
        assert!(!is_certificate_host("example.com", &settings));
    }

    #[test]
    fn configured_bind_host_is_recognized() {
        let settings = ProxySettings {
            host: "0.0.0.0".to_string(),
            ..ProxySettings::default()
        };
        assert!(is_certificate_host("0.0.0.0", &settings));
    }

    #[test]
    fn onboarding_urls_lead_with_the_synthetic_host() {
        let authority = Arc::new(CertificateAuthority::new(
            std::env::temp_dir().join("proxyscope-dist-test"),
        ));
        let service = CertificateDistributionService::new(authority);
        let urls = service.onboarding_urls(&ProxySettings::default());
        assert_eq!(urls[0], "http://cmp-proxy:9090/SSL");
        assert!(urls.contains(&"http://127.0.0.1:9090/SSL".to_string()));
    }
}
