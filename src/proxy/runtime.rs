//! Proxy runtime: listener lifecycle and per-connection handling.
//!
//! Each accepted connection is parsed for one request. CONNECT requests are
//! either tunnelled opaquely or TLS-intercepted with a minted certificate;
//! everything else is proxied as a serial HTTP/1.1 exchange with the rule
//! engine applied to both legs. Requests addressed to the proxy itself serve
//! the root certificate download route.

use crate::codec::http1::{self, ConnectTarget};
use crate::codec::preview;
use crate::models::session::header_value;
use crate::models::{
    CapturedRequest, CapturedResponse, CapturedSession, HeaderEntry, ParsedRequest,
    RuleMatchContext, UpstreamResponse,
};
use crate::proxy::websocket::{self, Prefixed};
use crate::rules;
use crate::settings::{ProxySettings, RuleRepository, SettingsRepository};
use crate::storage::SessionStore;
use crate::tls::authority::normalize_hostname;
use crate::tls::distribution::{is_certificate_host, CERT_ROUTE_PATH, INTERNAL_CERT_HOST};
use crate::tls::{CertificateAuthority, CertificateDistributionService};
use anyhow::{anyhow, Context};
use once_cell::sync::Lazy;
use rustls::client::ClientConfig;
use rustls::pki_types::ServerName;
use rustls::server::ServerConfig;
use rustls::RootCertStore;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};

#[cfg(test)]
use std::future::Future;
#[cfg(test)]
use std::sync::Mutex;
#[cfg(test)]
use tokio::io::DuplexStream;

/// Per-read timeout on both the client and upstream sockets.
const READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for establishing the upstream connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

static UPSTREAM_TLS_CONFIG: Lazy<Arc<ClientConfig>> = Lazy::new(|| {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
});

/// Observable listener state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Stopped,
    Listening(SocketAddr),
}

struct Listening {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

struct RuntimeInner {
    settings: SettingsRepository,
    rules: RuleRepository,
    store: Arc<SessionStore>,
    authority: Arc<CertificateAuthority>,
    distribution: CertificateDistributionService,
    /// Port actually bound (may differ from settings when binding port 0).
    active_port: AtomicU16,
    lifecycle: tokio::sync::Mutex<Option<Listening>>,
}

/// Handle to one proxy instance. Cheap to clone via the shared inner state;
/// all configuration is live-updatable through the watch cells.
pub struct ProxyRuntime {
    inner: Arc<RuntimeInner>,
}

impl ProxyRuntime {
    pub fn new(settings: ProxySettings) -> Self {
        let authority = Arc::new(CertificateAuthority::new(settings.certificate_dir.clone()));
        Self {
            inner: Arc::new(RuntimeInner {
                settings: SettingsRepository::new(settings),
                rules: RuleRepository::default(),
                store: Arc::new(SessionStore::new()),
                distribution: CertificateDistributionService::new(authority.clone()),
                authority,
                active_port: AtomicU16::new(0),
                lifecycle: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &SettingsRepository {
        &self.inner.settings
    }

    pub fn rules(&self) -> &RuleRepository {
        &self.inner.rules
    }

    pub fn sessions(&self) -> Arc<SessionStore> {
        self.inner.store.clone()
    }

    pub fn distribution(&self) -> &CertificateDistributionService {
        &self.inner.distribution
    }

    /// Bind the listener and start accepting. Idempotent: if already
    /// listening, returns the current address without rebinding.
    pub async fn start(&self) -> anyhow::Result<SocketAddr> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if let Some(listening) = lifecycle.as_ref() {
            return Ok(listening.local_addr);
        }

        let settings = self.inner.settings.current();
        let listener = TcpListener::bind((settings.host.as_str(), settings.port))
            .await
            .with_context(|| format!("binding {}:{}", settings.host, settings.port))?;
        let local_addr = listener.local_addr().context("reading listener address")?;

        if local_addr.ip().is_loopback() {
            if let Some(lan_ip) = crate::tls::distribution::detect_lan_ip() {
                tracing::warn!(
                    "Listening on loopback only; devices on the local network cannot reach the proxy. Bind {lan_ip} (or 0.0.0.0) to share it"
                );
            }
        }

        if settings.ssl_decryption_enabled {
            if let Err(err) = self.inner.authority.ensure_certificate_material() {
                tracing::warn!("Root CA unavailable ({err:#}); CONNECT tunnels will not be decrypted");
            }
        }

        self.inner.active_port.store(local_addr.port(), Ordering::Relaxed);
        let inner = self.inner.clone();
        let accept_task = tokio::spawn(accept_loop(inner, listener));
        *lifecycle = Some(Listening {
            local_addr,
            accept_task,
        });
        tracing::info!("Proxy listening on {local_addr}");
        Ok(local_addr)
    }

    /// Stop accepting new connections. In-flight exchanges are left to run to
    /// completion. Idempotent.
    pub async fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if let Some(listening) = lifecycle.take() {
            listening.accept_task.abort();
            let _ = listening.accept_task.await;
            self.inner.active_port.store(0, Ordering::Relaxed);
            tracing::info!("Proxy stopped");
        }
    }

    pub async fn state(&self) -> ProxyState {
        match self.inner.lifecycle.lock().await.as_ref() {
            Some(listening) => ProxyState::Listening(listening.local_addr),
            None => ProxyState::Stopped,
        }
    }
}

impl Default for ProxyRuntime {
    fn default() -> Self {
        Self::new(ProxySettings::default())
    }
}

impl Clone for ProxyRuntime {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

async fn accept_loop(inner: Arc<RuntimeInner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let inner = inner.clone();
                tokio::spawn(async move {
                    handle_connection(inner, stream, peer).await;
                });
            }
            Err(err) => {
                tracing::warn!("Accept failed: {err}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(inner: Arc<RuntimeInner>, mut stream: TcpStream, peer: SocketAddr) {
    let request = match timeout(READ_TIMEOUT, http1::parse_request(&mut stream)).await {
        Err(_) => {
            tracing::debug!("Client {peer} idle; closing");
            return;
        }
        Ok(Ok(None)) => return,
        Ok(Ok(Some(request))) => request,
        Ok(Err(err)) => {
            respond_with_status(&mut stream, 400, "Bad Request", &err.to_string()).await;
            let mut session = CapturedSession::new(CapturedRequest {
                method: "UNKNOWN".to_string(),
                url: String::new(),
                headers: Vec::new(),
                body_preview: None,
            });
            session.error = Some(format!("malformed request: {err}"));
            inner.store.upsert(session);
            return;
        }
    };

    if request.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(inner, stream, request).await;
        return;
    }

    let settings = inner.settings.current();
    let (scheme, host, port) = match resolve_http_target(&request) {
        Some(target) => target,
        None => {
            respond_with_status(&mut stream, 400, "Bad Request", "missing or invalid host").await;
            let mut session = CapturedSession::new(capture_request(
                &request,
                &request.target,
                settings.max_body_capture_bytes,
            ));
            session.error = Some("request target could not be resolved to a host".to_string());
            inner.store.upsert(session);
            return;
        }
    };

    if is_own_endpoint(&inner, &host, port, &settings) {
        serve_certificate_route(&inner, &mut stream, &request, &settings).await;
        let _ = stream.shutdown().await;
        return;
    }

    if is_upgrade_request(&request.headers) {
        relay_websocket(inner, stream, request, &host, port, scheme == "https").await;
        return;
    }

    exchange(&inner, &mut stream, request, scheme, &host, port).await;
    let _ = stream.shutdown().await;
}

/// One serial request/response exchange with the rule engine applied on both
/// legs. Records exactly one session, success or failure.
async fn exchange<S>(
    inner: &Arc<RuntimeInner>,
    client: &mut S,
    request: ParsedRequest,
    scheme: &str,
    host: &str,
    port: u16,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();
    let settings = inner.settings.current();
    let active_rules = inner.rules.current();

    let context = RuleMatchContext {
        scheme: scheme.to_string(),
        host: host.to_string(),
        path: request.path().to_string(),
        port,
    };
    let (request, request_traces) = rules::apply_request_rules(&active_rules, &context, &request);

    let url = format_url(scheme, host, port, origin_form(&request.target));
    let mut session =
        CapturedSession::new(capture_request(&request, &url, settings.max_body_capture_bytes));

    let mut upstream =
        match with_timeout(CONNECT_TIMEOUT, connect_upstream(host, port, scheme == "https")).await {
            Ok(upstream) => upstream,
            Err(err) => {
                respond_with_status(client, 502, "Bad Gateway", "upstream connection failed").await;
                session.error = Some(format!("connecting to {host}:{port}: {err:#}"));
                session.duration_millis = started.elapsed().as_millis() as u64;
                inner.store.upsert(session);
                return;
            }
        };

    let outbound = http1::serialize_request(
        &request.method,
        origin_form(&request.target),
        &request.headers,
        &request.body,
    );
    if let Err(err) = write_all_flush(&mut upstream, &outbound).await {
        respond_with_status(client, 502, "Bad Gateway", "upstream write failed").await;
        session.error = Some(format!("writing to {host}:{port}: {err}"));
        session.duration_millis = started.elapsed().as_millis() as u64;
        inner.store.upsert(session);
        return;
    }

    let response: UpstreamResponse =
        match with_timeout(READ_TIMEOUT, http1::read_response(&mut upstream)).await {
            Ok(response) => response,
            Err(err) => {
                respond_with_status(client, 502, "Bad Gateway", "upstream read failed").await;
                session.error = Some(format!("reading response from {host}:{port}: {err:#}"));
                session.duration_millis = started.elapsed().as_millis() as u64;
                inner.store.upsert(session);
                return;
            }
        };

    let (response, response_traces) =
        rules::apply_response_rules(&active_rules, &context, &response);
    session.applied_rules = rules::merge_traces(&request_traces, &response_traces);
    session.response = Some(capture_response(&response, settings.max_body_capture_bytes));

    if let Err(err) = write_all_flush(client, &http1::serialize_response(&response)).await {
        session.error = Some(format!("writing response to client: {err}"));
    }
    session.duration_millis = started.elapsed().as_millis() as u64;
    inner.store.upsert(session);
}

async fn handle_connect(inner: Arc<RuntimeInner>, mut stream: TcpStream, request: ParsedRequest) {
    let target = match http1::parse_connect_target(&request.target) {
        Some(target) => target,
        None => {
            respond_with_status(&mut stream, 400, "Bad Request", "invalid CONNECT target").await;
            let mut session = CapturedSession::new(CapturedRequest {
                method: "CONNECT".to_string(),
                url: request.target.clone(),
                headers: request.headers.clone(),
                body_preview: None,
            });
            session.error = Some(format!("invalid CONNECT target {:?}", request.target));
            inner.store.upsert(session);
            return;
        }
    };

    let settings = inner.settings.current();
    if !settings.ssl_decryption_enabled {
        passthrough(inner, stream, target).await;
        return;
    }

    match inner.authority.server_config_for_host(&target.host) {
        Ok(config) => run_mitm(inner, stream, target, config).await,
        Err(err) => {
            tracing::warn!(
                "Certificate issuance for {} failed ({err:#}); tunnelling without decryption",
                target.host
            );
            passthrough(inner, stream, target).await;
        }
    }
}

/// Opaque CONNECT tunnel. Only failed tunnels leave a session behind.
async fn passthrough(inner: Arc<RuntimeInner>, mut client: TcpStream, target: ConnectTarget) {
    let started = Instant::now();
    let mut upstream = match timeout(
        CONNECT_TIMEOUT,
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(err)) => {
            respond_with_status(&mut client, 502, "Bad Gateway", "upstream connection failed")
                .await;
            record_connect_session(
                &inner,
                &target,
                Some(format!("connecting to {}: {err}", target.authority)),
                started,
            );
            return;
        }
        Err(_) => {
            respond_with_status(&mut client, 502, "Bad Gateway", "upstream connection timed out")
                .await;
            record_connect_session(
                &inner,
                &target,
                Some(format!("connecting to {}: timed out", target.authority)),
                started,
            );
            return;
        }
    };

    if write_all_flush(&mut client, ESTABLISHED).await.is_err() {
        return;
    }

    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => {
            tracing::debug!(
                "Tunnel to {} closed ({sent} bytes up, {received} bytes down)",
                target.authority
            );
        }
        Err(err) => {
            record_connect_session(
                &inner,
                &target,
                Some(format!("tunnel to {} failed: {err}", target.authority)),
                started,
            );
        }
    }
}

/// Decrypting CONNECT path: complete the client handshake with a minted leaf,
/// then handle the inner requests as plain exchanges. A CONNECT-level session
/// is recorded only when no inner exchange produced one.
async fn run_mitm(
    inner: Arc<RuntimeInner>,
    mut stream: TcpStream,
    target: ConnectTarget,
    config: Arc<ServerConfig>,
) {
    let started = Instant::now();
    if write_all_flush(&mut stream, ESTABLISHED).await.is_err() {
        return;
    }

    let acceptor = TlsAcceptor::from(config);
    let mut tls = match acceptor.accept(stream).await {
        Ok(tls) => tls,
        Err(err) => {
            // The client rejected our certificate (or spoke something else).
            tracing::debug!("TLS handshake with client failed for {}: {err}", target.authority);
            return;
        }
    };

    let mut inner_sessions = 0usize;
    let mut tunnel_error: Option<String> = None;
    loop {
        let request = match timeout(READ_TIMEOUT, http1::parse_request(&mut tls)).await {
            Err(_) => break,
            Ok(Ok(None)) => break,
            Ok(Ok(Some(request))) => request,
            Ok(Err(err)) => {
                respond_with_status(&mut tls, 400, "Bad Request", &err.to_string()).await;
                tunnel_error = Some(format!("malformed request in tunnel: {err}"));
                break;
            }
        };

        if is_upgrade_request(&request.headers) {
            relay_websocket(inner, tls, request, &target.host, target.port, true).await;
            return;
        }

        exchange(&inner, &mut tls, request, "https", &target.host, target.port).await;
        inner_sessions += 1;
        // Responses always carry Connection: close.
        break;
    }
    let _ = tls.shutdown().await;

    if inner_sessions == 0 {
        record_connect_session(&inner, &target, tunnel_error, started);
    }
}

/// WebSocket upgrade: forward the handshake verbatim, then relay frames. The
/// session is recorded once at upgrade time (headers only) and again when the
/// relay ends, with the captured messages.
async fn relay_websocket<C>(
    inner: Arc<RuntimeInner>,
    mut client: C,
    request: ParsedRequest,
    host: &str,
    port: u16,
    tls: bool,
) where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let started = Instant::now();
    let settings = inner.settings.current();
    let scheme = if tls { "wss" } else { "ws" };
    let url = format_url(scheme, host, port, origin_form(&request.target));
    let mut session =
        CapturedSession::new(capture_request(&request, &url, settings.max_body_capture_bytes));

    let mut upstream = match with_timeout(CONNECT_TIMEOUT, connect_upstream(host, port, tls)).await
    {
        Ok(upstream) => upstream,
        Err(err) => {
            respond_with_status(&mut client, 502, "Bad Gateway", "upstream connection failed")
                .await;
            session.error = Some(format!("connecting to {host}:{port}: {err:#}"));
            session.duration_millis = started.elapsed().as_millis() as u64;
            inner.store.upsert(session);
            return;
        }
    };

    let handshake = http1::serialize_request_verbatim(&request, origin_form(&request.target));
    if let Err(err) = write_all_flush(&mut upstream, &handshake).await {
        respond_with_status(&mut client, 502, "Bad Gateway", "upstream write failed").await;
        session.error = Some(format!("writing upgrade to {host}:{port}: {err}"));
        session.duration_millis = started.elapsed().as_millis() as u64;
        inner.store.upsert(session);
        return;
    }

    let (head, leftover, status) =
        match with_timeout(READ_TIMEOUT, http1::read_raw_response_head(&mut upstream)).await {
            Ok(parts) => parts,
            Err(err) => {
                respond_with_status(&mut client, 502, "Bad Gateway", "upstream read failed").await;
                session.error = Some(format!("reading upgrade response from {host}:{port}: {err:#}"));
                session.duration_millis = started.elapsed().as_millis() as u64;
                inner.store.upsert(session);
                return;
            }
        };

    let (status_code, reason, headers) =
        http1::parse_response_head(&head).unwrap_or((status, None, Vec::new()));
    session.response = Some(CapturedResponse {
        status_code,
        reason,
        headers,
        body_preview: None,
    });

    if write_all_flush(&mut client, &head).await.is_err() {
        session.error = Some("client closed during upgrade".to_string());
        session.duration_millis = started.elapsed().as_millis() as u64;
        inner.store.upsert(session);
        return;
    }

    if status != 101 {
        // Upgrade declined: pass the response body through and close.
        let _ = client.write_all(&leftover).await;
        let _ = tokio::io::copy(&mut upstream, &mut client).await;
        let _ = client.shutdown().await;
        session.duration_millis = started.elapsed().as_millis() as u64;
        inner.store.upsert(session);
        return;
    }

    inner.store.upsert(session.clone());
    tracing::debug!("WebSocket upgrade accepted for {url}");

    let upstream = Prefixed::new(leftover, upstream);
    session.web_socket_messages = websocket::relay(client, upstream).await;
    session.duration_millis = started.elapsed().as_millis() as u64;
    tracing::debug!(
        "WebSocket relay for {url} ended after {} captured frames",
        session.web_socket_messages.len()
    );
    inner.store.upsert(session);
}

/// Serve the proxy's own endpoint: `GET /SSL` downloads the root
/// certificate; anything else gets the onboarding page.
async fn serve_certificate_route<S>(
    inner: &Arc<RuntimeInner>,
    client: &mut S,
    request: &ParsedRequest,
    settings: &ProxySettings,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let path = origin_form(&request.target);
    let path = path.split('?').next().unwrap_or(path);
    if request.method.eq_ignore_ascii_case("GET") && path == CERT_ROUTE_PATH {
        // Serves only an existing root; generation happens when SSL
        // decryption is enabled, not on download.
        match inner.distribution.existing_root_certificate_pem() {
            Ok(Some(pem)) => {
                let head = format!(
                    "HTTP/1.1 200 OK\r\n\
                     Content-Type: application/x-x509-ca-cert\r\n\
                     Content-Disposition: attachment; filename=\"proxyscope-root-ca.pem\"\r\n\
                     Content-Length: {}\r\n\
                     Connection: close\r\n\r\n",
                    pem.len()
                );
                let _ = write_all_flush(client, head.as_bytes()).await;
                let _ = write_all_flush(client, pem.as_bytes()).await;
                return;
            }
            Ok(None) => {}
            Err(err) => {
                tracing::error!("Root certificate unreadable: {err:#}");
                respond_with_status(client, 500, "Internal Server Error", "root certificate unavailable")
                    .await;
                return;
            }
        }
    }

    let list: String = inner
        .distribution
        .onboarding_urls(settings)
        .iter()
        .map(|u| format!("<li><a href=\"{u}\">{u}</a></li>"))
        .collect();
    let body = format!(
        "<!DOCTYPE html><html><head><title>Proxyscope</title></head><body>\
         <h1>Proxyscope</h1>\
         <p>To inspect HTTPS traffic, download and trust the root certificate:</p>\
         <ul>{list}</ul></body></html>"
    );
    let head = format!(
        "HTTP/1.1 404 Not Found\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = write_all_flush(client, head.as_bytes()).await;
    let _ = write_all_flush(client, body.as_bytes()).await;
}

fn record_connect_session(
    inner: &RuntimeInner,
    target: &ConnectTarget,
    error: Option<String>,
    started: Instant,
) {
    let mut session = CapturedSession::new(CapturedRequest {
        method: "CONNECT".to_string(),
        url: target.authority.clone(),
        headers: Vec::new(),
        body_preview: None,
    });
    session.error = error;
    session.duration_millis = started.elapsed().as_millis() as u64;
    inner.store.upsert(session);
}

/// Whether a plain request is addressed to the proxy itself. The synthetic
/// hostname always is; other certificate-host spellings must also hit the
/// bound port.
fn is_own_endpoint(
    inner: &RuntimeInner,
    host: &str,
    port: u16,
    settings: &ProxySettings,
) -> bool {
    if normalize_hostname(host) == INTERNAL_CERT_HOST {
        return true;
    }
    let active = inner.active_port.load(Ordering::Relaxed);
    active != 0 && port == active && is_certificate_host(host, settings)
}

fn is_upgrade_request(headers: &[HeaderEntry]) -> bool {
    let upgrade = header_value(headers, "upgrade")
        .map(|v| v.to_ascii_lowercase().contains("websocket"))
        .unwrap_or(false);
    let connection = header_value(headers, "connection")
        .map(|v| {
            v.to_ascii_lowercase()
                .split(',')
                .any(|token| token.trim() == "upgrade")
        })
        .unwrap_or(false);
    upgrade && connection
}

/// Resolve scheme, host and port for a plain proxied request: the
/// absolute-form target when present, the Host header otherwise.
fn resolve_http_target(request: &ParsedRequest) -> Option<(&'static str, String, u16)> {
    for (scheme, default_port) in [("http", 80u16), ("https", 443u16)] {
        if let Some(rest) = request
            .target
            .strip_prefix(scheme)
            .and_then(|r| r.strip_prefix("://"))
        {
            let authority = match rest.find('/') {
                Some(i) => &rest[..i],
                None => rest,
            };
            let (host, port) = split_authority(authority, default_port)?;
            return Some((scheme, host, port));
        }
    }
    let host_header = header_value(&request.headers, "host")?;
    let (host, port) = split_authority(host_header, 80)?;
    Some(("http", host, port))
}

fn split_authority(authority: &str, default_port: u16) -> Option<(String, u16)> {
    let trimmed = authority.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(rest) = trimmed.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        if host.is_empty() {
            return None;
        }
        let port = if after.is_empty() {
            default_port
        } else {
            parse_port(after.strip_prefix(':')?)?
        };
        return Some((host.to_string(), port));
    }
    match trimmed.matches(':').count() {
        0 => Some((trimmed.to_string(), default_port)),
        1 => {
            let (host, port) = trimmed.split_once(':')?;
            if host.is_empty() {
                return None;
            }
            Some((host.to_string(), parse_port(port)?))
        }
        // Bare IPv6 literal without brackets.
        _ => Some((trimmed.to_string(), default_port)),
    }
}

fn parse_port(input: &str) -> Option<u16> {
    let port: u32 = input.parse().ok()?;
    if (1..=65535).contains(&port) {
        Some(port as u16)
    } else {
        None
    }
}

/// Reduce an absolute-form target to its origin-form path and query.
fn origin_form(target: &str) -> &str {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = target.strip_prefix(scheme) {
            return match rest.find('/') {
                Some(i) => &rest[i..],
                None => "/",
            };
        }
    }
    target
}

fn format_url(scheme: &str, host: &str, port: u16, path: &str) -> String {
    let default = matches!(
        (scheme, port),
        ("http", 80) | ("https", 443) | ("ws", 80) | ("wss", 443)
    );
    if default {
        format!("{scheme}://{host}{path}")
    } else {
        format!("{scheme}://{host}:{port}{path}")
    }
}

fn capture_request(request: &ParsedRequest, url: &str, max_bytes: usize) -> CapturedRequest {
    let body_preview = if request.body.is_empty() {
        None
    } else {
        Some(preview::build_body_preview(&request.body, &request.headers, max_bytes))
    };
    CapturedRequest {
        method: request.method.clone(),
        url: url.to_string(),
        headers: request.headers.clone(),
        body_preview,
    }
}

fn capture_response(response: &UpstreamResponse, max_bytes: usize) -> CapturedResponse {
    let body_preview = if response.body.is_empty() {
        None
    } else {
        Some(preview::build_body_preview(&response.body, &response.headers, max_bytes))
    };
    CapturedResponse {
        status_code: response.status_code,
        reason: response.reason.clone(),
        headers: response.headers.clone(),
        body_preview,
    }
}

async fn respond_with_status<S>(stream: &mut S, status: u16, reason: &str, body: &str)
where
    S: AsyncWrite + Unpin,
{
    let payload = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    if let Err(err) = write_all_flush(stream, payload.as_bytes()).await {
        tracing::debug!("Failed to write {status} response: {err}");
    }
}

async fn write_all_flush<S>(stream: &mut S, bytes: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(bytes).await?;
    stream.flush().await
}

async fn with_timeout<T, E>(
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T, E>>,
) -> anyhow::Result<T>
where
    E: Into<anyhow::Error>,
{
    match timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(anyhow!("timed out after {limit:?}")),
    }
}

async fn connect_upstream(host: &str, port: u16, tls: bool) -> anyhow::Result<UpstreamStream> {
    #[cfg(test)]
    {
        let connector_opt = { TEST_CONNECTOR.lock().unwrap().as_ref().cloned() };
        if let Some(connector) = connector_opt {
            return connector(host, port, tls).await;
        }
    }

    let stream = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("connecting to upstream {host}:{port}"))?;

    if tls {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| anyhow!("invalid server name {host:?}"))?;
        let connector = TlsConnector::from(UPSTREAM_TLS_CONFIG.clone());
        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .with_context(|| format!("TLS handshake with {host}:{port}"))?;
        Ok(UpstreamStream::Tls(tls_stream))
    } else {
        Ok(UpstreamStream::Plain(stream))
    }
}

#[allow(clippy::large_enum_variant)]
enum UpstreamStream {
    Plain(TcpStream),
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
    #[cfg(test)]
    Mock(DuplexStream),
}

#[cfg(test)]
type TestConnectorFn = dyn Fn(&str, u16, bool) -> Pin<Box<dyn Future<Output = anyhow::Result<UpstreamStream>> + Send>>
    + Send
    + Sync;

#[cfg(test)]
static TEST_CONNECTOR: Lazy<Mutex<Option<Arc<TestConnectorFn>>>> = Lazy::new(|| Mutex::new(None));

#[cfg(test)]
fn set_test_upstream_connector<F, Fut>(connector: F)
where
    F: Fn(&str, u16, bool) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<UpstreamStream>> + Send + 'static,
{
    let mut guard = TEST_CONNECTOR.lock().unwrap();
    let arc_connector: Arc<TestConnectorFn> =
        Arc::new(move |host, port, tls| Box::pin(connector(host, port, tls)));
    *guard = Some(arc_connector);
}

#[cfg(test)]
fn reset_test_upstream_connector() {
    let mut guard = TEST_CONNECTOR.lock().unwrap();
    guard.take();
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(test)]
            UpstreamStream::Mock(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_write(cx, data),
            UpstreamStream::Tls(stream) => Pin::new(stream).poll_write(cx, data),
            #[cfg(test)]
            UpstreamStream::Mock(stream) => Pin::new(stream).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(test)]
            UpstreamStream::Mock(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(test)]
            UpstreamStream::Mock(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
