//! Proxy server
//! Listener pair, request dispatch, the per-entry policy pipeline, and the
//! certificate reload scheduler

use crate::certificate::{install_crypto_provider, CertificateStore, SniResolver};
use crate::forward;
use crate::forward::{empty_body, ProxyBody};
use crate::routes::{RouteTable, RoutingEntry};
use anyhow::{anyhow, bail, Context, Result};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::header::{
    HeaderValue, AUTHORIZATION, CONTENT_LENGTH, HOST, LOCATION, ORIGIN, UPGRADE, WWW_AUTHENTICATE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Future returned by a fallback handler.
pub type FallbackFuture = Pin<Box<dyn Future<Output = Response<ProxyBody>> + Send>>;

/// Handler invoked when no routing entry matches a request. The handler is
/// responsible for fully completing the response.
pub type FallbackHandler = Arc<dyn Fn(Request<Incoming>) -> FallbackFuture + Send + Sync>;

/// Optional observation hooks. Every method has a no-op default; implement
/// only what you want to see.
pub trait ProxyObserver: Send + Sync {
    /// A certificate failed to load during a reload.
    fn on_error(&self, _error: &(dyn std::error::Error + Send + Sync)) {}
    /// A TLS handshake was served with the certificate for this root domain.
    fn on_sni(&self, _root_domain: &str) {}
    /// A transport or upgrade error occurred while talking to an upstream.
    fn on_proxy_error(&self, _error: &(dyn std::error::Error + Send + Sync)) {}
}

/// Shared fan-out for the optional observer.
#[derive(Clone, Default)]
pub struct Hooks(Option<Arc<dyn ProxyObserver>>);

impl Hooks {
    pub fn new(observer: Option<Arc<dyn ProxyObserver>>) -> Self {
        Self(observer)
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub fn error(&self, err: &anyhow::Error) {
        if let Some(observer) = &self.0 {
            observer.on_error(err.as_ref());
        }
    }

    pub fn sni(&self, root_domain: &str) {
        if let Some(observer) = &self.0 {
            observer.on_sni(root_domain);
        }
    }

    pub fn proxy_error(&self, err: &(dyn std::error::Error + Send + Sync)) {
        if let Some(observer) = &self.0 {
            observer.on_proxy_error(err);
        }
    }
}

/// Process-wide proxy configuration.
#[derive(Clone)]
pub struct Settings {
    /// Bind address for both listeners.
    pub host: String,
    /// Plaintext listener port; 0 disables it.
    pub http_port: u16,
    /// TLS listener port; 0 disables it.
    pub https_port: u16,
    /// Directory whose direct subdirectories are certificate domains.
    pub certificates_folder: PathBuf,
    /// Certificate file name inside each domain directory.
    pub certificate_file: String,
    /// Private key file name inside each domain directory.
    pub key_file: String,
    /// Milliseconds between certificate reloads; 0 disables the timer.
    pub auto_reload: u64,
    /// Entries installed at startup.
    pub proxies: Vec<RoutingEntry>,
    /// Invoked when no entry matches.
    pub fallback: Option<FallbackHandler>,
    /// Observation hooks.
    pub observer: Option<Arc<dyn ProxyObserver>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            https_port: 8443,
            certificates_folder: PathBuf::from("certs"),
            certificate_file: "fullchain.pem".to_string(),
            key_file: "privkey.pem".to_string(),
            auto_reload: 0,
            proxies: Vec::new(),
            fallback: None,
            observer: None,
        }
    }
}

/// The proxy server: routing entries, certificate store, and listeners.
pub struct ProxyServer {
    settings: Settings,
    routes: RouteTable,
    certificates: Arc<CertificateStore>,
    hooks: Hooks,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    reload_timer: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyServer {
    pub fn new(settings: Settings) -> Self {
        install_crypto_provider();

        let hooks = Hooks::new(settings.observer.clone());
        let certificates = Arc::new(CertificateStore::new(
            settings.certificates_folder.clone(),
            settings.certificate_file.clone(),
            settings.key_file.clone(),
            hooks.clone(),
        ));
        Self {
            settings,
            routes: RouteTable::new(),
            certificates,
            hooks,
            listeners: Mutex::new(Vec::new()),
            reload_timer: Mutex::new(None),
        }
    }

    /// Load certificates, install the reload timer, open the listeners, and
    /// insert the initial entries.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        self.reload().await;

        for entry in self.settings.proxies.clone() {
            self.add(entry)?;
        }

        if self.settings.auto_reload > 0 && self.settings.https_port != 0 {
            let server = self.clone();
            let period = Duration::from_millis(self.settings.auto_reload);
            let handle = tokio::spawn(async move {
                let mut timer = tokio::time::interval(period);
                timer.tick().await; // the first tick completes immediately
                loop {
                    timer.tick().await;
                    server.reload().await;
                }
            });
            *self.reload_timer.lock() = Some(handle);
        }

        if self.settings.http_port != 0 {
            let listener = self.bind(self.settings.http_port).await?;
            info!("HTTP listener on {}", listener.local_addr()?);
            let server = self.clone();
            self.listeners
                .lock()
                .push(tokio::spawn(server.accept_plain(listener)));
        }

        if self.settings.https_port != 0 {
            let listener = self.bind(self.settings.https_port).await?;
            info!("HTTPS listener on {}", listener.local_addr()?);
            let acceptor = self.tls_acceptor();
            let server = self.clone();
            self.listeners
                .lock()
                .push(tokio::spawn(server.accept_tls(listener, acceptor)));
        }

        Ok(())
    }

    /// Close the listeners, clear entries and certificates, and cancel the
    /// reload timer. Safe to call repeatedly and concurrently.
    pub fn reset(&self) {
        for handle in self.listeners.lock().drain(..) {
            handle.abort();
        }
        if let Some(handle) = self.reload_timer.lock().take() {
            handle.abort();
        }
        self.routes.clear();
        self.certificates.clear();
    }

    /// Recompute the certificate map. A no-op unless a TLS listener is
    /// configured. The directory scan runs on the blocking pool so request
    /// handling never waits on disk I/O.
    pub async fn reload(&self) {
        if self.settings.https_port == 0 {
            return;
        }
        let certificates = self.certificates.clone();
        match tokio::task::spawn_blocking(move || certificates.reload()).await {
            Ok(loaded) => debug!("Certificate reload finished, {} domain(s)", loaded),
            Err(e) => warn!("Certificate reload task failed: {}", e),
        }
    }

    /// Append a routing entry.
    pub fn add(&self, entry: RoutingEntry) -> Result<()> {
        self.routes.add(entry)
    }

    pub fn certificates(&self) -> &CertificateStore {
        &self.certificates
    }

    async fn bind(&self, port: u16) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.settings.host, port);
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {}", addr))
    }

    fn tls_acceptor(&self) -> TlsAcceptor {
        let resolver = Arc::new(SniResolver::new(self.certificates.clone()));
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        TlsAcceptor::from(Arc::new(config))
    }

    async fn accept_plain(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    stream.set_nodelay(true).ok();
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.serve(stream, false).await {
                            debug!("Connection error from {}: {}", remote, e);
                        }
                    });
                }
                Err(e) => warn!("Accept failed: {}", e),
            }
        }
    }

    async fn accept_tls(self: Arc<Self>, listener: TcpListener, acceptor: TlsAcceptor) {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    stream.set_nodelay(true).ok();
                    let server = self.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls) => {
                                if let Err(e) = server.serve(tls, true).await {
                                    debug!("Connection error from {}: {}", remote, e);
                                }
                            }
                            Err(e) => warn!("TLS handshake failed from {}: {}", remote, e),
                        }
                    });
                }
                Err(e) => warn!("Accept failed: {}", e),
            }
        }
    }

    /// Serve one connection, dispatching requests and upgrades.
    async fn serve<S>(self: Arc<Self>, stream: S, is_tls: bool) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let server = self.clone();
        let service = service_fn(move |req| {
            let server = server.clone();
            async move { server.dispatch(req, is_tls).await }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
            .map_err(|e| anyhow!("connection error: {}", e))
    }

    /// Entry point for a single request. Public so the server can be driven
    /// by an externally owned listener.
    ///
    /// Requests carrying an `Upgrade` header take the tunnel path; an error
    /// return there means the connection should be dropped without a
    /// response, which is what hyper does with a failed service call.
    pub async fn dispatch(
        &self,
        req: Request<Incoming>,
        is_tls: bool,
    ) -> Result<Response<ProxyBody>> {
        if req.headers().contains_key(UPGRADE) {
            return self.handle_upgrade(req, is_tls).await;
        }
        Ok(self.handle_request(req, is_tls).await)
    }

    /// Route a request through the policy pipeline.
    ///
    /// Never fails: internal errors surface as `500`, unmatched hosts as
    /// `404` or the fallback handler when one is configured.
    pub async fn handle_request(
        &self,
        req: Request<Incoming>,
        is_tls: bool,
    ) -> Response<ProxyBody> {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(|h| h.to_string());

        let entry = host
            .as_deref()
            .and_then(|host| self.routes.find(host, req.uri().path()));

        let Some(entry) = entry else {
            if let Some(fallback) = &self.settings.fallback {
                debug!("No entry matched {:?}, delegating to fallback", host);
                return fallback(req).await;
            }
            debug!("No entry matched {:?}", host);
            return status_response(StatusCode::NOT_FOUND, b"Not found");
        };

        let host = host.unwrap_or_default();
        match self.apply_policies(req, &entry, &host, is_tls).await {
            Ok(response) => response,
            Err(e) => {
                error!("Request handling failed: {:#}", e);
                empty_status(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// Handle a WebSocket upgrade. Fails (dropping the connection) when the
    /// method is not GET, the upgrade is not `websocket`, or no entry
    /// matches.
    pub async fn handle_upgrade(
        &self,
        req: Request<Incoming>,
        is_tls: bool,
    ) -> Result<Response<ProxyBody>> {
        let is_websocket = req
            .headers()
            .get(UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        if req.method() != Method::GET || !is_websocket {
            bail!("rejecting non-websocket upgrade");
        }

        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(|h| h.to_string())
            .unwrap_or_default();

        let Some(entry) = self.routes.find(&host, req.uri().path()) else {
            bail!("no entry for upgrade host {:?}", host);
        };

        forward::upgrade_tunnel(req, &entry, &host, is_tls, &self.hooks).await
    }

    /// Run the fixed decision sequence for a matched entry. The first rule
    /// that applies produces the response.
    async fn apply_policies(
        &self,
        req: Request<Incoming>,
        entry: &RoutingEntry,
        host: &str,
        is_tls: bool,
    ) -> Result<Response<ProxyBody>> {
        // 1. Basic auth gate.
        if let Some(expected) = entry.authorization.as_deref() {
            let supplied = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok());
            if !authorized(supplied, expected) {
                debug!("Rejecting unauthorized request for {}", host);
                let mut response = empty_status(StatusCode::UNAUTHORIZED);
                response.headers_mut().insert(
                    WWW_AUTHENTICATE,
                    HeaderValue::from_static("Basic realm=\"Y u no password\""),
                );
                return Ok(response);
            }
        }

        // 2. Redirect to another domain, keeping the request path.
        if let Some(domain) = entry.redirect_to_domain.as_deref() {
            let location = format!("https://{}{}", domain, request_url(&req));
            return Ok(redirect_response(
                StatusCode::FOUND,
                b"Moved somewhere else",
                &location,
            ));
        }

        // 3. Redirect to a literal URL; the incoming path is not appended.
        if let Some(target) = entry.redirect_to_url.as_deref() {
            return Ok(redirect_response(
                StatusCode::FOUND,
                b"Moved somewhere else",
                target,
            ));
        }

        // 4. Upgrade plaintext connections to HTTPS.
        if entry.redirect_to_https && !is_tls {
            let location = format!("https://{}{}", host, request_url(&req));
            return Ok(redirect_response(
                StatusCode::MOVED_PERMANENTLY,
                b"HTTPS is better",
                &location,
            ));
        }

        // 5. CORS preflight.
        if req.method() == Method::OPTIONS && entry.cors && req.headers().contains_key(ORIGIN) {
            let mut response = empty_status(StatusCode::NO_CONTENT);
            response
                .headers_mut()
                .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
            forward::apply_cors_headers(response.headers_mut(), req.headers());
            return Ok(response);
        }

        // 6. Forward upstream.
        forward::forward(req, entry, host, is_tls, &self.hooks).await
    }
}

/// Compare the `Authorization` header against the expected Base64 value,
/// ignoring a leading `Basic` token and surrounding whitespace.
fn authorized(supplied: Option<&str>, expected: &str) -> bool {
    match supplied {
        Some(value) => {
            let value = value.trim();
            let value = value.strip_prefix("Basic").unwrap_or(value).trim();
            value == expected
        }
        None => false,
    }
}

/// Path plus query of the incoming request, as Node's `request.url`.
fn request_url<T>(req: &Request<T>) -> &str {
    req.uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
}

fn empty_status(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response
}

fn status_response(status: StatusCode, reason: &'static [u8]) -> Response<ProxyBody> {
    let mut response = empty_status(status);
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(reason));
    response
}

fn redirect_response(
    status: StatusCode,
    reason: &'static [u8],
    location: &str,
) -> Response<ProxyBody> {
    let mut response = status_response(status, reason);
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(LOCATION, value);
    }
    response
}
