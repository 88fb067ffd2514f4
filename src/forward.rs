//! Upstream forwarding
//! Builds the upstream request (URL + rewritten headers), streams bodies in
//! both directions, maps transport failures to HTTP statuses, and tunnels
//! WebSocket upgrades

use crate::certificate::install_crypto_provider;
use crate::proxy::Hooks;
use crate::routes::RoutingEntry;
use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS,
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD, FORWARDED, HOST, ORIGIN, VARY,
};
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::io::ErrorKind;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use url::{Position, Url};
use tracing::{debug, warn};

/// Response body type used throughout the proxy.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Resolve the upstream URL for a request.
///
/// The incoming path loses its leading `/` and is resolved against the
/// target base, so the base's own path becomes a prefix. If the entry
/// carries a selector path, its first occurrence is removed from the result.
pub(crate) fn upstream_url(
    entry: &RoutingEntry,
    path: &str,
    query: Option<&str>,
) -> Result<Url> {
    let target = entry
        .target
        .as_ref()
        .with_context(|| format!("entry for {} has no upstream target", entry.domain))?;

    let relative = path.strip_prefix('/').unwrap_or(path);
    let mut url = target
        .join(relative)
        .with_context(|| format!("resolving {:?} against {}", relative, target))?;

    if let Some(prefix) = entry.path.as_deref() {
        let current = url.path().to_string();
        if current.contains(prefix) {
            url.set_path(&current.replacen(prefix, "", 1));
        }
    }

    url.set_query(query);
    Ok(url)
}

/// Path plus query of an upstream URL, as sent on the request line.
fn origin_form(url: &Url) -> Result<Uri> {
    Uri::try_from(&url[Position::BeforePath..]).context("building upstream request uri")
}

/// Compute the upstream header map from the incoming one.
///
/// All incoming headers are copied verbatim, then entry-configured extras
/// overwrite, then the forwarding headers are set from the incoming host and
/// the connection scheme.
pub(crate) fn upstream_headers(
    entry: &RoutingEntry,
    incoming: &HeaderMap,
    incoming_host: &str,
    is_tls: bool,
    target: &Url,
) -> HeaderMap {
    let mut headers = incoming.clone();

    if let Some(pairs) = entry.headers.as_deref() {
        apply_extra_headers(&mut headers, pairs);
    }

    let host_value = if entry.preserve_host {
        incoming_host.to_string()
    } else {
        match (target.host_str(), target.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => incoming_host.to_string(),
        }
    };
    let scheme = if is_tls { "https" } else { "http" };

    set_header(&mut headers, HOST, &host_value);
    set_header(
        &mut headers,
        HeaderName::from_static("x-forwarded-for"),
        incoming_host,
    );
    set_header(
        &mut headers,
        HeaderName::from_static("x-forwarded-proto"),
        scheme,
    );
    set_header(
        &mut headers,
        FORWARDED,
        &format!("host={};proto={}", incoming_host, scheme),
    );

    headers
}

/// Apply pipe-separated `key: value` pairs, overwriting existing values.
pub(crate) fn apply_extra_headers(headers: &mut HeaderMap, pairs: &str) {
    for pair in pairs.split('|') {
        let Some((name, value)) = pair.split_once(':') else {
            continue;
        };
        match (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value.trim()),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!("Ignoring malformed header pair {:?}", pair),
        }
    }
}

fn set_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Set the CORS response headers for a request carrying an `Origin`.
pub(crate) fn apply_cors_headers(out: &mut HeaderMap, request: &HeaderMap) {
    out.insert(VARY, HeaderValue::from_static("Origin"));

    if let Some(origin) = request.get(ORIGIN).and_then(|v| v.to_str().ok()) {
        let allowed = Url::parse(origin)
            .map(|u| u.origin().ascii_serialization())
            .unwrap_or_else(|_| origin.to_string());
        if let Ok(value) = HeaderValue::from_str(&allowed) {
            out.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
    }

    let allow_headers = request
        .get(ACCESS_CONTROL_REQUEST_HEADERS)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("*"));
    out.insert(ACCESS_CONTROL_ALLOW_HEADERS, allow_headers);

    let allow_methods = request
        .get(ACCESS_CONTROL_REQUEST_METHOD)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("GET,HEAD,PUT,PATCH,POST,DELETE"));
    out.insert(ACCESS_CONTROL_ALLOW_METHODS, allow_methods);

    out.insert(
        ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
}

/// Forward a request upstream and stream the response back.
///
/// The request body is handed to the upstream connection as it arrives; the
/// upstream response is returned with its status, headers and body intact,
/// so the server writes it through without buffering. Connection refusals
/// and resets become `502`, any other transport failure before the response
/// headers becomes `500`; later failures abort the response mid-stream.
pub(crate) async fn forward(
    req: Request<Incoming>,
    entry: &RoutingEntry,
    incoming_host: &str,
    is_tls: bool,
    hooks: &Hooks,
) -> Result<Response<ProxyBody>> {
    let (parts, body) = req.into_parts();
    let url = upstream_url(entry, parts.uri.path(), parts.uri.query())?;

    let mut upstream_req = Request::builder()
        .method(parts.method.clone())
        .uri(origin_form(&url)?)
        .version(Version::HTTP_11)
        .body(body)
        .context("building upstream request")?;
    *upstream_req.headers_mut() =
        upstream_headers(entry, &parts.headers, incoming_host, is_tls, &url);

    debug!("Forwarding {} {} to {}", parts.method, parts.uri, url);

    let mut response = match send_upstream(upstream_req, &url).await {
        Ok(response) => response,
        Err(e) => {
            warn!("Upstream request to {} failed: {:#}", url, e);
            hooks.proxy_error(e.as_ref());
            let status = if is_connect_failure(&e) {
                StatusCode::BAD_GATEWAY
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            let mut response = Response::new(empty_body());
            *response.status_mut() = status;
            return Ok(response);
        }
    };

    if entry.cors && parts.method != Method::OPTIONS && parts.headers.contains_key(ORIGIN) {
        apply_cors_headers(response.headers_mut(), &parts.headers);
    }

    let hooks = hooks.clone();
    Ok(response.map(move |incoming| observed(incoming.boxed(), hooks)))
}

/// Tunnel a validated WebSocket upgrade.
///
/// The upstream request reuses the forwarding URL and header rules, carries
/// no body, and is flushed immediately. When the upstream answers `101` its
/// response head is relayed to the client and the two upgraded byte streams
/// are spliced until either side closes. A non-`101` answer is forwarded as
/// a plain response.
pub(crate) async fn upgrade_tunnel(
    mut req: Request<Incoming>,
    entry: &RoutingEntry,
    incoming_host: &str,
    is_tls: bool,
    hooks: &Hooks,
) -> Result<Response<ProxyBody>> {
    let client_upgrade = hyper::upgrade::on(&mut req);
    let (parts, _body) = req.into_parts();

    let url = upstream_url(entry, parts.uri.path(), parts.uri.query())?;
    let mut upstream_req = Request::builder()
        .method(Method::GET)
        .uri(origin_form(&url)?)
        .version(Version::HTTP_11)
        .body(Empty::<Bytes>::new())
        .context("building upgrade request")?;
    *upstream_req.headers_mut() =
        upstream_headers(entry, &parts.headers, incoming_host, is_tls, &url);

    debug!("Tunneling upgrade for {} to {}", incoming_host, url);

    let mut response = match send_upstream(upstream_req, &url).await {
        Ok(response) => response,
        Err(e) => {
            hooks.proxy_error(e.as_ref());
            return Err(e.context("upstream upgrade request failed"));
        }
    };

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        let upstream_upgrade = hyper::upgrade::on(&mut response);
        let hooks = hooks.clone();
        tokio::spawn(splice_upgraded(client_upgrade, upstream_upgrade, hooks));
    }

    Ok(response.map(|incoming| incoming.boxed()))
}

/// Copy bytes both ways between the two upgraded connections.
async fn splice_upgraded(client: OnUpgrade, upstream: OnUpgrade, hooks: Hooks) {
    let client = match client.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            warn!("Client upgrade failed: {}", e);
            hooks.proxy_error(&e);
            return;
        }
    };
    let upstream = match upstream.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            warn!("Upstream upgrade failed: {}", e);
            hooks.proxy_error(&e);
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((up, down)) => debug!("Upgrade tunnel closed ({} bytes up, {} bytes down)", up, down),
        Err(e) => {
            debug!("Upgrade tunnel error: {}", e);
            hooks.proxy_error(&e);
        }
    }
}

/// Open a connection to the upstream and issue the request over it.
async fn send_upstream<B>(req: Request<B>, url: &Url) -> Result<Response<Incoming>>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let host = url.host_str().context("upstream url has no host")?;
    let port = url
        .port_or_known_default()
        .context("upstream url has no port")?;

    let stream = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("connecting to {}:{}", host, port))?;
    stream.set_nodelay(true).ok();

    if url.scheme() == "https" {
        let server_name =
            ServerName::try_from(host.to_string()).context("invalid upstream server name")?;
        let tls = tls_connector()
            .connect(server_name, stream)
            .await
            .with_context(|| format!("TLS handshake with {}", host))?;
        request_over(tls, req).await
    } else {
        request_over(stream, req).await
    }
}

async fn request_over<T, B>(io: T, req: Request<B>) -> Result<Response<Incoming>>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .context("upstream handshake")?;

    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("Upstream connection ended with error: {}", e);
        }
    });

    sender
        .send_request(req)
        .await
        .context("sending upstream request")
}

fn tls_connector() -> TlsConnector {
    static CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();
    let config = CONFIG.get_or_init(|| {
        install_crypto_provider();
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    });
    TlsConnector::from(config.clone())
}

/// True when the error chain contains a connection refusal or reset.
fn is_connect_failure(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .any(|io| {
            matches!(
                io.kind(),
                ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset
            )
        })
}

/// Body wrapper that reports mid-stream upstream errors to the hooks before
/// surfacing them.
struct ObservedBody {
    inner: ProxyBody,
    hooks: Hooks,
}

fn observed(inner: ProxyBody, hooks: Hooks) -> ProxyBody {
    BoxBody::new(ObservedBody { inner, hooks })
}

impl Body for ObservedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.as_mut().get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Err(e))) => {
                this.hooks.proxy_error(&e);
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
