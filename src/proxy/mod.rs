use crate::error::{GatewayError, Result};
use crate::metrics;
use crate::transport::{is_hop_by_hop_header, RoundTrip};
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, Request, Response, Uri},
};
use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Proxy handler state
#[derive(Clone)]
pub struct ProxyState {
    pub transport: Arc<dyn RoundTrip>,
    pub upstream: Arc<Url>,
    pub max_body_bytes: usize,
}

impl ProxyState {
    /// Create a new proxy state sending everything to `upstream` through `transport`
    pub fn new(transport: Arc<dyn RoundTrip>, upstream: Url) -> Self {
        Self {
            transport,
            upstream: Arc::new(upstream),
            max_body_bytes: 10 * 1024 * 1024,
        }
    }

    /// Limit the size of buffered request bodies
    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }
}

/// Main proxy handler that forwards requests to the upstream target
#[axum::debug_handler]
pub async fn proxy_handler(
    State(state): State<ProxyState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<Body>,
) -> Result<Response<Body>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let client_ip = connect_info.map(|ConnectInfo(addr)| addr.ip());
    let timer = metrics::Timer::new(method.as_str());

    info!(method = %method, path = %path, "Incoming request");

    let outcome = forward_to_upstream(&state, client_ip, req).await;

    match &outcome {
        Ok(response) => {
            info!(
                method = %method,
                path = %path,
                status = %response.status(),
                latency_ms = timer.elapsed() * 1000.0,
                "Request completed"
            );
            timer.record(response.status().as_u16());
        }
        Err(e) => {
            warn!(
                method = %method,
                path = %path,
                error = %e,
                latency_ms = timer.elapsed() * 1000.0,
                "Request failed"
            );
            timer.record(e.status_code().as_u16());
        }
    }

    outcome.map(|response| response.map(Body::from))
}

async fn forward_to_upstream(
    state: &ProxyState,
    client_ip: Option<std::net::IpAddr>,
    req: Request<Body>,
) -> Result<Response<Bytes>> {
    let (parts, body) = req.into_parts();

    let uri = rewrite_uri(&state.upstream, &parts.uri)?;

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    set_forwarded_headers(&mut headers, client_ip)?;

    let body = read_body(body, state.max_body_bytes).await?;

    let mut outbound = Request::new(body);
    *outbound.method_mut() = parts.method;
    *outbound.uri_mut() = uri;
    *outbound.version_mut() = parts.version;
    *outbound.headers_mut() = headers;

    state.transport.round_trip(outbound).await
}

/// Buffer the inbound body, refusing anything larger than `limit`
async fn read_body(body: Body, limit: usize) -> Result<Bytes> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(
            GatewayError::PayloadTooLarge(format!("body exceeds {} bytes", limit)),
        ),
        Err(e) => Err(GatewayError::Proxy(format!(
            "Failed to read request body: {}",
            e
        ))),
    }
}

/// Point `inbound` at the upstream target
///
/// Scheme and authority come from the upstream; the upstream base path and
/// the inbound path are joined with a single slash and both query strings
/// are kept.
pub fn rewrite_uri(upstream: &Url, inbound: &Uri) -> Result<Uri> {
    let host = upstream
        .host_str()
        .ok_or_else(|| GatewayError::InvalidUpstream(format!("no host in {}", upstream)))?;

    let mut target = format!("{}://{}", upstream.scheme(), host);
    if let Some(port) = upstream.port() {
        target.push_str(&format!(":{}", port));
    }
    target.push_str(&join_slash(upstream.path(), inbound.path()));

    let query = match (
        upstream.query().filter(|q| !q.is_empty()),
        inbound.query().filter(|q| !q.is_empty()),
    ) {
        (Some(base), Some(extra)) => Some(format!("{}&{}", base, extra)),
        (Some(base), None) => Some(base.to_string()),
        (None, Some(extra)) => Some(extra.to_string()),
        (None, None) => None,
    };
    if let Some(query) = query {
        target.push('?');
        target.push_str(&query);
    }

    target
        .parse::<Uri>()
        .map_err(|e| GatewayError::Http(format!("Invalid upstream URI {}: {}", target, e)))
}

fn join_slash(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let hop: Vec<_> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();

    for name in hop {
        headers.remove(name);
    }
}

fn set_forwarded_headers(
    headers: &mut HeaderMap,
    client_ip: Option<std::net::IpAddr>,
) -> Result<()> {
    if let Some(ip) = client_ip {
        let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{}, {}", prior, ip),
            None => ip.to_string(),
        };
        headers.insert(
            X_FORWARDED_FOR,
            HeaderValue::from_str(&forwarded_for)
                .map_err(|e| GatewayError::Http(format!("Invalid forwarded header: {}", e)))?,
        );
    }

    if let Some(host) = headers.get(header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    Ok(())
}
