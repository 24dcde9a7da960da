use crate::config::LogFormat;
use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use bytes::Bytes;
use std::fmt::Write;
use tracing::{debug, Span};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

const DEFAULT_FILTER: &str = "authgate=debug,tower_http=debug";

/// Initialize tracing/logging
pub fn init_tracing(format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());

    match format {
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init(),
    }
}

/// Middleware to add request ID to requests
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    Span::current().record("request_id", &request_id);

    // Propagate upstream so both hops share the id
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
        req.extensions_mut().insert(RequestId(request_id));

        let mut response = next.run(req).await;
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
        return response;
    }

    next.run(req).await
}

/// Request ID extension type
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Observer for requests about to be forwarded upstream
///
/// Called inline on the forward path, so implementations must be cheap and
/// must not panic.
pub trait RequestSink: Send + Sync {
    fn observe(&self, request: &Request<Bytes>);
}

/// Sink that writes the full request at debug level on the `authgate::dump` target
#[derive(Debug, Clone, Default)]
pub struct DumpSink;

impl RequestSink for DumpSink {
    fn observe(&self, request: &Request<Bytes>) {
        if tracing::enabled!(target: "authgate::dump", tracing::Level::DEBUG) {
            debug!(target: "authgate::dump", "{}", dump_request(request));
        }
    }
}

/// Render a request in HTTP/1.1 wire form
pub fn dump_request(request: &Request<Bytes>) -> String {
    let uri = request.uri();
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut out = String::new();
    let _ = write!(out, "{} {} HTTP/1.1\r\n", request.method(), target);

    if let Some(authority) = uri.authority() {
        if !request.headers().contains_key(http::header::HOST) {
            let _ = write!(out, "Host: {}\r\n", authority);
        }
    }

    for (name, value) in request.headers() {
        let value = String::from_utf8_lossy(value.as_bytes());
        let _ = write!(out, "{}: {}\r\n", name, value);
    }

    out.push_str("\r\n");
    out.push_str(&String::from_utf8_lossy(request.body()));
    out
}
