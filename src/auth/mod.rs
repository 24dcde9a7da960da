use crate::config::AuthConfig;
use crate::error::{GatewayError, Result};
use crate::metrics::{self, ProbeResult};
use crate::observability::RequestSink;
use crate::transport::RoundTrip;
use async_trait::async_trait;
use bytes::Bytes;
use http::{
    header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING},
    uri::PathAndQuery,
    Method, Request, Response, StatusCode, Uri,
};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::borrow::Cow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Maps an original request onto its authorization probe
#[derive(Debug, Clone)]
pub struct ProbePolicy {
    prefix: String,
    method: Method,
}

impl ProbePolicy {
    /// Create a policy rooting probes under `prefix` and sending them with `method`
    pub fn new(prefix: &str, method: Method) -> Self {
        Self {
            prefix: clean_path(prefix),
            method,
        }
    }

    /// Build a policy from configuration
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let method = Method::from_bytes(config.probe_method.to_uppercase().as_bytes())
            .map_err(|_| GatewayError::Config(format!("Invalid probe method: {}", config.probe_method)))?;

        if method != Method::GET && method != Method::HEAD {
            return Err(GatewayError::Config(format!(
                "Probe method must be GET or HEAD, got {}",
                method
            )));
        }

        Ok(Self::new(&config.prefix, method))
    }

    /// Probe path for `original`
    ///
    /// The original path is cleaned as a rooted path before joining, so
    /// `..` segments can never lift the probe out from under the prefix.
    pub fn probe_path(&self, original: &str) -> String {
        let rest = clean_path(original);
        if self.prefix == "/" {
            rest
        } else if rest == "/" {
            self.prefix.clone()
        } else {
            format!("{}{}", self.prefix, rest)
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn method(&self) -> &Method {
        &self.method
    }
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self::from_config(&AuthConfig::default()).unwrap_or_else(|_| Self::new("/", Method::GET))
    }
}

/// Characters re-encoded when a decoded segment is split on an encoded separator
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'\\')
    .add(b'`')
    .add(b'{')
    .add(b'}');

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

/// Lexically clean a path as if it were rooted at `/`
///
/// Segments are classified on their percent-decoded form, so `%2e%2e` pops
/// like `..` and an encoded separator splits a segment.
fn clean_path(path: &str) -> String {
    let mut segments: Vec<Cow<'_, str>> = Vec::new();
    for raw in path.split('/') {
        let decoded = percent_decode_str(raw).decode_utf8_lossy();
        if decoded.contains(is_separator) {
            for part in decoded.split(is_separator) {
                let encoded = Cow::Owned(utf8_percent_encode(part, SEGMENT).to_string());
                push_segment(&mut segments, encoded, part);
            }
        } else {
            push_segment(&mut segments, Cow::Borrowed(raw), &decoded);
        }
    }

    let mut cleaned = String::with_capacity(path.len() + 1);
    for segment in &segments {
        cleaned.push('/');
        cleaned.push_str(segment);
    }
    if cleaned.is_empty() {
        cleaned.push('/');
    }
    cleaned
}

fn push_segment<'a>(segments: &mut Vec<Cow<'a, str>>, raw: Cow<'a, str>, decoded: &str) {
    match decoded {
        "" | "." => {}
        ".." => {
            segments.pop();
        }
        _ => segments.push(raw),
    }
}

/// Result of an authorization probe
#[derive(Debug)]
pub enum ProbeOutcome {
    /// The authorization service answered `200 OK`
    Allowed,
    /// Any other status; carries the probe response for the caller
    Denied(Response<Bytes>),
}

/// Transport that authorizes each request with a probe before forwarding it
pub struct AuthTransport<T> {
    inner: T,
    policy: ProbePolicy,
    probe_timeout: Duration,
    sink: Option<Arc<dyn RequestSink>>,
}

impl<T: RoundTrip> AuthTransport<T> {
    /// Wrap `inner`, which carries both the probe and the forward
    pub fn new(inner: T, policy: ProbePolicy) -> Self {
        Self {
            inner,
            policy,
            probe_timeout: Duration::from_secs(10),
            sink: None,
        }
    }

    /// Bound each probe by `timeout`
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Observe every request right before it is forwarded
    pub fn with_sink(mut self, sink: Arc<dyn RequestSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Derive the probe for `request` from its metadata only
    pub fn build_probe(&self, request: &Request<Bytes>) -> Result<Request<Bytes>> {
        let uri = request.uri();
        let path = self.policy.probe_path(uri.path());
        let path_and_query = match uri.query() {
            Some(query) => format!("{}?{}", path, query),
            None => path,
        };

        let mut parts = uri.clone().into_parts();
        parts.path_and_query = Some(
            PathAndQuery::try_from(path_and_query)
                .map_err(|e| GatewayError::Http(format!("Invalid probe path: {}", e)))?,
        );
        let probe_uri = Uri::from_parts(parts)
            .map_err(|e| GatewayError::Http(format!("Invalid probe URI: {}", e)))?;

        let mut headers = request.headers().clone();
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);
        headers.remove(TRANSFER_ENCODING);

        let mut probe = Request::new(Bytes::new());
        *probe.method_mut() = self.policy.method.clone();
        *probe.uri_mut() = probe_uri;
        *probe.version_mut() = request.version();
        *probe.headers_mut() = headers;

        Ok(probe)
    }

    /// Send the probe for `request` and classify the answer
    pub async fn probe(&self, request: &Request<Bytes>) -> Result<ProbeOutcome> {
        let probe = self.build_probe(request)?;
        let probe_uri = probe.uri().clone();
        let start = Instant::now();

        let result = match tokio::time::timeout(self.probe_timeout, self.inner.round_trip(probe)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(format!(
                "Authorization probe exceeded {:?}",
                self.probe_timeout
            ))),
        };
        let elapsed = start.elapsed().as_secs_f64();

        match result {
            Ok(response) if response.status() == StatusCode::OK => {
                debug!(probe = %probe_uri, "Authorization probe allowed request");
                metrics::record_probe(ProbeResult::Allowed, elapsed);
                Ok(ProbeOutcome::Allowed)
            }
            Ok(response) => {
                warn!(
                    probe = %probe_uri,
                    status = %response.status(),
                    "Authorization probe denied request"
                );
                metrics::record_probe(ProbeResult::Denied, elapsed);
                Ok(ProbeOutcome::Denied(response))
            }
            Err(e) => {
                warn!(probe = %probe_uri, error = %e, "Authorization probe failed");
                metrics::record_probe(ProbeResult::Error, elapsed);
                Err(e)
            }
        }
    }

    async fn forward(&self, mut request: Request<Bytes>) -> Result<Response<Bytes>> {
        request.headers_mut().remove(HOST);

        if let Some(sink) = &self.sink {
            if catch_unwind(AssertUnwindSafe(|| sink.observe(&request))).is_err() {
                warn!("Request sink panicked; forwarding anyway");
            }
        }

        let method = request.method().to_string();
        let uri = request.uri().clone();
        let start = Instant::now();

        match self.inner.round_trip(request).await {
            Ok(response) => {
                let elapsed = start.elapsed().as_secs_f64();
                debug!(
                    method = %method,
                    uri = %uri,
                    status = %response.status(),
                    latency_ms = elapsed * 1000.0,
                    "Forwarded request"
                );
                metrics::record_forward(&method, response.status().as_u16(), elapsed);
                Ok(response)
            }
            Err(e) => {
                warn!(method = %method, uri = %uri, error = %e, "Forward failed");
                metrics::record_forward_error(&method);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<T: RoundTrip> RoundTrip for AuthTransport<T> {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        match self.probe(&request).await? {
            ProbeOutcome::Allowed => self.forward(request).await,
            ProbeOutcome::Denied(response) => Ok(response),
        }
    }
}
