use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Request, Response};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Capability to execute a single HTTP exchange
#[async_trait]
pub trait RoundTrip: Send + Sync {
    /// Send `request` and return the response, or the transport error that
    /// prevented one.
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>>;
}

#[async_trait]
impl<T: RoundTrip + ?Sized> RoundTrip for Arc<T> {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        (**self).round_trip(request).await
    }
}

/// Network transport backed by a pooled reqwest client
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport whose requests are bounded by `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl RoundTrip for HttpTransport {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let (parts, body) = request.into_parts();

        if parts.uri.scheme().is_none() || parts.uri.authority().is_none() {
            return Err(GatewayError::Proxy(format!(
                "Outbound request URI must be absolute: {}",
                parts.uri
            )));
        }

        debug!(method = %parts.method, uri = %parts.uri, "Sending upstream request");

        let mut outbound = self
            .client
            .request(parts.method, parts.uri.to_string())
            .body(body);

        for (name, value) in forwardable_headers(&parts.headers) {
            outbound = outbound.header(name, value);
        }

        let upstream_response = outbound.send().await.map_err(map_reqwest_error)?;

        let status = upstream_response.status();
        let mut response_builder = Response::builder().status(status);

        for (name, value) in forwardable_headers(upstream_response.headers()) {
            response_builder = response_builder.header(name, value);
        }

        let body_bytes = upstream_response
            .bytes()
            .await
            .map_err(|e| GatewayError::Backend(format!("Failed to read upstream response: {}", e)))?;

        let response = response_builder
            .body(body_bytes)
            .map_err(|e| GatewayError::Internal(format!("Failed to build response: {}", e)))?;

        Ok(response)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout(format!("Upstream request timed out: {}", e))
    } else if e.is_connect() {
        GatewayError::Backend(format!("Failed to connect to upstream: {}", e))
    } else {
        GatewayError::Proxy(format!("Upstream request failed: {}", e))
    }
}

/// Headers that survive a hop. Content-Length is recomputed from the body.
fn forwardable_headers(headers: &HeaderMap) -> impl Iterator<Item = (&http::HeaderName, &http::HeaderValue)> {
    headers.iter().filter(|(name, _)| {
        let name = name.as_str();
        !is_hop_by_hop_header(name) && !name.eq_ignore_ascii_case("content-length")
    })
}

/// Check if a header is a hop-by-hop header that should not be forwarded
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        matchers::{body_string, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("connection"));
        assert!(is_hop_by_hop_header("Keep-Alive"));
        assert!(is_hop_by_hop_header("Transfer-Encoding"));
        assert!(!is_hop_by_hop_header("Content-Type"));
        assert!(!is_hop_by_hop_header("Authorization"));
    }

    #[test]
    fn test_forwardable_headers_drop_length_and_hops() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", "12".parse().unwrap());
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("authorization", "Bearer abc".parse().unwrap());

        let names: Vec<&str> = forwardable_headers(&headers)
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(names, vec!["authorization"]);
    }

    #[tokio::test]
    async fn test_relative_uri_rejected() {
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let request = Request::builder()
            .uri("/metrics")
            .body(Bytes::new())
            .unwrap();

        let err = transport.round_trip(request).await.unwrap_err();
        assert!(matches!(err, GatewayError::Proxy(_)));
    }

    #[tokio::test]
    async fn test_round_trip_against_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/query"))
            .and(header("x-tenant", "blue"))
            .and(body_string("query=up"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("x-upstream", "yes")
                    .set_body_string("created"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let request = Request::builder()
            .method("POST")
            .uri(format!("{}/api/v1/query", server.uri()))
            .header("x-tenant", "blue")
            .body(Bytes::from_static(b"query=up"))
            .unwrap();

        let response = transport.round_trip(request).await.unwrap();
        assert_eq!(response.status(), 201);
        assert_eq!(response.headers()["x-upstream"], "yes");
        assert_eq!(response.body().as_ref(), b"created");
    }

    #[tokio::test]
    async fn test_connect_failure_is_backend_error() {
        // Bind then drop a listener so the port is known to be closed
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let request = Request::builder()
            .uri(format!("http://{}/", addr))
            .body(Bytes::new())
            .unwrap();

        let err = transport.round_trip(request).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_timeout_is_timeout_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(Duration::from_millis(100)).unwrap();
        let request = Request::builder()
            .uri(format!("{}/slow", server.uri()))
            .body(Bytes::new())
            .unwrap();

        let err = transport.round_trip(request).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout(_)));
    }
}
