use async_trait::async_trait;
use authgate::auth::{AuthTransport, ProbePolicy};
use authgate::config::GatewayConfig;
use authgate::error::Result;
use authgate::proxy::rewrite_uri;
use authgate::transport::RoundTrip;
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use http::{Method, Request, Response, StatusCode, Uri};
use url::Url;

/// Upstream stand-in that authorizes every probe and echoes forwards
struct AllowAll;

#[async_trait]
impl RoundTrip for AllowAll {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        Ok(Response::builder()
            .status(StatusCode::OK)
            .body(request.into_body())
            .expect("static response"))
    }
}

fn sample_request(body: Bytes) -> Request<Bytes> {
    Request::builder()
        .method("POST")
        .uri("https://trickster.example.com/api/v1/query_range?start=0&end=3600&step=15")
        .header("host", "localhost:3000")
        .header("content-type", "application/json")
        .header("authorization", "Bearer bench")
        .body(body)
        .expect("valid request")
}

fn benchmark_probe_path(c: &mut Criterion) {
    let policy = ProbePolicy::new("/auth-prefix/", Method::GET);

    c.bench_function("probe_path_simple", |b| {
        b.iter(|| black_box(policy.probe_path(black_box("/metrics/query"))))
    });

    c.bench_function("probe_path_dot_segments", |b| {
        b.iter(|| black_box(policy.probe_path(black_box("/a/./b/../c//d/../../e/f"))))
    });
}

fn benchmark_build_probe(c: &mut Criterion) {
    let transport = AuthTransport::new(AllowAll, ProbePolicy::new("/auth-prefix/", Method::GET));
    let request = sample_request(Bytes::from_static(br#"{"query":"up"}"#));

    c.bench_function("build_probe", |b| {
        b.iter(|| black_box(transport.build_probe(black_box(&request))))
    });
}

fn benchmark_rewrite_uri(c: &mut Criterion) {
    let upstream = Url::parse("http://localhost:9090/prom?tenant=a").expect("valid url");
    let inbound: Uri = "/api/v1/query?query=up".parse().expect("valid uri");

    c.bench_function("rewrite_uri", |b| {
        b.iter(|| black_box(rewrite_uri(&upstream, black_box(&inbound))))
    });
}

fn benchmark_round_trip(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let transport = AuthTransport::new(AllowAll, ProbePolicy::new("/auth-prefix/", Method::GET));

    let mut group = c.benchmark_group("authorized_round_trip");
    for size in [0usize, 1024, 64 * 1024].iter() {
        let body = Bytes::from(vec![b'x'; *size]);
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &_size| {
            b.to_async(&runtime).iter(|| async {
                black_box(transport.round_trip(sample_request(body.clone())).await)
            })
        });
    }
    group.finish();
}

fn benchmark_config_parsing(c: &mut Criterion) {
    let yaml = r#"
server:
  host: "0.0.0.0"
  port: 3000
  timeout_secs: 30

upstream:
  url: "https://trickster.example.com"

auth:
  prefix: "/trickster-auth"
  probe_method: GET
"#;

    c.bench_function("config_parsing", |b| {
        b.iter(|| black_box(serde_yaml::from_str::<GatewayConfig>(yaml)))
    });
}

criterion_group!(
    benches,
    benchmark_probe_path,
    benchmark_build_probe,
    benchmark_rewrite_uri,
    benchmark_round_trip,
    benchmark_config_parsing
);
criterion_main!(benches);
