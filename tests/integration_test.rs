use faces_mesh::config::FacesConfig;
use faces_mesh::dependency::{CallerMeta, Dependency, DependencyClient, DependencyOutcome, Fetch};
use faces_mesh::faces::{Color, ServiceKind, Smiley};
use faces_mesh::fault::{FaultConfig, FaultInjector};
use faces_mesh::listener::Listener;
use faces_mesh::service::FacesService;
use http::header::HeaderName;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde_json::Value;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Canned answer for a mock fragment service.
#[derive(Clone)]
struct MockReply {
    status: u16,
    body: &'static str,
    delay: Duration,
}

impl MockReply {
    fn ok(body: &'static str) -> Self {
        Self {
            status: 200,
            body,
            delay: Duration::ZERO,
        }
    }

    fn status(status: u16, body: &'static str) -> Self {
        Self {
            status,
            body,
            delay: Duration::ZERO,
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// `x-faces-user` and `user-agent` of each request a mock fragment saw.
type SeenCallers = Arc<Mutex<Vec<(String, String)>>>;

/// Starts a mock fragment service and returns its `host:port`, a counter
/// of requests it has seen and the caller headers of those requests.
async fn start_mock_fragment(reply: MockReply) -> (String, Arc<AtomicUsize>, SeenCallers) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let seen: SeenCallers = Arc::new(Mutex::new(Vec::new()));
    let counter = Arc::clone(&hits);
    let callers = Arc::clone(&seen);

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };

            let reply = reply.clone();
            let counter = Arc::clone(&counter);
            let callers = Arc::clone(&callers);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: Request<Incoming>| {
                    let reply = reply.clone();
                    counter.fetch_add(1, Ordering::SeqCst);
                    let header = |name: &str| {
                        req.headers()
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string()
                    };
                    callers.lock().push((header("x-faces-user"), header("user-agent")));
                    async move {
                        tokio::time::sleep(reply.delay).await;
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(reply.status)
                                .body(reply.body.to_string())
                                .unwrap(),
                        )
                    }
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    (format!("127.0.0.1:{}", addr.port()), hits, seen)
}

/// Serves `service` on a loopback port.
async fn start_service(service: FacesService) -> (SocketAddr, broadcast::Sender<()>) {
    let listener = Listener::bind("127.0.0.1:0", service).await.unwrap();
    let addr = listener.local_addr();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    tokio::spawn(async move {
        let _ = listener.serve(shutdown_rx).await;
    });

    (addr, shutdown_tx)
}

fn face_service(smiley_addr: &str, color_addr: &str) -> FacesService {
    let config = FacesConfig {
        service: ServiceKind::Face,
        smiley_service: smiley_addr.to_string(),
        color_service: color_addr.to_string(),
        request_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    FacesService::from_config(&config, None).unwrap()
}

fn leaf_service(kind: ServiceKind, value: &str, faults: FaultConfig) -> FacesService {
    FacesService::new(
        kind,
        Arc::new(FaultInjector::new(faults)),
        HeaderName::from_static("x-faces-user"),
        "integration",
    )
    .with_leaf_value(value)
}

async fn get_with_headers(
    addr: SocketAddr,
    path: &str,
    headers: &[(&str, &str)],
) -> (StatusCode, Bytes) {
    let client: Client<_, Empty<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
    let mut builder = Request::builder().uri(format!("http://{}{}", addr, path));
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let req = builder.body(Empty::<Bytes>::new()).unwrap();

    let response = client.request(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

async fn get(addr: SocketAddr, path: &str) -> (StatusCode, Bytes) {
    get_with_headers(addr, path, &[("x-faces-user", "integration-user")]).await
}

async fn get_json(addr: SocketAddr, path: &str) -> (StatusCode, Value) {
    let (status, body) = get(addr, path).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_face_composes_live_fragments() {
    let (smiley_addr, smiley_tx) = start_service(leaf_service(
        ServiceKind::Smiley,
        Smiley::HeartEyes.entity(),
        FaultConfig::default(),
    ))
    .await;
    let (color_addr, color_tx) = start_service(leaf_service(
        ServiceKind::Color,
        Color::Blue.value(),
        FaultConfig::default(),
    ))
    .await;

    let (face_addr, face_tx) =
        start_service(face_service(&smiley_addr.to_string(), &color_addr.to_string())).await;

    let (status, body) = get_json(face_addr, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["smiley"], Smiley::HeartEyes.entity());
    assert_eq!(body["color"], Color::Blue.value());
    assert!(body.get("errors").is_none());
    assert!(body["latency"].is_u64());

    let _ = face_tx.send(());
    let _ = smiley_tx.send(());
    let _ = color_tx.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_face_falls_back_on_fragment_failures() {
    let (smiley_addr, _, _) =
        start_mock_fragment(MockReply::ok(r#"{"status": 200, "path": "/"}"#)).await;
    let (color_addr, _, _) = start_mock_fragment(MockReply::status(504, "")).await;

    let (face_addr, face_tx) = start_service(face_service(&smiley_addr, &color_addr)).await;

    let (status, body) = get_json(face_addr, "/").await;
    assert_eq!(status, StatusCode::OK);
    // A 200 without a smiley is reclassified as 400 and gets the bare fallback.
    assert_eq!(body["smiley"], Smiley::Cursing.entity());
    assert_eq!(body["color"], Color::Pink.value());

    let errors: Vec<&str> = body["errors"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert_eq!(errors, vec!["smiley: 400", "color: 504"]);

    let _ = face_tx.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_face_survives_latched_fragment() {
    let smiley = leaf_service(
        ServiceKind::Smiley,
        Smiley::Smiling.entity(),
        FaultConfig::default(),
    );
    smiley.faults().latch();
    let (smiley_addr, smiley_tx) = start_service(smiley).await;
    let (color_addr, _, _) = start_mock_fragment(MockReply::ok(r#"{"color": "blue"}"#)).await;

    let (face_addr, face_tx) =
        start_service(face_service(&smiley_addr.to_string(), &color_addr)).await;

    let (status, body) = get_json(face_addr, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["smiley"], Smiley::Cursing.entity());
    assert_eq!(body["color"], "blue");
    assert_eq!(body["errors"][0], "smiley: 599");

    let _ = face_tx.send(());
    let _ = smiley_tx.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_face_forwards_caller_headers() {
    let (smiley_addr, _, smiley_seen) =
        start_mock_fragment(MockReply::ok(r#"{"smiley": "&#x1F603;"}"#)).await;
    let (color_addr, _, color_seen) =
        start_mock_fragment(MockReply::ok(r#"{"color": "blue"}"#)).await;

    let (face_addr, face_tx) = start_service(face_service(&smiley_addr, &color_addr)).await;

    let (status, _) = get_with_headers(
        face_addr,
        "/",
        &[("x-faces-user", "alice"), ("user-agent", "faces-gui/1.0")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let expected = vec![("alice".to_string(), "faces-gui/1.0".to_string())];
    assert_eq!(*smiley_seen.lock(), expected);
    assert_eq!(*color_seen.lock(), expected);

    let _ = face_tx.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_face_forwards_unknown_without_caller_headers() {
    let (smiley_addr, _, smiley_seen) =
        start_mock_fragment(MockReply::ok(r#"{"smiley": "&#x1F603;"}"#)).await;
    let (color_addr, _, color_seen) =
        start_mock_fragment(MockReply::ok(r#"{"color": "blue"}"#)).await;

    let (face_addr, face_tx) = start_service(face_service(&smiley_addr, &color_addr)).await;

    let (status, _) = get_with_headers(face_addr, "/", &[]).await;
    assert_eq!(status, StatusCode::OK);

    let expected = vec![("unknown".to_string(), "unknown".to_string())];
    assert_eq!(*smiley_seen.lock(), expected);
    assert_eq!(*color_seen.lock(), expected);

    let _ = face_tx.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_injected_error_over_the_wire() {
    let (addr, shutdown_tx) = start_service(leaf_service(
        ServiceKind::Color,
        "green",
        FaultConfig::new(100, 0),
    ))
    .await;

    let (status, body) = get(addr, "/").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(&body[..], b"Error fraction triggered");

    let _ = shutdown_tx.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_latch_over_the_wire() {
    let (addr, shutdown_tx) = start_service(leaf_service(
        ServiceKind::Color,
        "green",
        FaultConfig::new(100, 100),
    ))
    .await;

    for _ in 0..3 {
        let (status, body) = get(addr, "/").await;
        assert_eq!(status.as_u16(), 599);
        assert_eq!(&body[..], b"Error state latched");
    }

    let _ = shutdown_tx.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dependency_client_success() {
    let (addr, hits, _) = start_mock_fragment(MockReply::ok(r#"{"color": "rgb(1 2 3)"}"#)).await;
    let client = DependencyClient::new(
        Duration::from_secs(2),
        HeaderName::from_static("x-faces-user"),
    );
    let dep = Dependency::new("color", "color").with_service(addr);

    let outcome = client.fetch(&dep, &CallerMeta::default()).await;
    assert_eq!(outcome, DependencyOutcome::Value("rgb(1 2 3)".to_string()));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dependency_client_sends_caller_under_configured_header() {
    let (addr, _, seen) = start_mock_fragment(MockReply::ok(r#"{"color": "green"}"#)).await;
    let client = DependencyClient::new(
        Duration::from_secs(2),
        HeaderName::from_static("x-faces-user"),
    );
    let dep = Dependency::new("color", "color").with_service(addr);
    let caller = CallerMeta {
        user: "bob".to_string(),
        user_agent: "curl/8.0".to_string(),
    };

    client.fetch(&dep, &caller).await;
    assert_eq!(
        *seen.lock(),
        vec![("bob".to_string(), "curl/8.0".to_string())]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dependency_client_missing_field() {
    let (addr, _, _) = start_mock_fragment(MockReply::ok(r#"{"smiley": ""}"#)).await;
    let client = DependencyClient::new(
        Duration::from_secs(2),
        HeaderName::from_static("x-faces-user"),
    );
    let dep = Dependency::new("smiley", "smiley").with_service(addr.clone());

    let outcome = client.fetch(&dep, &CallerMeta::default()).await;
    assert_eq!(outcome.status(), 400);
    assert_eq!(
        outcome.error_detail(),
        format!("no smiley in response from {}", addr)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dependency_client_passes_upstream_status() {
    let (addr, _, _) = start_mock_fragment(MockReply::status(503, "overloaded")).await;
    let client = DependencyClient::new(
        Duration::from_secs(2),
        HeaderName::from_static("x-faces-user"),
    );
    let dep = Dependency::new("color", "color").with_service(addr.clone());

    let outcome = client.fetch(&dep, &CallerMeta::default()).await;
    assert_eq!(outcome.status(), 503);
    assert_eq!(
        outcome.error_detail(),
        format!("error from {}: 503 (overloaded)", addr)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dependency_client_timeout() {
    let (addr, _, _) = start_mock_fragment(
        MockReply::ok(r#"{"color": "late"}"#).slow(Duration::from_millis(500)),
    )
    .await;
    let client = DependencyClient::new(
        Duration::from_millis(50),
        HeaderName::from_static("x-faces-user"),
    );
    let dep = Dependency::new("color", "color").with_service(addr);

    let outcome = client.fetch(&dep, &CallerMeta::default()).await;
    assert_eq!(outcome.status(), 500);
    assert!(outcome.error_detail().contains("timed out"));
}
