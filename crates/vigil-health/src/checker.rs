//! Health check probes and the executor that times them.
//!
//! A `Probe` only reports what happened; the `HealthCheckExecutor` owns the
//! deadline, the latency measurement and the conversion into an immutable
//! `HealthCheckResult`. Dropping the probe future on timeout cancels any
//! in-flight I/O.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http_body_util::BodyExt;
use tracing::debug;

use vigil_core::{BoxFuture, ErrorKind, HealthCheckResult, ProbeSpec, epoch_millis};

/// What a single probe observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success { item_count: Option<u64> },
    Failure { kind: ErrorKind, message: String },
}

impl ProbeOutcome {
    pub fn ok() -> Self {
        ProbeOutcome::Success { item_count: None }
    }

    pub fn fail(kind: ErrorKind, message: impl Into<String>) -> Self {
        ProbeOutcome::Failure {
            kind,
            message: message.into(),
        }
    }
}

/// A health check against one service.
pub trait Probe: Send + Sync {
    fn probe(&self) -> BoxFuture<'_, ProbeOutcome>;

    /// Short human description, used in logs.
    fn describe(&self) -> String;
}

/// Build the probe described by a config entry. `Custom` probes have no
/// built-in implementation and yield `None`.
pub fn probe_from_spec(spec: &ProbeSpec) -> Option<Arc<dyn Probe>> {
    match spec {
        ProbeSpec::Http {
            address,
            path,
            expect_json,
        } => Some(Arc::new(HttpProbe::new(address, path).expect_json(*expect_json))),
        ProbeSpec::Tcp { address } => Some(Arc::new(TcpProbe::new(address))),
        ProbeSpec::Custom { .. } => None,
    }
}

// ── HTTP ──────────────────────────────────────────────────────────

/// HTTP/1 GET probe. Any 2xx is healthy.
pub struct HttpProbe {
    address: String,
    path: String,
    expect_json: bool,
}

impl HttpProbe {
    pub fn new(address: &str, path: &str) -> Self {
        Self {
            address: address.to_string(),
            path: path.to_string(),
            expect_json: false,
        }
    }

    /// Require a JSON body and count its items.
    pub fn expect_json(mut self, expect_json: bool) -> Self {
        self.expect_json = expect_json;
        self
    }
}

impl Probe for HttpProbe {
    fn probe(&self) -> BoxFuture<'_, ProbeOutcome> {
        Box::pin(http_probe(&self.address, &self.path, self.expect_json))
    }

    fn describe(&self) -> String {
        format!("GET http://{}{}", self.address, self.path)
    }
}

/// Map a non-2xx status to the error taxonomy.
pub fn classify_status(status: http::StatusCode) -> ErrorKind {
    match status.as_u16() {
        429 => ErrorKind::RateLimit,
        401 | 403 => ErrorKind::AuthError,
        _ => ErrorKind::HttpError,
    }
}

/// Items in a scrape-style response: a top-level array or an `items` array.
pub fn count_items(body: &serde_json::Value) -> Option<u64> {
    match body {
        serde_json::Value::Array(items) => Some(items.len() as u64),
        serde_json::Value::Object(map) => map
            .get("items")
            .and_then(|v| v.as_array())
            .map(|items| items.len() as u64),
        _ => None,
    }
}

async fn http_probe(address: &str, path: &str, expect_json: bool) -> ProbeOutcome {
    let uri = format!("http://{address}{path}");

    let stream = match tokio::net::TcpStream::connect(address).await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, %uri, "health probe connection failed");
            return ProbeOutcome::fail(ErrorKind::NetworkError, format!("connect: {e}"));
        }
    };

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => {
            debug!(error = %e, %uri, "health probe handshake failed");
            return ProbeOutcome::fail(ErrorKind::NetworkError, format!("handshake: {e}"));
        }
    };

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = match http::Request::builder()
        .method("GET")
        .uri(&uri)
        .header("host", address)
        .header("user-agent", "vigil-health/0.1")
        .header("accept", "application/json")
        .body(http_body_util::Empty::<bytes::Bytes>::new())
    {
        Ok(req) => req,
        Err(e) => return ProbeOutcome::fail(ErrorKind::Unknown, format!("bad request: {e}")),
    };

    let resp = match sender.send_request(req).await {
        Ok(resp) => resp,
        Err(e) => {
            debug!(error = %e, %uri, "health probe request failed");
            return ProbeOutcome::fail(ErrorKind::NetworkError, format!("request: {e}"));
        }
    };

    let status = resp.status();
    if !status.is_success() {
        debug!(%status, %uri, "health probe non-2xx");
        return ProbeOutcome::fail(classify_status(status), format!("status {status}"));
    }
    if !expect_json {
        return ProbeOutcome::ok();
    }

    let body = match resp.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return ProbeOutcome::fail(ErrorKind::NetworkError, format!("body: {e}")),
    };
    match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(value) => ProbeOutcome::Success {
            item_count: count_items(&value),
        },
        Err(e) => {
            debug!(error = %e, %uri, "health probe body is not JSON");
            ProbeOutcome::fail(ErrorKind::ParseError, format!("invalid JSON: {e}"))
        }
    }
}

// ── TCP ───────────────────────────────────────────────────────────

/// Healthy when a TCP connection can be established.
pub struct TcpProbe {
    address: String,
}

impl TcpProbe {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
        }
    }
}

impl Probe for TcpProbe {
    fn probe(&self) -> BoxFuture<'_, ProbeOutcome> {
        Box::pin(async move {
            match tokio::net::TcpStream::connect(&self.address).await {
                Ok(_) => ProbeOutcome::ok(),
                Err(e) => ProbeOutcome::fail(ErrorKind::NetworkError, format!("connect: {e}")),
            }
        })
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

// ── Closure ───────────────────────────────────────────────────────

type ProbeFn = dyn Fn() -> BoxFuture<'static, ProbeOutcome> + Send + Sync;

/// Probe backed by an async closure, for embedding applications.
pub struct FnProbe {
    name: String,
    f: Box<ProbeFn>,
}

impl FnProbe {
    pub fn new<F, Fut>(name: &str, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProbeOutcome> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            f: Box::new(move || Box::pin(f())),
        }
    }
}

impl Probe for FnProbe {
    fn probe(&self) -> BoxFuture<'_, ProbeOutcome> {
        (self.f)()
    }

    fn describe(&self) -> String {
        format!("custom:{}", self.name)
    }
}

// ── Executor ──────────────────────────────────────────────────────

/// Runs a probe under a hard deadline and records the result.
#[derive(Debug, Clone, Copy)]
pub struct HealthCheckExecutor {
    timeout: Duration,
}

impl HealthCheckExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Never fails: every outcome, including a timeout, becomes a result.
    pub async fn execute(&self, service_id: &str, probe: &dyn Probe) -> HealthCheckResult {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, probe.probe()).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        let now = epoch_millis();

        match outcome {
            Ok(ProbeOutcome::Success { item_count }) => {
                HealthCheckResult::success(service_id, now, latency_ms).with_item_count(item_count)
            }
            Ok(ProbeOutcome::Failure { kind, message }) => {
                HealthCheckResult::failure(service_id, now, latency_ms, kind, message)
            }
            Err(_) => {
                debug!(service = %service_id, probe = %probe.describe(), "health probe timed out");
                HealthCheckResult::failure(
                    service_id,
                    now,
                    latency_ms,
                    ErrorKind::Timeout,
                    format!("no response within {}ms", self.timeout.as_millis()),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use vigil_core::CheckOutcome;

    /// Serve one canned HTTP response and return the bound address.
    async fn serve_once(response: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket.write_all(response.as_bytes()).await;
        });
        address
    }

    #[test]
    fn status_mapping() {
        assert_eq!(classify_status(http::StatusCode::TOO_MANY_REQUESTS), ErrorKind::RateLimit);
        assert_eq!(classify_status(http::StatusCode::UNAUTHORIZED), ErrorKind::AuthError);
        assert_eq!(classify_status(http::StatusCode::FORBIDDEN), ErrorKind::AuthError);
        assert_eq!(classify_status(http::StatusCode::BAD_GATEWAY), ErrorKind::HttpError);
    }

    #[test]
    fn item_counting() {
        assert_eq!(count_items(&serde_json::json!([1, 2, 3])), Some(3));
        assert_eq!(count_items(&serde_json::json!({"items": [1]})), Some(1));
        assert_eq!(count_items(&serde_json::json!({"status": "ok"})), None);
    }

    #[tokio::test]
    async fn http_probe_to_closed_port_is_network_error() {
        let probe = HttpProbe::new("127.0.0.1:1", "/healthz");
        match probe.probe().await {
            ProbeOutcome::Failure { kind, .. } => assert_eq!(kind, ErrorKind::NetworkError),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn http_probe_success() {
        let address = serve_once("HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok").await;
        let probe = HttpProbe::new(&address, "/health");
        assert_eq!(probe.probe().await, ProbeOutcome::ok());
    }

    #[tokio::test]
    async fn http_probe_rate_limited() {
        let address =
            serve_once("HTTP/1.1 429 Too Many Requests\r\ncontent-length: 0\r\n\r\n").await;
        let probe = HttpProbe::new(&address, "/health");
        match probe.probe().await {
            ProbeOutcome::Failure { kind, .. } => assert_eq!(kind, ErrorKind::RateLimit),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn http_probe_counts_json_items() {
        let address = serve_once(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 17\r\n\r\n{\"items\":[1,2,3]}",
        )
        .await;
        let probe = HttpProbe::new(&address, "/posts").expect_json(true);
        assert_eq!(
            probe.probe().await,
            ProbeOutcome::Success {
                item_count: Some(3)
            }
        );
    }

    #[tokio::test]
    async fn http_probe_bad_json_is_parse_error() {
        let address = serve_once("HTTP/1.1 200 OK\r\ncontent-length: 9\r\n\r\nnot json!").await;
        let probe = HttpProbe::new(&address, "/posts").expect_json(true);
        match probe.probe().await {
            ProbeOutcome::Failure { kind, .. } => assert_eq!(kind, ErrorKind::ParseError),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tcp_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        assert_eq!(TcpProbe::new(&address).probe().await, ProbeOutcome::ok());

        drop(listener);
        assert!(matches!(
            TcpProbe::new("127.0.0.1:1").probe().await,
            ProbeOutcome::Failure { .. }
        ));
    }

    #[tokio::test]
    async fn executor_times_out_and_cancels() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let probe = FnProbe::new("slow", move || {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                flag.store(true, Ordering::SeqCst);
                ProbeOutcome::ok()
            }
        });

        let executor = HealthCheckExecutor::new(Duration::from_millis(50));
        let result = executor.execute("svc", &probe).await;
        assert_eq!(result.outcome, CheckOutcome::Timeout);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert!(result.latency_ms >= 50);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn executor_records_failure_kind() {
        let probe = FnProbe::new("auth", || async {
            ProbeOutcome::fail(ErrorKind::AuthError, "401")
        });
        let result = HealthCheckExecutor::new(Duration::from_secs(1))
            .execute("svc", &probe)
            .await;
        assert_eq!(result.outcome, CheckOutcome::Failure);
        assert_eq!(result.error_kind, Some(ErrorKind::AuthError));
        assert_eq!(result.message.as_deref(), Some("401"));
    }

    #[test]
    fn custom_spec_has_no_builtin_probe() {
        assert!(probe_from_spec(&ProbeSpec::Custom {
            name: "scraper".to_string()
        })
        .is_none());
        assert!(probe_from_spec(&ProbeSpec::Tcp {
            address: "127.0.0.1:1".to_string()
        })
        .is_some());
    }
}
