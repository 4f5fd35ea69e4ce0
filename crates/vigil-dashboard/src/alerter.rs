//! Alert emission.
//!
//! The poller pushes `AlertEvent`s into a bounded in-memory queue and moves
//! on; it never waits for delivery. When the queue is full the oldest event
//! is dropped and counted. A dispatcher task drains the queue into the
//! configured sinks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vigil_core::config::WebhookConfig;
use vigil_core::{AlertEvent, BoxFuture};

const RECENT_ALERTS: usize = 100;

/// Destination for alert events (log, webhook, message queue, ...).
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    fn emit<'a>(&'a self, event: &'a AlertEvent) -> BoxFuture<'a, anyhow::Result<()>>;
}

// ── Sinks ─────────────────────────────────────────────────────────

/// Writes alerts to the `tracing` log.
pub struct LogSink;

impl AlertSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn emit<'a>(&'a self, event: &'a AlertEvent) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            if event.is_escalation() {
                warn!(
                    service = %event.service_id,
                    from = %event.old_status,
                    to = %event.new_status,
                    reason = %event.reason,
                    "service health degraded"
                );
            } else {
                info!(
                    service = %event.service_id,
                    from = %event.old_status,
                    to = %event.new_status,
                    reason = %event.reason,
                    "service health improved"
                );
            }
            Ok(())
        })
    }
}

/// Invokes an in-process callback for each alert.
pub struct CallbackSink {
    callback: Box<dyn Fn(&AlertEvent) + Send + Sync>,
}

impl CallbackSink {
    pub fn new(callback: impl Fn(&AlertEvent) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl AlertSink for CallbackSink {
    fn name(&self) -> &str {
        "callback"
    }

    fn emit<'a>(&'a self, event: &'a AlertEvent) -> BoxFuture<'a, anyhow::Result<()>> {
        (self.callback)(event);
        Box::pin(async { Ok(()) })
    }
}

/// POSTs each alert as JSON to `http://{address}{path}`.
pub struct WebhookSink {
    config: WebhookConfig,
}

impl WebhookSink {
    pub fn new(config: WebhookConfig) -> Self {
        Self { config }
    }
}

impl AlertSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    fn emit<'a>(&'a self, event: &'a AlertEvent) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let body = serde_json::to_vec(event)?;
            post_json(&self.config.address, &self.config.path, body, self.config.timeout).await
        })
    }
}

async fn post_json(
    address: &str,
    path: &str,
    body: Vec<u8>,
    timeout: Duration,
) -> anyhow::Result<()> {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = tokio::net::TcpStream::connect(address).await?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("POST")
            .uri(&uri)
            .header("host", address)
            .header("content-type", "application/json")
            .header("user-agent", "vigil/0.1")
            .body(http_body_util::Full::new(bytes::Bytes::from(body)))?;

        let resp = sender.send_request(req).await?;
        if !resp.status().is_success() {
            anyhow::bail!("webhook returned {}", resp.status());
        }
        Ok::<(), anyhow::Error>(())
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => anyhow::bail!("webhook {uri} timed out"),
    }
}

// ── Queue ─────────────────────────────────────────────────────────

/// Bounded, drop-oldest alert queue plus a short history of recent alerts.
pub struct Alerter {
    queue: Mutex<VecDeque<AlertEvent>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    recent: Mutex<VecDeque<AlertEvent>>,
}

impl Alerter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_ALERTS)),
        }
    }

    /// Enqueue an alert without blocking.
    pub fn push(&self, event: AlertEvent) {
        {
            let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
            if recent.len() == RECENT_ALERTS {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }
        {
            let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
            if queue.len() == self.capacity {
                if let Some(oldest) = queue.pop_front() {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        service = %oldest.service_id,
                        dropped,
                        "alert queue full, dropped oldest alert"
                    );
                }
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<AlertEvent> {
        self.queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
    }

    pub fn dropped_alerts(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Most recently pushed alerts, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AlertEvent> {
        let recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        recent.iter().rev().take(limit).cloned().collect()
    }

    /// Start delivering queued alerts to `sinks` until shutdown.
    pub fn spawn_dispatcher(
        self: &Arc<Self>,
        sinks: Vec<Arc<dyn AlertSink>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let alerter = self.clone();
        tokio::spawn(async move {
            let names: Vec<&str> = sinks.iter().map(|s| s.name()).collect();
            info!(sinks = ?names, capacity = alerter.capacity, "alert dispatcher started");
            loop {
                while let Some(event) = alerter.pop() {
                    deliver(&sinks, &event).await;
                }
                tokio::select! {
                    _ = alerter.notify.notified() => {}
                    _ = shutdown.changed() => {
                        while let Some(event) = alerter.pop() {
                            deliver(&sinks, &event).await;
                        }
                        break;
                    }
                }
            }
            info!("alert dispatcher stopped");
        })
    }
}

async fn deliver(sinks: &[Arc<dyn AlertSink>], event: &AlertEvent) {
    for sink in sinks {
        match sink.emit(event).await {
            Ok(()) => debug!(sink = sink.name(), service = %event.service_id, "alert delivered"),
            Err(e) => warn!(
                sink = sink.name(),
                service = %event.service_id,
                error = %e,
                "alert delivery failed"
            ),
        }
    }
}
