//! Rolling window of check results for one service.
//!
//! The window is a ring buffer of the most recent `capacity` results. The
//! all-time counters live beside it and never shrink when the buffer evicts,
//! so uptime stays stable while rates follow recent behaviour.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use vigil_core::{ErrorKind, HealthCheckResult};

const DAY_MS: u64 = 86_400_000;

/// Which slice of the rolling window a query covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    /// The `n` most recent results.
    Last(usize),
    /// Results completed at or after the given epoch ms.
    Since(u64),
    /// Everything currently buffered.
    All,
}

/// All-time counters. `successes + failures == attempts` always.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub total_attempts: u64,
    pub total_successes: u64,
    pub total_failures: u64,
}

/// One row of an error breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBreakdown {
    pub error_kind: ErrorKind,
    pub count: u64,
    /// Share of the failures in the queried window.
    pub percentage: f64,
    pub latest_occurrence: u64,
}

/// Copy of a window's derived figures, cheap to hand to readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    /// Over the whole buffered window.
    pub success_rate: f64,
    pub uptime_percentage: f64,
    pub avg_latency_ms: f64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    #[serde(flatten)]
    pub totals: Totals,
    pub window_len: usize,
    pub attempts_24h: u64,
    pub last_success_at: Option<u64>,
    pub last_failure_at: Option<u64>,
    pub short_circuited: u64,
}

#[derive(Debug)]
pub struct RollingWindow {
    capacity: usize,
    results: VecDeque<HealthCheckResult>,
    totals: Totals,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_success_at: Option<u64>,
    last_failure_at: Option<u64>,
    /// Probes skipped because the breaker was open. Not attempts.
    short_circuited: u64,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            results: VecDeque::with_capacity(capacity),
            totals: Totals::default(),
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_success_at: None,
            last_failure_at: None,
            short_circuited: 0,
        }
    }

    /// Ingest one result, evicting the oldest when full.
    pub fn record(&mut self, result: HealthCheckResult) {
        self.totals.total_attempts += 1;
        if result.is_success() {
            self.totals.total_successes += 1;
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            self.last_success_at = Some(result.timestamp_ms);
        } else {
            self.totals.total_failures += 1;
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            self.last_failure_at = Some(result.timestamp_ms);
        }

        if self.results.len() == self.capacity {
            self.results.pop_front();
        }
        self.results.push_back(result);
    }

    pub fn record_short_circuit(&mut self) {
        self.short_circuited += 1;
    }

    fn select(&self, window: Window) -> Box<dyn Iterator<Item = &HealthCheckResult> + '_> {
        match window {
            Window::Last(n) => {
                let skip = self.results.len().saturating_sub(n);
                Box::new(self.results.iter().skip(skip))
            }
            Window::Since(since_ms) => Box::new(
                self.results
                    .iter()
                    .filter(move |r| r.timestamp_ms >= since_ms),
            ),
            Window::All => Box::new(self.results.iter()),
        }
    }

    /// Percentage of successes in the window; 100.0 when it is empty.
    pub fn success_rate(&self, window: Window) -> f64 {
        let (attempts, successes) = self
            .select(window)
            .fold((0u64, 0u64), |(a, s), r| (a + 1, s + r.is_success() as u64));
        if attempts == 0 {
            return 100.0;
        }
        successes as f64 / attempts as f64 * 100.0
    }

    /// All-time successes over all-time attempts; 100.0 with no data.
    pub fn uptime_percentage(&self) -> f64 {
        if self.totals.total_attempts == 0 {
            return 100.0;
        }
        self.totals.total_successes as f64 / self.totals.total_attempts as f64 * 100.0
    }

    /// Mean latency in ms; 0.0 when the window is empty.
    pub fn avg_latency(&self, window: Window) -> f64 {
        let (count, sum) = self
            .select(window)
            .fold((0u64, 0u64), |(c, s), r| (c + 1, s + r.latency_ms));
        if count == 0 {
            return 0.0;
        }
        sum as f64 / count as f64
    }

    /// Failures grouped by error kind, most frequent first.
    pub fn error_breakdown(&self, window: Window) -> Vec<ErrorBreakdown> {
        let mut groups: HashMap<ErrorKind, (u64, u64)> = HashMap::new();
        let mut failures = 0u64;
        for result in self.select(window) {
            if let Some(kind) = result.effective_error_kind() {
                failures += 1;
                let entry = groups.entry(kind).or_insert((0, 0));
                entry.0 += 1;
                entry.1 = entry.1.max(result.timestamp_ms);
            }
        }

        let mut rows: Vec<ErrorBreakdown> = groups
            .into_iter()
            .map(|(error_kind, (count, latest))| ErrorBreakdown {
                error_kind,
                count,
                percentage: count as f64 / failures as f64 * 100.0,
                latest_occurrence: latest,
            })
            .collect();
        rows.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then(b.latest_occurrence.cmp(&a.latest_occurrence))
        });
        rows
    }

    pub fn attempts(&self, window: Window) -> u64 {
        self.select(window).count() as u64
    }

    pub fn totals(&self) -> Totals {
        self.totals
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recent results, newest first.
    pub fn recent(&self, limit: usize) -> Vec<HealthCheckResult> {
        self.results.iter().rev().take(limit).cloned().collect()
    }

    /// Change the capacity, dropping the oldest results when shrinking.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.results.len() > self.capacity {
            self.results.pop_front();
        }
    }

    /// Administrative reset: empties the buffer and streaks. All-time
    /// counters are kept so uptime is not rewritten.
    pub fn clear(&mut self) {
        self.results.clear();
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.short_circuited = 0;
    }

    /// The counter invariant. Fails only if the window is corrupted.
    pub fn is_consistent(&self) -> bool {
        self.totals.total_successes + self.totals.total_failures == self.totals.total_attempts
            && self.results.len() <= self.capacity
    }

    pub fn summary(&self, now_ms: u64) -> MetricsSummary {
        MetricsSummary {
            success_rate: self.success_rate(Window::All),
            uptime_percentage: self.uptime_percentage(),
            avg_latency_ms: self.avg_latency(Window::All),
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            totals: self.totals,
            window_len: self.results.len(),
            attempts_24h: self.attempts(Window::Since(now_ms.saturating_sub(DAY_MS))),
            last_success_at: self.last_success_at,
            last_failure_at: self.last_failure_at,
            short_circuited: self.short_circuited,
        }
    }
}
