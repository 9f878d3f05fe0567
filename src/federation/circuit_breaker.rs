//! Circuit breaker for outbound federation calls
//!
//! Key refreshes and account discovery during signature verification run
//! through a breaker keyed by the requesting peer (`source:{ip}`). Once a
//! peer's fetches start failing, further fetches on its behalf are skipped
//! until the cool-off elapses, and callers see the same `None` they would
//! get for an unknown key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::fetch::FetchError;
use crate::config::CircuitBreakerConfig;
use crate::metrics::{CIRCUIT_BREAKER_EVENTS_TOTAL, CIRCUIT_BREAKER_TRACKED};

const DEFAULT_MAX_TRACKED_KEYS: usize = 10_000;
const DEFAULT_COOL_OFF: Duration = Duration::from_secs(300);
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Breaker name for calls made on behalf of a remote peer.
pub fn source_breaker_name(remote: impl std::fmt::Display) -> String {
    format!("source:{}", remote)
}

/// Observable state of one breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls go through
    Closed,
    /// Calls are skipped
    Open,
    /// Cool-off elapsed; the next call is a probe
    HalfOpen,
}

#[derive(Debug, Clone)]
struct CircuitEntry {
    /// Failures in current window
    failures: u32,
    /// Window start time
    window_start: Instant,
    /// When the circuit last opened
    opened_at: Option<Instant>,
}

impl CircuitEntry {
    fn new(now: Instant) -> Self {
        Self {
            failures: 0,
            window_start: now,
            opened_at: None,
        }
    }

    fn state(&self, cool_off: Duration) -> CircuitState {
        match self.opened_at {
            Some(opened_at) if opened_at.elapsed() < cool_off => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
            None => CircuitState::Closed,
        }
    }

    fn is_idle(&self, cool_off: Duration, failure_window: Duration) -> bool {
        match self.opened_at {
            Some(_) => self.state(cool_off) != CircuitState::Open,
            None => self.window_start.elapsed() >= failure_window,
        }
    }
}

/// Keyed circuit breaker
///
/// Process-wide and shared through `Arc`. Counts are best effort: two
/// workers racing on the same name may both get a probe through while
/// half-open, which is acceptable for a safety valve.
pub struct CircuitBreaker {
    /// Breaker entries: name -> entry
    entries: Arc<RwLock<HashMap<String, CircuitEntry>>>,
    /// Failures within the window that open the circuit
    failure_threshold: u32,
    /// Time an open circuit stays open
    cool_off: Duration,
    /// Window in which failures are counted
    failure_window: Duration,
    /// Timeout applied to every wrapped call
    call_timeout: Duration,
    /// Maximum number of tracked names in memory
    max_tracked_keys: usize,
}

impl CircuitBreaker {
    /// Create new circuit breaker
    ///
    /// # Arguments
    /// * `failure_threshold` - Failures before the circuit opens (default: 1)
    /// * `cool_off` - Time before an open circuit lets a probe through (default: 5 minutes)
    pub fn new(failure_threshold: Option<u32>, cool_off: Option<Duration>) -> Self {
        let cool_off = cool_off.unwrap_or(DEFAULT_COOL_OFF);
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            failure_threshold: failure_threshold.unwrap_or(1).max(1),
            cool_off,
            failure_window: cool_off,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_tracked_keys: DEFAULT_MAX_TRACKED_KEYS,
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(
            Some(config.failure_threshold),
            Some(Duration::from_secs(config.cool_off_seconds)),
        )
        .with_failure_window(Duration::from_secs(config.failure_window_seconds))
        .with_call_timeout(Duration::from_secs(config.call_timeout_seconds))
        .with_max_tracked_keys(config.max_tracked_keys)
    }

    pub fn with_failure_window(mut self, failure_window: Duration) -> Self {
        self.failure_window = failure_window;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_max_tracked_keys(mut self, max_tracked_keys: usize) -> Self {
        self.max_tracked_keys = max_tracked_keys.max(1);
        self
    }

    /// Run `op` unless the circuit for `name` is open.
    ///
    /// Returns `Ok(None)` without calling `op` while open, and also when
    /// `op` fails with a breaker-class error (transport, TLS, timeout, 5xx),
    /// which is recorded against `name`. Other errors propagate untouched.
    pub async fn run<T, F, Fut>(&self, name: &str, op: F) -> Result<Option<T>, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, FetchError>>,
    {
        if !self.allow(name).await {
            CIRCUIT_BREAKER_EVENTS_TOTAL
                .with_label_values(&["short_circuited"])
                .inc();
            tracing::debug!(breaker = %name, "Circuit open, skipping outbound call");
            return Ok(None);
        }

        let result = match tokio::time::timeout(self.call_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        };

        match result {
            Ok(value) => {
                self.record_success(name).await;
                Ok(value)
            }
            Err(error) if error.is_breaker_failure() => {
                tracing::warn!(breaker = %name, %error, "Outbound call failed");
                self.record_failure(name).await;
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    /// Current state for a name
    pub async fn state(&self, name: &str) -> CircuitState {
        let entries = self.entries.read().await;
        entries
            .get(name)
            .map(|entry| entry.state(self.cool_off))
            .unwrap_or(CircuitState::Closed)
    }

    async fn allow(&self, name: &str) -> bool {
        match self.state(name).await {
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                CIRCUIT_BREAKER_EVENTS_TOTAL
                    .with_label_values(&["half_open_probe"])
                    .inc();
                true
            }
            CircuitState::Closed => true,
        }
    }

    async fn record_success(&self, name: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.remove(name) {
            if entry.opened_at.is_some() {
                CIRCUIT_BREAKER_EVENTS_TOTAL
                    .with_label_values(&["closed"])
                    .inc();
                tracing::info!(breaker = %name, "Circuit closed");
            }
        }
        CIRCUIT_BREAKER_TRACKED.set(entries.len() as i64);
    }

    async fn record_failure(&self, name: &str) {
        let mut entries = self.entries.write().await;

        if !entries.contains_key(name) && entries.len() >= self.max_tracked_keys {
            Self::prune_idle_locked(&mut entries, self.cool_off, self.failure_window);
            if entries.len() >= self.max_tracked_keys {
                Self::evict_one_locked(&mut entries);
            }
        }

        let now = Instant::now();
        let entry = entries
            .entry(name.to_string())
            .or_insert_with(|| CircuitEntry::new(now));

        let half_open = entry.state(self.cool_off) == CircuitState::HalfOpen;
        if entry.opened_at.is_none() && entry.window_start.elapsed() >= self.failure_window {
            entry.failures = 0;
            entry.window_start = now;
        }
        entry.failures = entry.failures.saturating_add(1);

        if half_open || (entry.opened_at.is_none() && entry.failures >= self.failure_threshold) {
            entry.opened_at = Some(now);
            CIRCUIT_BREAKER_EVENTS_TOTAL
                .with_label_values(&["opened"])
                .inc();
            tracing::warn!(
                breaker = %name,
                failures = entry.failures,
                cool_off_secs = self.cool_off.as_secs(),
                "Circuit opened"
            );
        }

        CIRCUIT_BREAKER_TRACKED.set(entries.len() as i64);
    }

    fn prune_idle_locked(
        entries: &mut HashMap<String, CircuitEntry>,
        cool_off: Duration,
        failure_window: Duration,
    ) -> usize {
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_idle(cool_off, failure_window));
        before - entries.len()
    }

    /// Make room for a new name. Closed entries go first (oldest window),
    /// open ones only when nothing else is tracked.
    fn evict_one_locked(entries: &mut HashMap<String, CircuitEntry>) {
        let victim = entries
            .iter()
            .min_by_key(|(_, entry)| {
                (
                    entry.opened_at.is_some(),
                    entry.opened_at.unwrap_or(entry.window_start),
                )
            })
            .map(|(key, _)| key.clone());

        if let Some(key) = victim {
            entries.remove(&key);
            tracing::debug!(breaker = %key, "Evicted circuit breaker entry");
        }
    }

    /// Forget everything recorded for a name
    pub async fn reset(&self, name: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(name);
    }

    /// Prune idle entries
    ///
    /// Drops closed entries whose window has elapsed and open entries whose
    /// cool-off has elapsed. Should be called periodically.
    pub async fn prune_old(&self) {
        let mut entries = self.entries.write().await;
        let removed = Self::prune_idle_locked(&mut entries, self.cool_off, self.failure_window);
        CIRCUIT_BREAKER_TRACKED.set(entries.len() as i64);

        if removed > 0 {
            tracing::debug!("Pruned {} idle circuit breaker entries", removed);
        }
    }

    /// Get circuit breaker statistics
    pub async fn stats(&self) -> CircuitBreakerStats {
        let entries = self.entries.read().await;
        let open = entries
            .values()
            .filter(|entry| entry.state(self.cool_off) == CircuitState::Open)
            .count();

        CircuitBreakerStats {
            total_entries: entries.len(),
            open_entries: open,
            failure_threshold: self.failure_threshold,
            cool_off_seconds: self.cool_off.as_secs(),
            max_tracked_keys: self.max_tracked_keys,
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    /// Total number of tracked names
    pub total_entries: usize,
    /// Names whose circuit is currently open
    pub open_entries: usize,
    pub failure_threshold: u32,
    pub cool_off_seconds: u64,
    /// Maximum number of names tracked in memory
    pub max_tracked_keys: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn failing_call(
        breaker: &CircuitBreaker,
        name: &str,
        calls: &AtomicUsize,
    ) -> Result<Option<u32>, FetchError> {
        breaker
            .run(name, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::UnexpectedStatus(503))
            })
            .await
    }

    #[tokio::test]
    async fn single_failure_opens_and_skips_next_call() {
        let breaker = CircuitBreaker::new(Some(1), Some(Duration::from_secs(300)));
        let calls = AtomicUsize::new(0);

        assert!(matches!(failing_call(&breaker, "source:1.2.3.4", &calls).await, Ok(None)));
        assert_eq!(breaker.state("source:1.2.3.4").await, CircuitState::Open);

        let skipped = breaker
            .run("source:1.2.3.4", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(7u32))
            })
            .await;
        assert!(matches!(skipped, Ok(None)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn threshold_counts_failures() {
        let breaker = CircuitBreaker::new(Some(3), Some(Duration::from_secs(300)));
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let _ = failing_call(&breaker, "peer", &calls).await;
        }
        assert_eq!(breaker.state("peer").await, CircuitState::Closed);

        let _ = failing_call(&breaker, "peer", &calls).await;
        assert_eq!(breaker.state("peer").await, CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn names_are_isolated() {
        let breaker = CircuitBreaker::new(Some(1), None);
        let calls = AtomicUsize::new(0);

        let _ = failing_call(&breaker, "source:10.0.0.1", &calls).await;

        let other = breaker
            .run("source:10.0.0.2", || async { Ok(Some(1u32)) })
            .await;
        assert!(matches!(other, Ok(Some(1))));
        assert_eq!(breaker.state("source:10.0.0.2").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_success_closes() {
        let breaker = CircuitBreaker::new(Some(1), Some(Duration::from_millis(50)));
        let calls = AtomicUsize::new(0);

        let _ = failing_call(&breaker, "peer", &calls).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(breaker.state("peer").await, CircuitState::HalfOpen);

        let probe = breaker.run("peer", || async { Ok(Some(1u32)) }).await;
        assert!(matches!(probe, Ok(Some(1))));
        assert_eq!(breaker.state("peer").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(Some(3), Some(Duration::from_millis(50)))
            .with_failure_window(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let _ = failing_call(&breaker, "peer", &calls).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        let _ = failing_call(&breaker, "peer", &calls).await;
        assert_eq!(breaker.state("peer").await, CircuitState::Open);
    }

    #[tokio::test]
    async fn non_breaker_errors_propagate_without_counting() {
        let breaker = CircuitBreaker::new(Some(1), None);

        let result: Result<Option<u32>, FetchError> = breaker
            .run("peer", || async {
                Err(FetchError::InvalidDocument("no publicKey".to_string()))
            })
            .await;

        assert!(matches!(result, Err(FetchError::InvalidDocument(_))));
        assert_eq!(breaker.state("peer").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn timeouts_count_as_failures() {
        let breaker =
            CircuitBreaker::new(Some(1), None).with_call_timeout(Duration::from_millis(20));

        let result = breaker
            .run("slow-peer", || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(Some(1u32))
            })
            .await;

        assert!(matches!(result, Ok(None)));
        assert_eq!(breaker.state("slow-peer").await, CircuitState::Open);
    }

    #[tokio::test]
    async fn eviction_keeps_open_circuits() {
        let breaker = CircuitBreaker::new(Some(2), None).with_max_tracked_keys(2);
        let calls = AtomicUsize::new(0);

        let _ = failing_call(&breaker, "peer1", &calls).await;
        let _ = failing_call(&breaker, "peer1", &calls).await;
        assert_eq!(breaker.state("peer1").await, CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(1)).await;
        let _ = failing_call(&breaker, "peer2", &calls).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        let _ = failing_call(&breaker, "peer3", &calls).await;

        let stats = breaker.stats().await;
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.open_entries, 1);
        assert_eq!(breaker.state("peer1").await, CircuitState::Open);

        // peer2's single failure was forgotten, so one more does not open it
        let _ = failing_call(&breaker, "peer2", &calls).await;
        assert_eq!(breaker.state("peer2").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn max_tracked_keys_evicts_oldest_entry() {
        let breaker = CircuitBreaker::new(Some(5), None).with_max_tracked_keys(2);
        let calls = AtomicUsize::new(0);

        let _ = failing_call(&breaker, "peer1", &calls).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        let _ = failing_call(&breaker, "peer2", &calls).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        let _ = failing_call(&breaker, "peer3", &calls).await;

        let stats = breaker.stats().await;
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.open_entries, 0);
    }

    #[test]
    fn source_breaker_name_includes_peer() {
        let ip: std::net::IpAddr = "203.0.113.7".parse().unwrap();
        assert_eq!(source_breaker_name(ip), "source:203.0.113.7");
    }
}
