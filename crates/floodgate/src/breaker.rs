//! Circuit breaker for failure isolation
//!
//! A three-state guard that stops sending requests to a failing backend and
//! periodically probes for recovery:
//!
//! ```text
//!        failures reach threshold           recovery_time elapses
//! CLOSED ─────────────────────────▶ OPEN ─────────────────────▶ HALF_OPEN
//!    ▲                               ▲                              │
//!    │    successes reach threshold  │        any single failure    │
//!    └───────────────────────────────┼──────────────────────────────┤
//!                                    └──────────────────────────────┘
//! ```
//!
//! Two interchangeable implementations share one contract: the in-process
//! [`LocalCircuitBreaker`], and the [`CoordinatedCircuitBreaker`] which
//! keeps the same state in a shared [`StateStore`] so multiple pool
//! instances converge on one judgment about a failing backend. Callers
//! depend only on the [`CircuitBreaker`] trait, selected at construction.

use crate::store::StateStore;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests allowed
    Closed,
    /// Too many failures, requests rejected
    Open,
    /// Probing whether the backend recovered
    HalfOpen,
}

impl CircuitState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "open" => Self::Open,
            "half_open" => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time view of a breaker, for stats and error payloads
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures held against the breaker (meaningful in Closed)
    pub failure_count: u64,
    /// Successful probes so far (meaningful in HalfOpen)
    pub success_count: u64,
    /// Cumulative failures, observability only
    pub total_failures: u64,
    /// Cumulative successes, observability only
    pub total_successes: u64,
    /// Times the breaker has tripped open
    pub trip_count: u64,
    /// Time until the next probe will be admitted; zero when not Open
    pub retry_after: Duration,
}

/// Thresholds shared by both breaker implementations
#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long to stay open before admitting a probe
    pub recovery_time: Duration,
    /// Successful probes required to close again
    pub half_open_success_threshold: u32,
}

/// Failure-isolation contract consumed by the pool
#[async_trait]
pub trait CircuitBreaker: Send + Sync {
    /// Whether a request may proceed. An Open breaker past its recovery
    /// window transitions to HalfOpen and admits the caller as a probe.
    async fn allow_request(&self) -> bool;

    /// Record a successful operation
    async fn record_success(&self);

    /// Record a failed operation
    async fn record_failure(&self);

    /// Administrative override: back to Closed with all counters cleared
    async fn reset(&self);

    /// Administrative override: trip open immediately (drain, ops tooling)
    async fn force_open(&self);

    /// Current state and counters
    async fn snapshot(&self) -> BreakerSnapshot;
}

// ============================================================================
// Local (in-process) circuit breaker
// ============================================================================

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// In-process circuit breaker backed by atomics
pub struct LocalCircuitBreaker {
    settings: BreakerSettings,
    /// 0=Closed, 1=Open, 2=HalfOpen
    state: AtomicU8,
    failure_count: AtomicU64,
    /// Successful probes while HalfOpen
    success_count: AtomicU64,
    opened_at: RwLock<Option<Instant>>,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    trip_count: AtomicU64,
}

impl LocalCircuitBreaker {
    /// Create a closed breaker with the given thresholds
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            opened_at: RwLock::new(None),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            trip_count: AtomicU64::new(0),
        }
    }

    fn state(&self) -> CircuitState {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    async fn transition_to_open(&self) {
        warn!("circuit breaker tripped to OPEN");
        self.state.store(STATE_OPEN, Ordering::SeqCst);
        self.trip_count.fetch_add(1, Ordering::SeqCst);
        *self.opened_at.write().await = Some(Instant::now());
    }

    async fn transition_to_half_open(&self) {
        debug!("circuit breaker transitioning to HALF_OPEN");
        self.success_count.store(0, Ordering::SeqCst);
        self.state.store(STATE_HALF_OPEN, Ordering::SeqCst);
    }

    async fn transition_to_closed(&self) {
        debug!("circuit breaker recovered, transitioning to CLOSED");
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        *self.opened_at.write().await = None;
    }

    async fn time_until_probe(&self) -> Duration {
        if self.state() != CircuitState::Open {
            return Duration::ZERO;
        }
        match *self.opened_at.read().await {
            Some(at) => self.settings.recovery_time.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }
}

#[async_trait]
impl CircuitBreaker for LocalCircuitBreaker {
    async fn allow_request(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = {
                    let opened_at = self.opened_at.read().await;
                    opened_at.map(|at| at.elapsed())
                };
                match elapsed {
                    Some(elapsed) if elapsed >= self.settings.recovery_time => {
                        // More than one prober can slip through here; a
                        // failing probe re-trips immediately, so the race
                        // is bounded.
                        self.transition_to_half_open().await;
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    async fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::SeqCst);
        match self.state() {
            CircuitState::Closed => {
                // Success forgives accumulated failures immediately
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= u64::from(self.settings.half_open_success_threshold) {
                    self.transition_to_closed().await;
                }
            }
            CircuitState::Open => {}
        }
    }

    async fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::SeqCst);
        match self.state() {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= u64::from(self.settings.failure_threshold) {
                    self.transition_to_open().await;
                }
            }
            CircuitState::HalfOpen => {
                // No averaging, no second chance
                self.transition_to_open().await;
            }
            CircuitState::Open => {}
        }
    }

    async fn reset(&self) {
        self.transition_to_closed().await;
    }

    async fn force_open(&self) {
        self.transition_to_open().await;
    }

    async fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state(),
            failure_count: self.failure_count.load(Ordering::SeqCst),
            success_count: self.success_count.load(Ordering::SeqCst),
            total_failures: self.total_failures.load(Ordering::SeqCst),
            total_successes: self.total_successes.load(Ordering::SeqCst),
            trip_count: self.trip_count.load(Ordering::SeqCst),
            retry_after: self.time_until_probe().await,
        }
    }
}

// ============================================================================
// Externally-coordinated circuit breaker
// ============================================================================

fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Circuit breaker whose state lives in a shared [`StateStore`].
///
/// Multiple pool instances against the same backend resource observe and
/// update one converged judgment. Counter updates use atomic `incr` and
/// state transitions use `compare_and_swap`, since concurrent writers are
/// expected. Individual field updates are not transactional as a group;
/// the same bounded probe race the local breaker allows.
///
/// Store failures never take the pool down: the breaker logs a warning and
/// fails open (allows the request).
pub struct CoordinatedCircuitBreaker {
    settings: BreakerSettings,
    store: Arc<dyn StateStore>,
    /// Key prefix scoped to the logical backend resource
    namespace: String,
}

impl CoordinatedCircuitBreaker {
    /// Create a breaker persisting under `namespace` in `store`
    pub fn new(settings: BreakerSettings, store: Arc<dyn StateStore>, namespace: String) -> Self {
        Self {
            settings,
            store,
            namespace,
        }
    }

    fn key(&self, field: &str) -> String {
        format!("{}:breaker:{}", self.namespace, field)
    }

    async fn read_state(&self) -> CircuitState {
        match self.store.get(&self.key("state")).await {
            Ok(Some(s)) => CircuitState::parse(&s),
            Ok(None) => CircuitState::Closed,
            Err(e) => {
                warn!(error = %e, "breaker state read failed, assuming closed");
                CircuitState::Closed
            }
        }
    }

    async fn read_counter(&self, field: &str) -> u64 {
        match self.store.get(&self.key(field)).await {
            Ok(Some(v)) => v.parse().unwrap_or(0),
            _ => 0,
        }
    }

    async fn put(&self, field: &str, value: &str) {
        if let Err(e) = self.store.put(&self.key(field), value).await {
            warn!(field, error = %e, "breaker state write failed");
        }
    }

    async fn incr(&self, field: &str, delta: i64) -> i64 {
        match self.store.incr(&self.key(field), delta).await {
            Ok(v) => v,
            Err(e) => {
                warn!(field, error = %e, "breaker counter update failed");
                0
            }
        }
    }

    async fn trip_open(&self, from: CircuitState) {
        let key = self.key("state");
        let mut swapped = self
            .store
            .compare_and_swap(&key, Some(from.as_str()), CircuitState::Open.as_str())
            .await
            .unwrap_or(false);

        // A breaker that has never transitioned has no state key yet
        if !swapped && from == CircuitState::Closed {
            swapped = self
                .store
                .compare_and_swap(&key, None, CircuitState::Open.as_str())
                .await
                .unwrap_or(false);
        }

        if swapped {
            warn!(namespace = %self.namespace, "coordinated circuit breaker tripped to OPEN");
            self.put("opened_at_ms", &epoch_millis().to_string()).await;
            self.incr("trips", 1).await;
        }
        // Losing the race means another instance tripped it; nothing to do
    }
}

#[async_trait]
impl CircuitBreaker for CoordinatedCircuitBreaker {
    async fn allow_request(&self) -> bool {
        match self.read_state().await {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = self.read_counter("opened_at_ms").await as i64;
                let elapsed = epoch_millis().saturating_sub(opened_at);
                if elapsed < self.settings.recovery_time.as_millis() as i64 {
                    return false;
                }

                // Recovery window elapsed: race other instances to become
                // the prober. Losing the CAS still admits this caller if a
                // peer moved the state to half-open.
                match self
                    .store
                    .compare_and_swap(
                        &self.key("state"),
                        Some(CircuitState::Open.as_str()),
                        CircuitState::HalfOpen.as_str(),
                    )
                    .await
                {
                    Ok(true) => {
                        debug!(namespace = %self.namespace, "coordinated breaker to HALF_OPEN");
                        self.put("successes", "0").await;
                        true
                    }
                    Ok(false) => self.read_state().await == CircuitState::HalfOpen,
                    Err(e) => {
                        warn!(error = %e, "breaker probe CAS failed, failing open");
                        true
                    }
                }
            }
        }
    }

    async fn record_success(&self) {
        self.incr("total_successes", 1).await;
        match self.read_state().await {
            CircuitState::Closed => {
                self.put("failures", "0").await;
            }
            CircuitState::HalfOpen => {
                let successes = self.incr("successes", 1).await;
                if successes >= i64::from(self.settings.half_open_success_threshold) {
                    let swapped = self
                        .store
                        .compare_and_swap(
                            &self.key("state"),
                            Some(CircuitState::HalfOpen.as_str()),
                            CircuitState::Closed.as_str(),
                        )
                        .await
                        .unwrap_or(false);
                    if swapped {
                        debug!(namespace = %self.namespace, "coordinated breaker recovered to CLOSED");
                        self.put("failures", "0").await;
                        self.put("successes", "0").await;
                        self.put("opened_at_ms", "0").await;
                    }
                }
            }
            CircuitState::Open => {}
        }
    }

    async fn record_failure(&self) {
        self.incr("total_failures", 1).await;
        match self.read_state().await {
            CircuitState::Closed => {
                let failures = self.incr("failures", 1).await;
                if failures >= i64::from(self.settings.failure_threshold) {
                    self.trip_open(CircuitState::Closed).await;
                }
            }
            CircuitState::HalfOpen => {
                self.trip_open(CircuitState::HalfOpen).await;
            }
            CircuitState::Open => {}
        }
    }

    async fn reset(&self) {
        self.put("state", CircuitState::Closed.as_str()).await;
        self.put("failures", "0").await;
        self.put("successes", "0").await;
        self.put("opened_at_ms", "0").await;
    }

    async fn force_open(&self) {
        self.put("state", CircuitState::Open.as_str()).await;
        self.put("opened_at_ms", &epoch_millis().to_string()).await;
        self.incr("trips", 1).await;
    }

    async fn snapshot(&self) -> BreakerSnapshot {
        let state = self.read_state().await;
        let retry_after = if state == CircuitState::Open {
            let opened_at = self.read_counter("opened_at_ms").await as i64;
            let elapsed = epoch_millis().saturating_sub(opened_at).max(0) as u128;
            Duration::from_millis(
                self.settings
                    .recovery_time
                    .as_millis()
                    .saturating_sub(elapsed) as u64,
            )
        } else {
            Duration::ZERO
        };

        BreakerSnapshot {
            state,
            failure_count: self.read_counter("failures").await,
            success_count: self.read_counter("successes").await,
            total_failures: self.read_counter("total_failures").await,
            total_successes: self.read_counter("total_successes").await,
            trip_count: self.read_counter("trips").await,
            retry_after,
        }
    }
}
