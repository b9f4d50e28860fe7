//! Connection lifecycle controller
//!
//! Owns the connect / backoff / cooldown state machine of one device:
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Connected
//!      ^                          |                  |
//!      |                        fail            link failure
//!      |                          v                  |
//!      +---- Retrying <-----------+------------------+
//!                                 |
//!                        fail, attempts == max
//!                                 v
//!            CoolingDown --(2 x max backoff)--> Connecting (attempts reset)
//! ```
//!
//! Retry delay after the n-th failed attempt is
//! `min(base * 1.5^(n-1), max) * jitter` with jitter uniform in `[0.8, 1.2]`.
//! Retries run in a single cancellable task; `disconnect()` cancels it before
//! returning so no timer outlives a stopped device.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};

// ============================================================================
// Policy
// ============================================================================

/// Reconnect policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Attempts per run before cooling down (at least 1)
    pub max_attempts: u32,
    /// First retry delay
    pub base_backoff_ms: u64,
    /// Delay cap; the cooldown lasts twice this value
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Jitter half-width, 0.2 gives factors in [0.8, 1.2]
    pub jitter: f64,
    /// Upper bound for a single connect attempt
    pub connect_timeout_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            multiplier: 1.5,
            jitter: 0.2,
            connect_timeout_ms: 5000,
        }
    }
}

impl ReconnectPolicy {
    /// Policy with the default attempt budget of a protocol family
    pub fn for_family(family: gridlink_model::ProtocolFamily) -> Self {
        use gridlink_model::ProtocolFamily;
        let max_attempts = match family {
            ProtocolFamily::Modbus | ProtocolFamily::Eebus => 5,
            ProtocolFamily::Ocpp | ProtocolFamily::Tcpip => 10,
        };
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(BridgeError::config("max_attempts must be at least 1"));
        }
        if self.base_backoff_ms == 0 {
            return Err(BridgeError::config("base_backoff_ms must be positive"));
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(BridgeError::config(format!(
                "base_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.base_backoff_ms, self.max_backoff_ms
            )));
        }
        if self.multiplier < 1.0 {
            return Err(BridgeError::config("multiplier must be >= 1.0"));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(BridgeError::config("jitter must be in [0.0, 1.0)"));
        }
        Ok(())
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn cooldown(&self) -> Duration {
        self.max_backoff() * 2
    }

    /// Un-jittered delay after `attempts` failed attempts
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(64) as i32;
        let millis = self.base_backoff_ms as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max_backoff_ms as f64) as u64)
    }

    /// Jittered delay after `attempts` failed attempts
    pub fn jittered_backoff(&self, attempts: u32) -> Duration {
        let factor = if self.jitter > 0.0 {
            rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter))
        } else {
            1.0
        };
        self.backoff_for(attempts).mul_f64(factor)
    }
}

// ============================================================================
// Hooks
// ============================================================================

/// The protocol-specific half of a connection
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish the link; connection-class errors are retried
    async fn connect_link(&self) -> Result<()>;

    /// Tear down the link; must be safe to call when already down
    async fn disconnect_link(&self);
}

/// Notified on lifecycle transitions
#[async_trait]
pub trait LifecycleObserver: Send + Sync {
    async fn on_connected(&self) {}

    /// Link went down, explicitly or by failure
    async fn on_disconnected(&self) {}

    /// A run of `attempts` failures ended; the controller now waits `cooldown`
    async fn on_exhausted(&self, _attempts: u32, _cooldown: Duration) {}
}

/// Observer that ignores everything
pub struct NoopObserver;

impl LifecycleObserver for NoopObserver {}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Retrying,
    CoolingDown,
}

/// Reconnection statistics tracking
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReconnectStats {
    pub total_attempts: u64,
    pub successful_connects: u64,
    pub failed_attempts: u64,
    pub exhaustions: u64,
    pub link_failures: u64,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

struct LifecycleState {
    phase: ConnectionPhase,
    /// Set by connect(), cleared by disconnect()
    wanted: bool,
    attempts: u32,
    backoff: Duration,
    pending_retry: Option<CancellationToken>,
    stats: ReconnectStats,
}

/// Point-in-time view for status reporting
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleSnapshot {
    pub phase: ConnectionPhase,
    pub connected: bool,
    pub attempts: u32,
    pub backoff_ms: u64,
    pub retry_pending: bool,
    pub stats: ReconnectStats,
}

// ============================================================================
// Controller
// ============================================================================

struct ControllerInner {
    name: String,
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    observer: Arc<dyn LifecycleObserver>,
    state: Mutex<LifecycleState>,
    /// Serializes connect attempts, teardown and retry scheduling
    op_lock: tokio::sync::Mutex<()>,
}

/// Connection lifecycle of one device; cheap to clone
#[derive(Clone)]
pub struct ConnectionController {
    inner: Arc<ControllerInner>,
}

impl ConnectionController {
    pub fn new(
        name: impl Into<String>,
        policy: ReconnectPolicy,
        connector: Arc<dyn Connector>,
        observer: Arc<dyn LifecycleObserver>,
    ) -> Self {
        let backoff = policy.base_backoff();
        Self {
            inner: Arc::new(ControllerInner {
                name: name.into(),
                policy,
                connector,
                observer,
                state: Mutex::new(LifecycleState {
                    phase: ConnectionPhase::Disconnected,
                    wanted: false,
                    attempts: 0,
                    backoff,
                    pending_retry: None,
                    stats: ReconnectStats::default(),
                }),
                op_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.inner.policy
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().phase == ConnectionPhase::Connected
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.inner.state.lock().phase
    }

    pub fn attempts(&self) -> u32 {
        self.inner.state.lock().attempts
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        let state = self.inner.state.lock();
        LifecycleSnapshot {
            phase: state.phase,
            connected: state.phase == ConnectionPhase::Connected,
            attempts: state.attempts,
            backoff_ms: state.backoff.as_millis() as u64,
            retry_pending: state.pending_retry.is_some(),
            stats: state.stats.clone(),
        }
    }

    /// Connect now
    ///
    /// No-op when already connected. A pending retry is superseded by this
    /// attempt. On failure a retry is scheduled and the error returned.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        let guard = inner.op_lock.lock().await;
        {
            let mut state = inner.state.lock();
            state.wanted = true;
            if state.phase == ConnectionPhase::Connected {
                return Ok(());
            }
            if let Some(token) = state.pending_retry.take() {
                token.cancel();
            }
        }

        match inner.attempt().await {
            Ok(()) => {
                drop(guard);
                inner.observer.on_connected().await;
                Ok(())
            },
            Err(e) => {
                self.schedule_retry();
                drop(guard);
                Err(e)
            },
        }
    }

    /// Stop the device: cancel pending retries, tear down the link
    ///
    /// Idempotent; the observer only hears about it if a link was up.
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            state.wanted = false;
            if let Some(token) = state.pending_retry.take() {
                token.cancel();
            }
        }

        let guard = inner.op_lock.lock().await;
        let was_connected = {
            let mut state = inner.state.lock();
            let was = state.phase == ConnectionPhase::Connected;
            state.phase = ConnectionPhase::Disconnected;
            state.attempts = 0;
            state.backoff = inner.policy.base_backoff();
            was
        };
        inner.connector.disconnect_link().await;
        drop(guard);

        if was_connected {
            info!("{} disconnected", inner.name);
            inner.observer.on_disconnected().await;
        }
        Ok(())
    }

    /// Report that an established link broke
    ///
    /// Ignored unless currently connected, so concurrent reports from several
    /// tasks start only one retry sequence.
    pub async fn handle_link_failure(&self, reason: &str) {
        let inner = &self.inner;
        let guard = inner.op_lock.lock().await;
        {
            let mut state = inner.state.lock();
            if !state.wanted || state.phase != ConnectionPhase::Connected {
                return;
            }
            state.phase = ConnectionPhase::Disconnected;
            state.stats.link_failures += 1;
            state.stats.last_error = Some(reason.to_string());
        }
        warn!("{} link lost: {}", inner.name, reason);
        inner.connector.disconnect_link().await;
        self.schedule_retry();
        drop(guard);

        inner.observer.on_disconnected().await;
    }

    /// Start the retry task; caller holds `op_lock`
    fn schedule_retry(&self) {
        let token = CancellationToken::new();
        {
            let mut state = self.inner.state.lock();
            if !state.wanted {
                return;
            }
            if let Some(previous) = state.pending_retry.replace(token.clone()) {
                previous.cancel();
            }
            state.phase = if state.attempts >= self.inner.policy.max_attempts {
                ConnectionPhase::CoolingDown
            } else {
                ConnectionPhase::Retrying
            };
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.retry_loop(token).await });
    }
}

impl ControllerInner {
    /// One connect attempt; caller holds `op_lock`
    async fn attempt(&self) -> Result<()> {
        let attempt_no = {
            let mut state = self.state.lock();
            state.attempts += 1;
            state.stats.total_attempts += 1;
            state.phase = ConnectionPhase::Connecting;
            state.attempts
        };
        debug!(
            "{} connect attempt {}/{}",
            self.name, attempt_no, self.policy.max_attempts
        );

        let result =
            match tokio::time::timeout(self.policy.connect_timeout(), self.connector.connect_link())
                .await
            {
                Ok(result) => result,
                Err(_) => Err(BridgeError::timeout(format!(
                    "connect timed out after {:?}",
                    self.policy.connect_timeout()
                ))),
            };

        let mut state = self.state.lock();
        match result {
            Ok(()) => {
                state.phase = ConnectionPhase::Connected;
                state.attempts = 0;
                state.backoff = self.policy.base_backoff();
                state.stats.successful_connects += 1;
                state.stats.last_connected = Some(Utc::now());
                info!("{} connected (attempt {})", self.name, attempt_no);
                Ok(())
            },
            Err(e) => {
                state.phase = ConnectionPhase::Disconnected;
                state.stats.failed_attempts += 1;
                state.stats.last_error = Some(e.to_string());
                warn!("{} connect attempt {} failed: {}", self.name, attempt_no, e);
                Err(e)
            },
        }
    }

    async fn retry_loop(self: Arc<Self>, token: CancellationToken) {
        loop {
            // The run is over as soon as its last allowed attempt has failed
            let step = {
                let mut state = self.state.lock();
                if token.is_cancelled() {
                    return;
                }
                if state.attempts >= self.policy.max_attempts {
                    state.phase = ConnectionPhase::CoolingDown;
                    state.stats.exhaustions += 1;
                    RetryStep::Cooldown(state.attempts)
                } else {
                    state.phase = ConnectionPhase::Retrying;
                    state.backoff = self.policy.backoff_for(state.attempts);
                    RetryStep::Backoff(self.policy.jittered_backoff(state.attempts))
                }
            };
            match step {
                RetryStep::Cooldown(attempts) => {
                    let cooldown = self.policy.cooldown();
                    warn!(
                        "{} gave up after {} attempts, cooling down for {:?}",
                        self.name, attempts, cooldown
                    );
                    self.observer.on_exhausted(attempts, cooldown).await;
                    if !sleep_unless_cancelled(&token, cooldown).await {
                        return;
                    }
                },
                RetryStep::Backoff(wait) => {
                    debug!("{} retrying in {:?}", self.name, wait);
                    if !sleep_unless_cancelled(&token, wait).await {
                        return;
                    }
                },
            }

            let guard = self.op_lock.lock().await;
            if token.is_cancelled() {
                return;
            }
            if matches!(step, RetryStep::Cooldown(_)) {
                let mut state = self.state.lock();
                state.attempts = 0;
                state.backoff = self.policy.base_backoff();
                info!("{} cooldown over, resuming retries", self.name);
            }

            match self.attempt().await {
                Ok(()) => {
                    // Replacing or cancelling the pending token needs op_lock,
                    // so an uncancelled token here is still the pending one.
                    let superseded = {
                        let mut state = self.state.lock();
                        if token.is_cancelled() {
                            true
                        } else {
                            state.pending_retry = None;
                            false
                        }
                    };
                    drop(guard);
                    if !superseded {
                        self.observer.on_connected().await;
                    }
                    return;
                },
                Err(_) => drop(guard),
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum RetryStep {
    Backoff(Duration),
    Cooldown(u32),
}

/// `false` when cancelled first
async fn sleep_unless_cancelled(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_sequence_is_capped() {
        let policy = ReconnectPolicy {
            base_backoff_ms: 1000,
            max_backoff_ms: 3000,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(1500));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(2250));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(3000));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(3000));
        assert_eq!(policy.cooldown(), Duration::from_millis(6000));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = ReconnectPolicy::default();
        for attempts in 1..=8 {
            let nominal = policy.backoff_for(attempts).as_secs_f64();
            for _ in 0..200 {
                let d = policy.jittered_backoff(attempts).as_secs_f64();
                assert!(d >= nominal * 0.8 - 1e-9, "{d} below bound of {nominal}");
                assert!(d <= nominal * 1.2 + 1e-9, "{d} above bound of {nominal}");
            }
        }
    }

    #[test]
    fn test_policy_validation() {
        assert!(ReconnectPolicy::default().validate().is_ok());
        let zero = ReconnectPolicy {
            max_attempts: 0,
            ..ReconnectPolicy::default()
        };
        assert!(zero.validate().is_err());
        let inverted = ReconnectPolicy {
            base_backoff_ms: 10_000,
            max_backoff_ms: 1000,
            ..ReconnectPolicy::default()
        };
        assert!(inverted.validate().is_err());
    }

    struct FlakyConnector {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect_link(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(BridgeError::connection("refused"));
            }
            Ok(())
        }

        async fn disconnect_link(&self) {}
    }

    fn controller(failures: u32) -> (ConnectionController, Arc<FlakyConnector>) {
        let connector = Arc::new(FlakyConnector {
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        });
        let policy = ReconnectPolicy {
            max_attempts: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 1000,
            ..ReconnectPolicy::default()
        };
        let controller = ConnectionController::new(
            "test",
            policy,
            connector.clone(),
            Arc::new(NoopObserver),
        );
        (controller, connector)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_success_resets_attempts() {
        let (controller, _) = controller(0);
        controller.connect().await.unwrap();
        assert!(controller.is_connected());
        assert_eq!(controller.attempts(), 0);
        // second connect is a no-op
        controller.connect().await.unwrap();
        assert_eq!(controller.snapshot().stats.total_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_retries_in_background() {
        let (controller, connector) = controller(2);
        assert!(controller.connect().await.is_err());
        assert!(controller.snapshot().retry_pending);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(controller.is_connected());
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
        assert!(!controller.snapshot().retry_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_retry() {
        let (controller, connector) = controller(100);
        assert!(controller.connect().await.is_err());
        controller.disconnect().await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(controller.phase(), ConnectionPhase::Disconnected);
        assert!(!controller.snapshot().retry_pending);
    }

    #[derive(Default)]
    struct CountingObserver {
        exhausted: AtomicU32,
    }

    #[async_trait]
    impl LifecycleObserver for CountingObserver {
        async fn on_exhausted(&self, attempts: u32, cooldown: Duration) {
            assert_eq!(attempts, 3);
            assert_eq!(cooldown, Duration::from_millis(2000));
            self.exhausted.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_cools_down_then_resets() {
        let connector = Arc::new(FlakyConnector {
            failures_left: AtomicU32::new(100),
            calls: AtomicU32::new(0),
        });
        let observer = Arc::new(CountingObserver::default());
        let policy = ReconnectPolicy {
            max_attempts: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 1000,
            jitter: 0.0,
            ..ReconnectPolicy::default()
        };
        let controller =
            ConnectionController::new("test", policy, connector.clone(), observer.clone());
        let calls = || connector.calls.load(Ordering::SeqCst);

        // attempts at 0, 100 and 250 ms; the third failure starts the cooldown
        assert!(controller.connect().await.is_err());
        tokio::time::sleep(Duration::from_millis(260)).await;
        assert_eq!(calls(), 3);
        assert_eq!(observer.exhausted.load(Ordering::SeqCst), 1);
        assert_eq!(controller.phase(), ConnectionPhase::CoolingDown);

        // 2 s of cooldown: the next attempt is due at 2250 ms
        tokio::time::sleep(Duration::from_millis(1980)).await;
        assert_eq!(calls(), 3);

        // fresh run: 2250 and 2350 ms
        tokio::time::sleep(Duration::from_millis(160)).await;
        assert_eq!(calls(), 5);
        assert_eq!(controller.attempts(), 2);
        assert_eq!(controller.phase(), ConnectionPhase::Retrying);
        assert_eq!(observer.exhausted.load(Ordering::SeqCst), 1);

        // its third failure at 2500 ms ends that run too
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls(), 6);
        assert_eq!(observer.exhausted.load(Ordering::SeqCst), 2);
        assert_eq!(controller.snapshot().stats.exhaustions, 2);
        assert_eq!(controller.phase(), ConnectionPhase::CoolingDown);

        controller.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_budget_cools_down_at_once() {
        let connector = Arc::new(FlakyConnector {
            failures_left: AtomicU32::new(100),
            calls: AtomicU32::new(0),
        });
        let policy = ReconnectPolicy {
            max_attempts: 1,
            base_backoff_ms: 100,
            max_backoff_ms: 1000,
            ..ReconnectPolicy::default()
        };
        let controller =
            ConnectionController::new("test", policy, connector.clone(), Arc::new(NoopObserver));

        assert!(controller.connect().await.is_err());
        assert_eq!(controller.phase(), ConnectionPhase::CoolingDown);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(controller.snapshot().stats.exhaustions, 1);
        controller.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_failure_triggers_reconnect() {
        let (controller, connector) = controller(0);
        controller.connect().await.unwrap();

        controller.handle_link_failure("socket closed").await;
        // duplicate report while already retrying is ignored
        controller.handle_link_failure("socket closed").await;
        assert!(!controller.is_connected());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(controller.is_connected());
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);
        assert_eq!(controller.snapshot().stats.link_failures, 1);
    }
}
