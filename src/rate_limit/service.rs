use super::clock::{Clock, SystemClock};
use super::local::LocalStore;
use super::redis::{BackendError, RedisStore, SharedStore};
use super::types::{BackendState, Decision, Policy};
use crate::config::RateLimitingConfig;
use crate::error::{ApiError, Result};
use crate::metrics;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Runtime knobs for the limiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterSettings {
    /// Upper bound on a shared-store handshake or check
    pub connect_timeout: Duration,
    /// Reconnection attempts after the shared store fails (0 disables)
    pub max_reconnect_attempts: u32,
    /// Delay step between reconnection attempts
    pub reconnect_base_delay: Duration,
    /// Ceiling on the reconnection delay
    pub reconnect_max_delay: Duration,
    /// How often expired local records are swept
    pub sweep_interval: Duration,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            reconnect_base_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(3),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl LimiterSettings {
    /// Delay before reconnection attempt `attempt` (1-based)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_base_delay
            .saturating_mul(attempt)
            .min(self.reconnect_max_delay)
    }
}

/// Backend state shared with the reconnect task
#[derive(Debug, Clone)]
struct StateCell {
    state: Arc<AtomicU8>,
    transitions: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl StateCell {
    fn new(state: BackendState) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(state as u8)),
            transitions: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn get(&self) -> BackendState {
        BackendState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set(&self, state: BackendState) -> BackendState {
        let previous = BackendState::from_u8(self.state.swap(state as u8, Ordering::SeqCst));
        if previous != state {
            self.record(state);
        }
        previous
    }

    /// Move `from -> to`. Only the caller that wins the swap sees `true`,
    /// which is what keeps transition logging to once per transition.
    fn transition(&self, from: BackendState, to: BackendState) -> bool {
        let moved = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if moved {
            self.record(to);
        }
        moved
    }

    fn record(&self, to: BackendState) {
        self.transitions.fetch_add(1, Ordering::SeqCst);
        metrics::record_transition(to);
    }

    fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::SeqCst)
    }

    /// Mark closed. Returns `true` for the first caller only.
    fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Sliding-window rate limiter with a local backend and an optional shared
/// store it degrades away from on failure.
///
/// Must be constructed inside a Tokio runtime: the sweep task is spawned on
/// construction and stopped by [`RateLimiter::close`] or on drop.
pub struct RateLimiter {
    local: Arc<LocalStore>,
    shared: Option<Arc<dyn SharedStore>>,
    state: StateCell,
    clock: Arc<dyn Clock>,
    settings: LimiterSettings,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    reconnector: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`RateLimiter`]
pub struct RateLimiterBuilder {
    settings: LimiterSettings,
    clock: Arc<dyn Clock>,
    shared: Option<Arc<dyn SharedStore>>,
}

impl RateLimiterBuilder {
    pub fn settings(mut self, settings: LimiterSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn shared_store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.shared = Some(store);
        self
    }

    /// Build the limiter, performing the shared-store handshake if one was
    /// given. A failed handshake degrades to local; it is never an error.
    pub async fn build(self) -> RateLimiter {
        let initial = if self.shared.is_some() {
            BackendState::Connecting
        } else {
            BackendState::Unconfigured
        };

        let limiter = RateLimiter {
            local: Arc::new(LocalStore::new()),
            shared: self.shared,
            state: StateCell::new(initial),
            clock: self.clock,
            settings: self.settings,
            sweeper: Mutex::new(None),
            reconnector: Mutex::new(None),
        };
        limiter.start_sweeper();

        match &limiter.shared {
            None => info!("Shared store not configured, using in-memory rate limiting"),
            Some(store) => {
                match handshake(store.as_ref(), limiter.settings.connect_timeout).await {
                    Ok(()) => {
                        limiter
                            .state
                            .transition(BackendState::Connecting, BackendState::SharedActive);
                        info!("Shared store reachable, using it for rate limiting");
                    }
                    Err(e) => {
                        limiter
                            .state
                            .transition(BackendState::Connecting, BackendState::DegradedLocal);
                        warn!(
                            "Shared store unavailable: {}, falling back to in-memory rate limiting",
                            e
                        );
                        limiter.spawn_reconnect();
                    }
                }
            }
        }

        limiter
    }
}

impl RateLimiter {
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder {
            settings: LimiterSettings::default(),
            clock: Arc::new(SystemClock),
            shared: None,
        }
    }

    /// Local-only limiter. Stays `Unconfigured` for its whole life.
    pub fn local_only(settings: LimiterSettings) -> Self {
        info!("Initializing local-only rate limiter");

        let limiter = Self {
            local: Arc::new(LocalStore::new()),
            shared: None,
            state: StateCell::new(BackendState::Unconfigured),
            clock: Arc::new(SystemClock),
            settings,
            sweeper: Mutex::new(None),
            reconnector: Mutex::new(None),
        };
        limiter.start_sweeper();
        limiter
    }

    /// Limiter backed by `store` with local fallback
    pub async fn with_shared_store(settings: LimiterSettings, store: Arc<dyn SharedStore>) -> Self {
        Self::builder()
            .settings(settings)
            .shared_store(store)
            .build()
            .await
    }

    /// Build from configuration. Only an unparsable Redis URL is an error;
    /// an unreachable one degrades.
    pub async fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        let settings = config.limiter_settings();

        match config.redis_url.as_deref().filter(|url| !url.is_empty()) {
            None => Ok(Self::local_only(settings)),
            Some(url) => {
                info!("Initializing rate limiter with Redis backend");
                let store = RedisStore::new(url)
                    .map_err(|e| ApiError::Config(format!("Invalid Redis URL: {}", e)))?;
                Ok(Self::with_shared_store(settings, Arc::new(store)).await)
            }
        }
    }

    /// Check-and-increment for `client_key` under `policy`.
    ///
    /// Never fails: shared-store errors are absorbed here, the call is
    /// admitted, and later calls use the local backend.
    pub async fn check(&self, client_key: &str, policy: &Policy) -> Decision {
        let key = policy.key_for(client_key);
        let now_ms = self.clock.now_ms();
        let window_ms = policy.window_ms();

        let shared = match self.state.get() {
            BackendState::SharedActive => self.shared.as_ref(),
            _ => None,
        };

        let decision = match shared {
            Some(store) => {
                match with_timeout(self.settings.connect_timeout, store.hit(&key, window_ms, now_ms))
                    .await
                {
                    Ok(count) => Decision::from_count(
                        count,
                        policy.max_requests(),
                        now_ms.saturating_add(window_ms),
                    ),
                    Err(e) => {
                        self.degrade(&e);
                        metrics::record_fail_open(policy.name());
                        Decision::fail_open(policy, now_ms)
                    }
                }
            }
            None => {
                let hit = self.local.hit(&key, window_ms, now_ms);
                Decision::from_count(
                    hit.count,
                    policy.max_requests(),
                    hit.window_start_ms.saturating_add(window_ms),
                )
            }
        };

        metrics::record_decision(policy.name(), decision.admitted);
        debug!(
            key = %key,
            count = decision.count,
            remaining = decision.remaining,
            admitted = decision.admitted,
            "Rate limit check"
        );

        decision
    }

    /// Current backend state
    pub fn state(&self) -> BackendState {
        self.state.get()
    }

    /// Backend state transitions since construction
    pub fn transitions(&self) -> u64 {
        self.state.transitions()
    }

    /// Pin the backend state. Does not start or stop reconnection.
    pub fn force_state(&self, state: BackendState) {
        let previous = self.state.set(state);
        if previous != state {
            info!("Rate limiter backend forced from {} to {}", previous, state);
        }
    }

    /// Whether checks currently go to the shared store
    pub fn is_shared_active(&self) -> bool {
        self.shared.is_some() && self.state.get() == BackendState::SharedActive
    }

    /// The local backend
    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    /// Sweep expired local records now
    pub fn sweep_now(&self) -> usize {
        let removed = self.local.sweep(self.clock.now_ms());
        metrics::record_swept(removed);
        removed
    }

    /// Stop background tasks and release the shared-store connection.
    /// Safe to call more than once.
    pub async fn close(&self) {
        if !self.state.close() {
            return;
        }

        // Leave SharedActive before releasing the store, so a check still in
        // flight cannot win the degrade and schedule a reconnect.
        let released = self
            .state
            .transition(BackendState::SharedActive, BackendState::DegradedLocal);

        abort_task(&self.sweeper);
        abort_task(&self.reconnector);

        if let Some(store) = &self.shared {
            store.close().await;
            if released {
                info!("Rate limiter closed, shared store released");
            }
        }
    }

    /// Whether [`RateLimiter::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    fn degrade(&self, cause: &BackendError) {
        if self
            .state
            .transition(BackendState::SharedActive, BackendState::DegradedLocal)
        {
            warn!(
                "Shared store error, falling back to in-memory rate limiting: {}",
                cause
            );
            self.spawn_reconnect();
        }
    }

    fn start_sweeper(&self) {
        let local = Arc::clone(&self.local);
        let clock = Arc::clone(&self.clock);
        let period = self.settings.sweep_interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = local.sweep(clock.now_ms());
                metrics::record_swept(removed);
                if removed > 0 {
                    debug!("Swept {} expired rate limit records", removed);
                }
            }
        });

        if let Ok(mut slot) = self.sweeper.lock() {
            *slot = Some(handle);
        }
    }

    fn spawn_reconnect(&self) {
        let Some(store) = self.shared.clone() else {
            return;
        };
        if self.settings.max_reconnect_attempts == 0 || self.state.is_closed() {
            return;
        }

        let Ok(mut slot) = self.reconnector.lock() else {
            return;
        };
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let state = self.state.clone();
        let settings = self.settings.clone();
        *slot = Some(tokio::spawn(reconnect_loop(store, state, settings)));
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        abort_task(&self.sweeper);
        abort_task(&self.reconnector);
    }
}

async fn reconnect_loop(store: Arc<dyn SharedStore>, state: StateCell, settings: LimiterSettings) {
    for attempt in 1..=settings.max_reconnect_attempts {
        tokio::time::sleep(settings.reconnect_delay(attempt)).await;

        if state.is_closed() || state.get() != BackendState::DegradedLocal {
            return;
        }

        match handshake(store.as_ref(), settings.connect_timeout).await {
            Ok(()) if state.is_closed() => {
                store.close().await;
                return;
            }
            Ok(()) => {
                if state.transition(BackendState::DegradedLocal, BackendState::SharedActive) {
                    info!(attempt, "Shared store reconnected, resuming shared rate limiting");
                }
                return;
            }
            Err(e) => debug!(attempt, error = %e, "Shared store reconnection attempt failed"),
        }
    }

    error!(
        attempts = settings.max_reconnect_attempts,
        "Shared store max reconnection attempts reached, staying on in-memory rate limiting"
    );
}

async fn handshake(store: &dyn SharedStore, timeout: Duration) -> std::result::Result<(), BackendError> {
    with_timeout(timeout, store.connect()).await
}

async fn with_timeout<T>(
    timeout: Duration,
    operation: impl std::future::Future<Output = std::result::Result<T, BackendError>>,
) -> std::result::Result<T, BackendError> {
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(timeout)),
    }
}

fn abort_task(slot: &Mutex<Option<JoinHandle<()>>>) {
    if let Ok(mut slot) = slot.lock() {
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}
