use failsafe::backoff::{self, Constant};
use failsafe::failure_policy::{self, ConsecutiveFailures};
use failsafe::futures::CircuitBreaker;
use failsafe::{Config, Instrument, StateMachine};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct WindowState {
    /// Set when the breaker trips, cleared once the caller has waited it out.
    opened_at: Option<Instant>,
    /// Trips since the breaker was last closed; drives the cooldown growth.
    consecutive_opens: u32,
}

/// Tracks breaker transitions on tokio's clock.
#[derive(Debug, Clone, Default)]
struct OpenWindow(Arc<Mutex<WindowState>>);

impl OpenWindow {
    fn lock(&self) -> std::sync::MutexGuard<'_, WindowState> {
        // The state is plain data; a poisoned lock still holds a usable value
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Instrument for OpenWindow {
    fn on_call_rejected(&self) {
        tracing::debug!("Geocoder circuit breaker rejected a call");
    }

    fn on_open(&self) {
        let mut state = self.lock();
        state.opened_at = Some(Instant::now());
        state.consecutive_opens = state.consecutive_opens.saturating_add(1);
        tracing::warn!(
            "✗ Geocoder circuit breaker OPEN (trip #{})",
            state.consecutive_opens
        );
    }

    fn on_half_open(&self) {
        tracing::info!("Geocoder circuit breaker HALF-OPEN, trying the service again");
    }

    fn on_closed(&self) {
        let mut state = self.lock();
        if state.consecutive_opens > 0 {
            tracing::info!("✓ Geocoder circuit breaker CLOSED, service recovered");
        }
        *state = WindowState::default();
    }
}

type GeocoderStateMachine = StateMachine<ConsecutiveFailures<Constant>, OpenWindow>;

/// How a lookup may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed: normal lookup.
    Closed,
    /// The open window elapsed: a single trial lookup decides whether it closes.
    HalfOpen,
    /// Cancelled while waiting for the window to elapse.
    Cancelled,
}

/// Circuit breaker guarding the geocoding service.
///
/// failsafe counts consecutive failures and the half-open transition; the
/// open window itself is timed on tokio's clock so callers can await it (and
/// race it against cancellation) instead of being rejected outright.
///
/// # Configuration
///
/// - **Failure threshold**: `threshold` consecutive failed lookups trip the breaker.
/// - **Cooldown**: starts at `cooldown`, doubles on every trip that follows a
///   failed trial lookup, capped at `max_cooldown`. Closing resets it.
pub struct GeocoderCircuitBreaker {
    machine: GeocoderStateMachine,
    window: OpenWindow,
    cooldown: Duration,
    max_cooldown: Duration,
}

impl GeocoderCircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration, max_cooldown: Duration) -> Self {
        let window = OpenWindow::default();
        // Zero delay: failsafe half-opens as soon as `admit` has waited out the window
        let failure_policy =
            failure_policy::consecutive_failures(threshold.max(1), backoff::constant(Duration::ZERO));
        let machine = Config::new()
            .failure_policy(failure_policy)
            .instrument(window.clone())
            .build();

        Self {
            machine,
            window,
            cooldown,
            max_cooldown: max_cooldown.max(cooldown),
        }
    }

    /// True while a trip has not been waited out yet.
    pub fn is_open(&self) -> bool {
        self.window.lock().opened_at.is_some()
    }

    /// Cooldown applied after the given trip (1-based).
    pub fn cooldown_for(&self, trip: u32) -> Duration {
        let exponent = trip.saturating_sub(1).min(16);
        self.cooldown
            .saturating_mul(1u32 << exponent)
            .min(self.max_cooldown)
    }

    /// Waits out an open breaker before the next lookup.
    ///
    /// Returns `Closed` immediately when the breaker is not open.
    pub async fn admit(&self, cancel: &CancellationToken) -> Admission {
        let deadline = {
            let state = self.window.lock();
            match state.opened_at {
                Some(opened_at) => opened_at + self.cooldown_for(state.consecutive_opens),
                None => return Admission::Closed,
            }
        };

        let now = Instant::now();
        if deadline > now {
            tracing::info!(
                "Geocoder circuit breaker open, waiting {:?} before retrying",
                deadline - now
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Admission::Cancelled,
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }

        self.window.lock().opened_at = None;
        Admission::HalfOpen
    }

    /// Runs `future` under the breaker, recording its outcome.
    pub async fn call<F, T, E>(&self, future: F) -> Result<T, failsafe::Error<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        self.machine.call(future).await
    }
}

/// Creates the circuit breaker for geocoder lookups so a dead or blocking
/// service is not hammered for every remaining row of the batch.
pub fn create_geocoder_circuit_breaker(
    threshold: u32,
    cooldown: Duration,
    max_cooldown: Duration,
) -> GeocoderCircuitBreaker {
    GeocoderCircuitBreaker::new(threshold, cooldown, max_cooldown)
}
