//! Reusable single-flight lease.
//!
//! Guards an operation so at most one instance is in flight, with an
//! acquisition cooldown and an internal force-release timer as a safety net
//! for the case where the external release signal never arrives. Used by
//! the response scheduler and the language-reminder debounce instead of
//! ad hoc timer logic at each call site.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

struct State {
    active: bool,
    last_acquired: Option<Instant>,
    /// Bumped on every acquisition so a stale force-release timer cannot
    /// release a newer lease
    generation: u64,
}

struct Inner {
    state: Mutex<State>,
    force_release: Duration,
}

/// Single-flight guard. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SingleFlight {
    inner: Arc<Inner>,
}

impl SingleFlight {
    pub fn new(force_release: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    active: false,
                    last_acquired: None,
                    generation: 0,
                }),
                force_release,
            }),
        }
    }

    /// Try to acquire the lease.
    ///
    /// Returns `None` while a lease is active or while the cooldown since
    /// the last successful acquisition has not elapsed. On success a
    /// force-release timer is armed; explicit release cancels it by
    /// generation.
    pub fn acquire(&self, cooldown: Duration) -> Option<Lease> {
        let generation = {
            let mut state = self.inner.state.lock();
            if state.active {
                return None;
            }
            if let Some(last) = state.last_acquired
                && last.elapsed() < cooldown
            {
                return None;
            }
            state.active = true;
            state.generation += 1;
            state.last_acquired = Some(Instant::now());
            state.generation
        };

        let inner = self.inner.clone();
        let force_release = self.inner.force_release;
        tokio::spawn(async move {
            tokio::time::sleep(force_release).await;
            let mut state = inner.state.lock();
            if state.active && state.generation == generation {
                state.active = false;
                tracing::debug!(
                    after_ms = force_release.as_millis() as u64,
                    "Single-flight lease force-released; completion signal never arrived"
                );
            }
        });

        Some(Lease {
            inner: self.inner.clone(),
            generation,
        })
    }

    /// Release regardless of who holds the lease. Used when the external
    /// completion signal arrives without a lease handle at hand.
    pub fn release(&self) {
        let mut state = self.inner.state.lock();
        if state.active {
            state.active = false;
        }
    }

    /// Whether a lease is currently held.
    pub fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }
}

/// Handle to an acquired lease. Releasing is explicit: dropping the handle
/// keeps the lease held until the force-release timer fires, because the
/// guarded operation outlives the code path that acquired it.
pub struct Lease {
    inner: Arc<Inner>,
    generation: u64,
}

impl Lease {
    /// Release the lease if it is still the current one.
    pub fn release(self) {
        let mut state = self.inner.state.lock();
        if state.active && state.generation == self.generation {
            state.active = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_blocked_while_active() {
        let flight = SingleFlight::new(Duration::from_secs(30));
        let lease = flight.acquire(Duration::ZERO).unwrap();
        assert!(flight.acquire(Duration::ZERO).is_none());
        lease.release();
        assert!(flight.acquire(Duration::ZERO).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_blocks_reacquisition() {
        let flight = SingleFlight::new(Duration::from_secs(30));
        let cooldown = Duration::from_millis(1500);

        let lease = flight.acquire(cooldown).unwrap();
        lease.release();

        // Released, but still inside the cooldown window.
        assert!(flight.acquire(cooldown).is_none());

        tokio::time::advance(Duration::from_millis(1600)).await;
        assert!(flight.acquire(cooldown).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_release_after_timeout() {
        let flight = SingleFlight::new(Duration::from_secs(30));
        let _lease = flight.acquire(Duration::ZERO).unwrap();
        assert!(flight.is_active());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!flight.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_does_not_release_new_lease() {
        let flight = SingleFlight::new(Duration::from_secs(30));
        let lease = flight.acquire(Duration::ZERO).unwrap();
        lease.release();

        tokio::time::advance(Duration::from_secs(10)).await;
        let _second = flight.acquire(Duration::ZERO).unwrap();

        // t=35s: the first lease's timer has fired, the second's has not.
        tokio::time::advance(Duration::from_secs(25)).await;
        tokio::task::yield_now().await;
        assert!(flight.is_active(), "stale timer released the wrong lease");

        // t=45s: the second lease's own timer force-releases it.
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert!(!flight.is_active());
    }
}
