//! Fixed-interval polling.
//!
//! The first run fires as soon as the poller starts, then once per interval.
//! Runs never overlap: a run that outlasts the interval pushes the next tick
//! back instead of bursting to catch up. A failed run is reported and the
//! schedule carries on.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use geosync_core::{system_clock, FetchError, PollerError, SharedClock, TimestampMs};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback for failed runs.
pub type PollErrorHandler = Arc<dyn Fn(&FetchError) + Send + Sync>;

/// Snapshot of the poller's schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PollerState {
    pub is_polling: bool,
    /// Start of the most recent run, epoch ms.
    pub last_run: Option<TimestampMs>,
    /// Earliest start of the next run, epoch ms. `None` while stopped.
    pub next_run: Option<TimestampMs>,
    pub run_count: u64,
    pub error_count: u64,
}

pub struct Poller {
    state: Arc<Mutex<PollerState>>,
    cancel: Mutex<Option<CancellationToken>>,
    clock: SharedClock,
    on_error: Option<PollErrorHandler>,
}

impl Poller {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            state: Arc::new(Mutex::new(PollerState::default())),
            cancel: Mutex::new(None),
            clock,
            on_error: None,
        }
    }

    pub fn on_error(mut self, handler: impl Fn(&FetchError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Begin invoking `fetch` every `interval_ms`. Must be called inside a
    /// Tokio runtime.
    ///
    /// Returns [`PollerError::AlreadyRunning`] if the poller was started and
    /// not stopped since.
    pub fn start<F, Fut, T>(&self, mut fetch: F, interval_ms: u64) -> Result<(), PollerError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
        T: Send + 'static,
    {
        if interval_ms == 0 {
            return Err(PollerError::ZeroInterval);
        }

        let mut slot = self.cancel.lock();
        if slot.is_some() {
            return Err(PollerError::AlreadyRunning);
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());

        {
            let mut state = self.state.lock();
            state.is_polling = true;
            state.next_run = Some(self.clock.now_ms());
        }

        let state = Arc::clone(&self.state);
        let clock = Arc::clone(&self.clock);
        let on_error = self.on_error.clone();
        let interval_ms_i64 = i64::try_from(interval_ms).unwrap_or(i64::MAX);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let started = clock.now_ms();
                state.lock().last_run = Some(started);
                debug!(interval_ms, "Poll run started");

                // In-flight runs finish even if the poller is stopped meanwhile.
                let outcome = fetch().await;

                {
                    let mut state = state.lock();
                    state.run_count += 1;
                    if outcome.is_err() {
                        state.error_count += 1;
                    }
                    if !token.is_cancelled() {
                        state.next_run = Some(started.saturating_add(interval_ms_i64));
                    }
                }

                if let Err(err) = outcome {
                    warn!(error = %err, "Poll run failed, continuing");
                    if let Some(handler) = &on_error {
                        handler(&err);
                    }
                }
            }
            debug!("Poll loop exited");
        });

        info!(interval_ms, "Poller started");
        Ok(())
    }

    /// Cancel the pending tick. A run already in flight completes.
    pub fn stop(&self) {
        let Some(token) = self.cancel.lock().take() else {
            return;
        };
        token.cancel();
        let mut state = self.state.lock();
        state.is_polling = false;
        state.next_run = None;
        info!("Poller stopped");
    }

    pub fn state(&self) -> PollerState {
        *self.state.lock()
    }

    pub fn is_polling(&self) -> bool {
        self.state.lock().is_polling
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if let Some(token) = self.cancel.get_mut().take() {
            token.cancel();
        }
    }
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting() -> (Arc<AtomicU32>, impl FnMut() -> std::future::Ready<Result<(), FetchError>> + Send + 'static) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let fetch = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(()))
        };
        (calls, fetch)
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_immediately_then_every_interval() {
        let poller = Poller::new();
        let (calls, fetch) = counting();
        poller.start(fetch, 100).unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let state = poller.state();
        assert!(state.is_polling);
        assert_eq!(state.run_count, 3);
        assert!(state.last_run.is_some());
        assert!(state.next_run.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_rejected() {
        let poller = Poller::new();
        let (_, fetch) = counting();
        poller.start(fetch, 100).unwrap();
        let (_, again) = counting();
        assert_eq!(poller.start(again, 100), Err(PollerError::AlreadyRunning));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_rejected() {
        let poller = Poller::new();
        let (_, fetch) = counting();
        assert_eq!(poller.start(fetch, 0), Err(PollerError::ZeroInterval));
        assert!(!poller.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_runs() {
        let poller = Poller::new();
        let (calls, fetch) = counting();
        poller.start(fetch, 100).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        poller.stop();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let state = poller.state();
        assert!(!state.is_polling);
        assert_eq!(state.next_run, None);

        let (calls, fetch) = counting();
        poller.start(fetch, 100).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_do_not_stop_schedule() {
        let errors = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&errors);
        let poller = Poller::new().on_error(move |err| {
            assert!(matches!(err, FetchError::Http { status: 500, .. }));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        poller
            .start(
                move || {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n % 2 == 0 {
                            Err(FetchError::http(500, "Internal Server Error"))
                        } else {
                            Ok(n)
                        }
                    }
                },
                100,
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(errors.load(Ordering::SeqCst), 2);
        assert_eq!(poller.state().error_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_in_flight_run_finish() {
        let finished = Arc::new(AtomicU32::new(0));
        let done = Arc::clone(&finished);
        let poller = Poller::new();
        poller
            .start(
                move || {
                    let done = Arc::clone(&done);
                    async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        done.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                1_000,
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        poller.stop();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(poller.state().run_count, 1);
    }
}
