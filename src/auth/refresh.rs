// Debounced token refresh scheduling
//
// Every request bumps a shared stamp and schedules a deferred check. When the
// delay elapses the check compares the stamp it captured with the live one;
// only the most recent request in a burst gets to run. Superseded timers still
// fire, they just do nothing.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

use crate::error::{ReauthError, Result};

/// Debounces refresh requests with a monotonically increasing stamp
pub struct RefreshScheduler {
    /// Last issued stamp
    stamp: Arc<AtomicU64>,

    /// Debounce delay in milliseconds
    delay_ms: AtomicU64,

    /// Set on shutdown; pending timers become no-ops
    closed: Arc<AtomicBool>,

    /// Runtime the deferred checks run on
    runtime: Handle,
}

impl RefreshScheduler {
    /// Create a scheduler bound to the current tokio runtime
    pub fn new(delay: Duration) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| ReauthError::Runtime(e.to_string()))?;
        Ok(Self::with_runtime(delay, runtime))
    }

    pub fn with_runtime(delay: Duration, runtime: Handle) -> Self {
        Self {
            stamp: Arc::new(AtomicU64::new(0)),
            delay_ms: AtomicU64::new(delay.as_millis() as u64),
            closed: Arc::new(AtomicBool::new(false)),
            runtime,
        }
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.load(Ordering::Relaxed))
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Current value of the stamp
    pub fn stamp(&self) -> u64 {
        self.stamp.load(Ordering::SeqCst)
    }

    /// Whether a timer that captured `captured` should run its action
    pub fn on_fire(&self, captured: u64) -> bool {
        should_fire(&self.stamp, &self.closed, captured)
    }

    /// Bump the stamp and run `action` after the delay unless superseded
    ///
    /// Errors from the action are logged and swallowed; nothing is retried.
    /// Returns the stamp captured for this request.
    pub fn request_refresh<F, Fut>(&self, action: F) -> u64
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let captured = self.stamp.fetch_add(1, Ordering::SeqCst) + 1;
        let stamp = Arc::clone(&self.stamp);
        let closed = Arc::clone(&self.closed);
        let delay = self.delay();

        tracing::debug!(stamp = captured, delay_ms = delay.as_millis() as u64, "Token refresh scheduled");

        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;

            if !should_fire(&stamp, &closed, captured) {
                return;
            }

            if let Err(e) = action().await {
                tracing::error!(stamp = captured, "Caught error while refreshing token: {}", e);
            }
        });

        captured
    }

    /// Stop running actions; timers already scheduled become no-ops
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn should_fire(stamp: &AtomicU64, closed: &AtomicBool, captured: u64) -> bool {
    if closed.load(Ordering::SeqCst) {
        tracing::debug!(stamp = captured, "Scheduler shut down - ignoring refresh");
        return false;
    }

    let current = stamp.load(Ordering::SeqCst);
    if current == captured {
        tracing::debug!(stamp = captured, "Stamps match - refreshing token");
        true
    } else {
        tracing::debug!(stamp = captured, current, "Stamps don't match - ignoring refresh");
        false
    }
}
