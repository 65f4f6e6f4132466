use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Periodic task that invokes `reset` once per window.
///
/// The first reset happens one full window after spawn. The task stops when the
/// window is dropped or [`RateWindow::shutdown`] is awaited.
#[derive(Debug)]
pub struct RateWindow {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl RateWindow {
    pub fn spawn<F>(period: Duration, reset: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        reset();
                        debug!(period_secs = period.as_secs(), "rate window reset");
                    }
                }
            }
        });
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for RateWindow {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
