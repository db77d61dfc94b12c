//! Cancellable periodic tasks.
//!
//! A [`ScheduledTask`] runs an async job every `period` on the tokio runtime
//! until stopped, dropped, or until the job returns [`ControlFlow::Break`].
//! The first run happens one period after `start()`.

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

pub struct ScheduledTask {
    name: &'static str,
    period: Duration,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    pub fn new(name: &'static str, period: Duration) -> Self {
        Self {
            name,
            period,
            handle: None,
        }
    }

    /// Start (or restart) the task. Must be called inside a tokio runtime.
    pub fn start<F, Fut>(&mut self, mut job: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        self.stop();
        let name = self.name;
        let period = self.period;
        tracing::debug!(task = name, ?period, "starting scheduled task");
        let first = Instant::now() + period;
        self.handle = Some(tokio::spawn(async move {
            let mut ticker = interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if job().await.is_break() {
                    tracing::debug!(task = name, "scheduled task finished");
                    break;
                }
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            tracing::debug!(task = self.name, "stopping scheduled task");
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.stop();
    }
}
