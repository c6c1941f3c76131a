//! Periodic job scheduling
//!
//! The registry's bookmark flush and polling-mode capture both run on a
//! fixed interval. The core depends only on [`Scheduler`]; [`TokioScheduler`]
//! is the default, one spawned ticker per job.

use crate::common::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Work run on every tick.
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<()>;
}

/// Injected ticker abstraction.
pub trait Scheduler: Send + Sync {
    /// Run `job` every `interval`, first run one interval from now.
    fn schedule(&self, interval: Duration, job: Arc<dyn ScheduledJob>) -> ScheduleHandle;
}

/// Handle to a scheduled job. Dropping it does not stop the job.
#[derive(Debug)]
pub struct ScheduleHandle {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduleHandle {
    pub fn new(cancel: CancellationToken, task: Option<JoinHandle<()>>) -> Self {
        Self {
            cancel,
            task: Mutex::new(task),
        }
    }

    /// Stop ticking. A run already in progress completes.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop and wait for the ticker to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Scheduler backed by `tokio::time::interval`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, interval: Duration, job: Arc<dyn ScheduledJob>) -> ScheduleHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // consume initial immediate tick

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = job.run().await {
                            warn!(job = job.name(), "Scheduled job failed: {}", e);
                        }
                    }
                }
            }
            debug!(job = job.name(), "Schedule stopped");
        });
        ScheduleHandle::new(cancel, Some(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::CdcError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ScheduledJob for CountingJob {
        fn name(&self) -> &str {
            "counting"
        }

        async fn run(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CdcError::other("boom"));
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_at_interval() {
        let job = Arc::new(CountingJob {
            runs: AtomicUsize::new(0),
            fail: false,
        });
        let handle = TokioScheduler.schedule(Duration::from_secs(10), job.clone());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(26)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 3);

        handle.shutdown().await;
        assert!(handle.is_stopped());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_job_keeps_ticking() {
        let job = Arc::new(CountingJob {
            runs: AtomicUsize::new(0),
            fail: true,
        });
        let handle = TokioScheduler.schedule(Duration::from_secs(1), job.clone());
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 3);
        handle.shutdown().await;
    }
}
