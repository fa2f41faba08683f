// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::service::Metrics;
use crate::{AppResult, Shutdown};

/// Where a task's result lands once its work has run.
pub(crate) type OutcomeSlot = Arc<parking_lot::Mutex<Option<AppResult<()>>>>;

pub(crate) struct TaskRecord {
    pub(crate) name: String,
    pub(crate) token: CancellationToken,
    pub(crate) outcome: OutcomeSlot,
    pub(crate) submitted_at: Instant,
    pub(crate) timeout: Duration,
}

/// Enforces task deadlines.
///
/// Holds one record per in-flight task. Each cycle waits until either the
/// nearest deadline passes or something is tracked/finishes, then cancels
/// overdue tasks and retires finished ones. Task errors are only logged and
/// counted here; they never reach whoever submitted the task.
pub struct TaskWatchdog {
    tasks: DashMap<u64, TaskRecord>,
    wake: Notify,
    metrics: Arc<dyn Metrics>,
}

impl TaskWatchdog {
    pub fn new(metrics: Arc<dyn Metrics>) -> Arc<Self> {
        Arc::new(TaskWatchdog {
            tasks: DashMap::new(),
            wake: Notify::new(),
            metrics,
        })
    }

    pub(crate) fn track(&self, id: u64, record: TaskRecord) {
        self.tasks.insert(id, record);
        self.wake.notify_one();
    }

    pub(crate) fn untrack(&self, id: u64) {
        self.tasks.remove(&id);
    }

    /// Called by a task right after storing its outcome.
    pub(crate) fn notify_finished(&self) {
        self.wake.notify_one();
    }

    pub fn tracked(&self) -> usize {
        self.tasks.len()
    }

    pub fn start(self: Arc<Self>, notify_shutdown: broadcast::Sender<()>) -> JoinHandle<()> {
        let mut shutdown = Shutdown::subscribe(&notify_shutdown);
        tokio::spawn(async move {
            let mut next_timeout: Option<Duration> = None;
            loop {
                match next_timeout {
                    None => {
                        tokio::select! {
                            _ = shutdown.recv() => break,
                            _ = self.wake.notified() => {}
                        }
                    }
                    Some(wait) => {
                        tokio::select! {
                            _ = shutdown.recv() => break,
                            _ = self.wake.notified() => {}
                            _ = time::sleep(wait) => {}
                        }
                    }
                }
                next_timeout = self.sweep();
            }
            debug!("task watchdog exiting");
        })
    }

    /// One pass over the tracked tasks. Returns the time until the nearest
    /// remaining deadline, or `None` when nothing is left.
    pub(crate) fn sweep(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut overdue = Vec::new();
        let mut finished = Vec::new();
        let mut next_timeout: Option<Duration> = None;

        // collect first: removing while iterating would lock the same shard
        for entry in self.tasks.iter() {
            let record = entry.value();
            let elapsed = now.saturating_duration_since(record.submitted_at);
            if record.outcome.lock().is_some() {
                finished.push(*entry.key());
            } else if elapsed >= record.timeout {
                overdue.push(*entry.key());
            } else {
                let remaining = record.timeout - elapsed;
                next_timeout = Some(next_timeout.map_or(remaining, |n| n.min(remaining)));
            }
        }

        for id in overdue {
            let Some((_, record)) = self.tasks.remove(&id) else {
                continue;
            };
            // the task may have finished between the scan and now
            let outcome = record.outcome.lock().take();
            match outcome {
                Some(outcome) => self.retire(id, &record, outcome, now),
                None => {
                    record.token.cancel();
                    self.metrics.task_timed_out();
                    warn!(
                        "task {} ({}) exceeded {}s, cancelled",
                        id,
                        record.name,
                        record.timeout.as_secs()
                    );
                }
            }
        }

        for id in finished {
            if let Some((_, record)) = self.tasks.remove(&id) {
                let outcome = record.outcome.lock().take();
                if let Some(outcome) = outcome {
                    self.retire(id, &record, outcome, now);
                }
            }
        }

        next_timeout
    }

    fn retire(&self, id: u64, record: &TaskRecord, outcome: AppResult<()>, now: Instant) {
        match outcome {
            Ok(()) => {
                let elapsed = now.saturating_duration_since(record.submitted_at);
                self.metrics.task_completed(elapsed);
                trace!("task {} ({}) completed", id, record.name);
            }
            Err(e) => {
                self.metrics.task_failed();
                error!("task {} ({}) failed: {}", id, record.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::InMemoryMetrics;
    use crate::AppError;

    fn record(timeout: u64) -> (TaskRecord, OutcomeSlot, CancellationToken) {
        let outcome: OutcomeSlot = Arc::new(parking_lot::Mutex::new(None));
        let token = CancellationToken::new();
        let record = TaskRecord {
            name: "test".to_string(),
            token: token.clone(),
            outcome: outcome.clone(),
            submitted_at: Instant::now(),
            timeout: Duration::from_secs(timeout),
        };
        (record, outcome, token)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_reports_nearest_deadline() {
        let metrics = Arc::new(InMemoryMetrics::default());
        let watchdog = TaskWatchdog::new(metrics.clone());
        assert_eq!(watchdog.sweep(), None);

        let (long, _, _) = record(9);
        let (short, _, _) = record(4);
        watchdog.track(1, long);
        watchdog.track(2, short);

        time::advance(Duration::from_secs(1)).await;
        assert_eq!(watchdog.sweep(), Some(Duration::from_secs(3)));
        assert_eq!(watchdog.tracked(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_cancels_overdue() {
        let metrics = Arc::new(InMemoryMetrics::default());
        let watchdog = TaskWatchdog::new(metrics.clone());
        let (overdue, _, token) = record(2);
        watchdog.track(1, overdue);

        time::advance(Duration::from_secs(2)).await;
        assert_eq!(watchdog.sweep(), None);
        assert!(token.is_cancelled());
        assert_eq!(watchdog.tracked(), 0);
        assert_eq!(metrics.snapshot().tasks_timed_out, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overdue_but_finished_is_drained() {
        let metrics = Arc::new(InMemoryMetrics::default());
        let watchdog = TaskWatchdog::new(metrics.clone());
        let (finished, outcome, token) = record(1);
        watchdog.track(1, finished);
        *outcome.lock() = Some(Err(AppError::InvalidValue("boom".into())));

        time::advance(Duration::from_secs(5)).await;
        watchdog.sweep();
        assert!(!token.is_cancelled());
        assert_eq!(watchdog.tracked(), 0);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_failed, 1);
        assert_eq!(snapshot.tasks_timed_out, 0);
    }
}
