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

use std::any::type_name;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinError;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::task_watchdog::{OutcomeSlot, TaskRecord, TaskWatchdog};
use crate::service::{Metrics, TaskConfig};
use crate::{AppError, AppResult, Shutdown};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Caller's view of a submitted task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    token: CancellationToken,
    finished: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// Runs bounded-lifetime work on a fixed pool of workers and hands every
/// submission's deadline to a [`TaskWatchdog`].
#[derive(Clone)]
pub struct TaskExecutor {
    queue: async_channel::Sender<Job>,
    watchdog: Arc<TaskWatchdog>,
    next_id: Arc<AtomicU64>,
    metrics: Arc<dyn Metrics>,
}

impl TaskExecutor {
    /// Spawns the workers and the watchdog; all of them stop on the shutdown
    /// broadcast.
    pub fn new(
        config: &TaskConfig,
        metrics: Arc<dyn Metrics>,
        notify_shutdown: broadcast::Sender<()>,
    ) -> Self {
        let (queue, jobs) = async_channel::bounded::<Job>(config.channel_capacity);
        for id in 0..config.num_workers {
            spawn_worker(id, jobs.clone(), Shutdown::subscribe(&notify_shutdown));
        }
        let watchdog = TaskWatchdog::new(metrics.clone());
        watchdog.clone().start(notify_shutdown);

        TaskExecutor {
            queue,
            watchdog,
            next_id: Arc::new(AtomicU64::new(1)),
            metrics,
        }
    }

    pub fn watchdog(&self) -> &Arc<TaskWatchdog> {
        &self.watchdog
    }

    /// Queues `work` and starts its deadline clock.
    ///
    /// Errors and panics from `work` are reported by the watchdog only.
    pub async fn submit<F>(&self, name: &str, work: F, timeout_secs: u64) -> AppResult<TaskHandle>
    where
        F: Future<Output = AppResult<()>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));
        let outcome: OutcomeSlot = Arc::new(parking_lot::Mutex::new(None));

        // tracked before it can run, so a fast task never finishes untracked
        self.watchdog.track(
            id,
            TaskRecord {
                name: name.to_string(),
                token: token.clone(),
                outcome: outcome.clone(),
                submitted_at: Instant::now(),
                timeout: Duration::from_secs(timeout_secs),
            },
        );

        let job_token = token.clone();
        let job_finished = finished.clone();
        let watchdog = self.watchdog.clone();
        let job = async move {
            let result = if job_token.is_cancelled() {
                Err(AppError::TaskCancelled(id))
            } else {
                let guarded = async move {
                    tokio::select! {
                        biased;
                        _ = job_token.cancelled() => Err(AppError::TaskCancelled(id)),
                        result = work => result,
                    }
                };
                // run apart from the worker so a panic only takes the task down
                match tokio::spawn(guarded).await {
                    Ok(result) => result,
                    Err(join_error) => Err(AppError::TaskPanicked(panic_message(join_error))),
                }
            };
            *outcome.lock() = Some(result);
            job_finished.store(true, Ordering::Release);
            watchdog.notify_finished();
        };

        if let Err(e) = self.queue.send(Box::pin(job)).await {
            self.watchdog.untrack(id);
            return Err(AppError::ChannelSendError(e.to_string()));
        }
        self.metrics.task_submitted();

        Ok(TaskHandle {
            id,
            token,
            finished,
        })
    }
}

fn spawn_worker(id: usize, jobs: async_channel::Receiver<Job>, mut shutdown: Shutdown) {
    tokio::spawn(async move {
        debug!("task worker {} started", id);
        loop {
            tokio::select! {
                job = jobs.recv() => match job {
                    Ok(job) => job.await,
                    Err(_) => break,
                },
                _ = shutdown.recv() => break,
            }
        }
        debug!("task worker {} exited", id);
    });
}

fn panic_message(join_error: JoinError) -> String {
    if join_error.is_cancelled() {
        return "task aborted".to_string();
    }
    let payload = join_error.into_panic();
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        let type_name = get_type_name(&payload);
        error!("task panicked with an unknown payload type: {}", type_name);
        format!("unknown panic payload: {}", type_name)
    }
}

fn get_type_name<T>(_: &T) -> &'static str {
    type_name::<T>()
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;
    use crate::service::{setup_local_tracing, InMemoryMetrics};

    #[fixture]
    #[once]
    fn setup() {
        setup_local_tracing().expect("failed to setup tracing");
    }

    fn executor(metrics: Arc<InMemoryMetrics>) -> (TaskExecutor, broadcast::Sender<()>) {
        let (notify_shutdown, _) = broadcast::channel(1);
        let config = TaskConfig {
            channel_capacity: 16,
            num_workers: 2,
        };
        let executor = TaskExecutor::new(&config, metrics, notify_shutdown.clone());
        (executor, notify_shutdown)
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_hung_task_cancelled_after_deadline(_setup: ()) {
        let metrics = Arc::new(InMemoryMetrics::default());
        let (executor, _notify) = executor(metrics.clone());

        let handle = executor
            .submit("hung", std::future::pending(), 5)
            .await
            .unwrap();
        assert_eq!(executor.watchdog().tracked(), 1);

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert!(!handle.is_cancelled());
        assert_eq!(executor.watchdog().tracked(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(handle.is_cancelled());
        assert_eq!(executor.watchdog().tracked(), 0);
        assert_eq!(metrics.snapshot().tasks_timed_out, 1);

        // the worker is released once the cancelled task unwinds
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.is_finished());
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_completed_task_untracked(_setup: ()) {
        let metrics = Arc::new(InMemoryMetrics::default());
        let (executor, _notify) = executor(metrics.clone());

        let handle = executor
            .submit(
                "quick",
                async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(())
                },
                10,
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(handle.is_finished());
        assert!(!handle.is_cancelled());
        assert_eq!(executor.watchdog().tracked(), 0);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_submitted, 1);
        assert_eq!(snapshot.tasks_completed, 1);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_failures_stay_inside_watchdog(_setup: ()) {
        let metrics = Arc::new(InMemoryMetrics::default());
        let (executor, _notify) = executor(metrics.clone());

        executor
            .submit(
                "failing",
                async { Err(AppError::InvalidValue("bad input".into())) },
                10,
            )
            .await
            .unwrap();
        executor
            .submit(
                "panicking",
                async {
                    if true {
                        panic!("handler bug");
                    }
                    Ok(())
                },
                10,
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(executor.watchdog().tracked(), 0);
        assert_eq!(metrics.snapshot().tasks_failed, 2);

        // the pool still runs work afterwards
        let handle = executor.submit("after", async { Ok(()) }, 10).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_finished());
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_caller_cancel(_setup: ()) {
        let metrics = Arc::new(InMemoryMetrics::default());
        let (executor, _notify) = executor(metrics.clone());

        let handle = executor
            .submit("cancel-me", std::future::pending(), 60)
            .await
            .unwrap();
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_finished());
        assert_eq!(executor.watchdog().tracked(), 0);
        // a caller-side cancel is reported as a failed task
        assert_eq!(metrics.snapshot().tasks_failed, 1);
    }
}
