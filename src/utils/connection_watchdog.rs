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

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, info};

use super::TaskExecutor;
use crate::service::Metrics;
use crate::{AppResult, Shutdown};

/// What the watchdog needs to know about a live connection.
pub trait WatchedConnection: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn idle_timeout(&self) -> Duration;
    /// Idle time of the quieter direction at `now`.
    fn idle_for(&self, now: Instant) -> Duration;
    fn is_shut_down(&self) -> bool;
    fn shutdown_task(self: Arc<Self>) -> Pin<Box<dyn Future<Output = AppResult<()>> + Send>>;
}

/// Whole seconds until `idle` reaches `timeout`, rounded up; zero once due.
pub fn seconds_to_timeout(timeout: Duration, idle: Duration) -> u64 {
    let remaining = timeout.saturating_sub(idle);
    remaining.as_millis().div_ceil(1000) as u64
}

/// Reaps idle connections.
///
/// Sleeps until the soonest idle deadline among the tracked connections,
/// or until a registration arrives, whichever comes first. Reaped
/// connections are shut down through the task executor, so the shutdown
/// itself runs under a deadline.
pub struct ConnectionWatchdog {
    connections: DashMap<u64, Arc<dyn WatchedConnection>>,
    registered: Notify,
    executor: TaskExecutor,
    shutdown_timeout: u64,
    metrics: Arc<dyn Metrics>,
    next_timeout: parking_lot::Mutex<Option<Duration>>,
}

impl ConnectionWatchdog {
    pub fn new(executor: TaskExecutor, shutdown_timeout: u64, metrics: Arc<dyn Metrics>) -> Arc<Self> {
        Arc::new(ConnectionWatchdog {
            connections: DashMap::new(),
            registered: Notify::new(),
            executor,
            shutdown_timeout,
            metrics,
            next_timeout: parking_lot::Mutex::new(None),
        })
    }

    pub fn register(&self, id: u64, connection: Arc<dyn WatchedConnection>) {
        debug!("watchdog tracking connection {}", connection.name());
        self.connections.insert(id, connection);
        self.metrics.connection_registered();
        self.registered.notify_one();
    }

    pub fn unregister(&self, id: u64) {
        self.connections.remove(&id);
    }

    pub fn tracked(&self) -> usize {
        self.connections.len()
    }

    /// Wait chosen by the latest check pass; `None` means wait for a registration.
    pub fn next_timeout(&self) -> Option<Duration> {
        *self.next_timeout.lock()
    }

    pub fn start(self: Arc<Self>, notify_shutdown: broadcast::Sender<()>) -> JoinHandle<()> {
        let mut shutdown = Shutdown::subscribe(&notify_shutdown);
        tokio::spawn(async move {
            loop {
                match self.next_timeout() {
                    None => {
                        tokio::select! {
                            _ = shutdown.recv() => break,
                            _ = self.registered.notified() => {}
                        }
                    }
                    Some(wait) => {
                        tokio::select! {
                            _ = shutdown.recv() => break,
                            _ = self.registered.notified() => {}
                            _ = time::sleep(wait) => {}
                        }
                    }
                }
                let next_timeout = self.check().await;
                *self.next_timeout.lock() = next_timeout;
            }
            debug!("connection watchdog exiting");
        })
    }

    /// Hands the shutdown to the executor without waiting for queue space;
    /// a full queue must not hold up the rest of the sweep.
    fn submit_shutdown(&self, connection: Arc<dyn WatchedConnection>) {
        let executor = self.executor.clone();
        let timeout = self.shutdown_timeout;
        tokio::spawn(async move {
            let name = format!("shutdown {}", connection.name());
            if let Err(e) = executor
                .submit(&name, connection.shutdown_task(), timeout)
                .await
            {
                error!("failed to submit {}: {}", name, e);
            }
        });
    }

    /// One pass: reap what is due, return the wait until the next deadline.
    pub(crate) async fn check(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut closed = Vec::new();
        let mut next_secs: Option<u64> = None;

        for entry in self.connections.iter() {
            let connection = entry.value();
            if connection.is_shut_down() {
                closed.push(*entry.key());
                continue;
            }
            let idle = connection.idle_for(now);
            let timeout = connection.idle_timeout();
            match seconds_to_timeout(timeout, idle) {
                0 => expired.push((*entry.key(), connection.clone(), idle)),
                secs => next_secs = Some(next_secs.map_or(secs, |n| n.min(secs))),
            }
        }

        for id in closed {
            self.connections.remove(&id);
        }

        for (id, connection, idle) in expired {
            if self.connections.remove(&id).is_none() {
                continue;
            }
            info!(
                "connection {} idle for {:.1}s (limit {}s), shutting down",
                connection.name(),
                idle.as_secs_f64(),
                connection.idle_timeout().as_secs()
            );
            self.metrics.connection_timed_out(connection.name(), idle);
            self.submit_shutdown(connection);
        }

        next_secs.map(Duration::from_secs)
    }
}
