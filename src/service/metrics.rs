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

//! Metrics sink shared by the watchdogs.
//!
//! The sink is constructed once by the caller and handed to every component
//! that records into it. [`InMemoryMetrics`] keeps plain counters that tests
//! can inspect and reset; [`OtelMetrics`] forwards to OpenTelemetry
//! instruments on the process meter provider.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::{global, KeyValue};

pub trait Metrics: Send + Sync + 'static {
    fn connection_registered(&self);
    fn connection_timed_out(&self, name: &str, idle: Duration);
    fn task_submitted(&self);
    fn task_completed(&self, elapsed: Duration);
    fn task_failed(&self);
    fn task_timed_out(&self);
    fn reset(&self);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_registered: u64,
    pub connections_timed_out: u64,
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_timed_out: u64,
}

#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    connections_registered: AtomicU64,
    connections_timed_out: AtomicU64,
    tasks_submitted: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_timed_out: AtomicU64,
}

impl InMemoryMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_registered: self.connections_registered.load(Ordering::Relaxed),
            connections_timed_out: self.connections_timed_out.load(Ordering::Relaxed),
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_timed_out: self.tasks_timed_out.load(Ordering::Relaxed),
        }
    }
}

impl Metrics for InMemoryMetrics {
    fn connection_registered(&self) {
        self.connections_registered.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_timed_out(&self, _name: &str, _idle: Duration) {
        self.connections_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    fn task_submitted(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    fn task_completed(&self, _elapsed: Duration) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    fn task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn task_timed_out(&self) {
        self.tasks_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.connections_registered.store(0, Ordering::Relaxed);
        self.connections_timed_out.store(0, Ordering::Relaxed);
        self.tasks_submitted.store(0, Ordering::Relaxed);
        self.tasks_completed.store(0, Ordering::Relaxed);
        self.tasks_failed.store(0, Ordering::Relaxed);
        self.tasks_timed_out.store(0, Ordering::Relaxed);
    }
}

pub struct OtelMetrics {
    connections: Counter<u64>,
    connection_timeouts: Counter<u64>,
    connection_idle: Histogram<f64>,
    tasks: Counter<u64>,
    task_outcomes: Counter<u64>,
    task_duration: Histogram<f64>,
}

impl OtelMetrics {
    pub fn new() -> Self {
        let meter = global::meter(env!("CARGO_PKG_NAME"));
        OtelMetrics {
            connections: meter
                .u64_counter("wirehub.connections.registered")
                .with_description("connections registered with the watchdog")
                .init(),
            connection_timeouts: meter
                .u64_counter("wirehub.connections.timed_out")
                .with_description("connections reaped for being idle")
                .init(),
            connection_idle: meter
                .f64_histogram("wirehub.connections.idle_seconds")
                .with_description("idle time of reaped connections")
                .init(),
            tasks: meter
                .u64_counter("wirehub.tasks.submitted")
                .with_description("tasks submitted to the executor")
                .init(),
            task_outcomes: meter
                .u64_counter("wirehub.tasks.finished")
                .with_description("finished tasks by outcome")
                .init(),
            task_duration: meter
                .f64_histogram("wirehub.tasks.duration_seconds")
                .with_description("wall time of successfully completed tasks")
                .init(),
        }
    }

    fn outcome(&self, outcome: &'static str) {
        self.task_outcomes
            .add(1, &[KeyValue::new("outcome", outcome)]);
    }
}

impl Default for OtelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics for OtelMetrics {
    fn connection_registered(&self) {
        self.connections.add(1, &[]);
    }

    fn connection_timed_out(&self, _name: &str, idle: Duration) {
        self.connection_timeouts.add(1, &[]);
        self.connection_idle.record(idle.as_secs_f64(), &[]);
    }

    fn task_submitted(&self) {
        self.tasks.add(1, &[]);
    }

    fn task_completed(&self, elapsed: Duration) {
        self.outcome("completed");
        self.task_duration.record(elapsed.as_secs_f64(), &[]);
    }

    fn task_failed(&self) {
        self.outcome("failed");
    }

    fn task_timed_out(&self) {
        self.outcome("timed_out");
    }

    // otel instruments are cumulative and owned by the meter provider
    fn reset(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_reset() {
        let metrics = InMemoryMetrics::default();
        metrics.task_submitted();
        metrics.task_submitted();
        metrics.task_timed_out();
        metrics.connection_timed_out("c1", Duration::from_secs(3));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_submitted, 2);
        assert_eq!(snapshot.tasks_timed_out, 1);
        assert_eq!(snapshot.connections_timed_out, 1);

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }
}
