use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::save::FlushReport;
use crate::world::{EntityKey, TickReport};

static METRICS_LOCK_POISON_WARNED: AtomicBool = AtomicBool::new(false);

fn warn_metrics_lock_poison_once(operation: &'static str) {
    if METRICS_LOCK_POISON_WARNED
        .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
    {
        warn!(operation, "metrics lock poisoned; recovered inner value");
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HeartbeatMetricsSnapshot {
    pub tps: f32,
    pub fired_per_sec: f32,
    pub saved_per_sec: f32,
    pub late_fires: u32,
    pub flush_failures: u32,
    pub hydrated: u32,
    pub scheduled_effects: usize,
    pub save_queue_depth: usize,
    pub lazy_queue_depth: usize,
}

/// Queue sizes sampled by the loop when a snapshot is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepths {
    pub scheduled_effects: usize,
    pub save_queue: usize,
    pub lazy_queue: usize,
}

/// Latest snapshot, shareable with whatever wants to report on the loop.
#[derive(Clone, Debug)]
pub struct MetricsHandle {
    snapshot: Arc<RwLock<HeartbeatMetricsSnapshot>>,
}

impl Default for MetricsHandle {
    fn default() -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(HeartbeatMetricsSnapshot::default())),
        }
    }
}

impl MetricsHandle {
    pub fn snapshot(&self) -> HeartbeatMetricsSnapshot {
        match self.snapshot.read() {
            Ok(guard) => *guard,
            Err(poisoned) => {
                warn_metrics_lock_poison_once("read");
                *poisoned.into_inner()
            }
        }
    }

    pub(crate) fn publish(&self, snapshot: HeartbeatMetricsSnapshot) {
        match self.snapshot.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => {
                warn_metrics_lock_poison_once("write");
                let mut guard = poisoned.into_inner();
                *guard = snapshot;
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct MetricsAccumulator {
    interval_start: Instant,
    interval: Duration,
    ticks: u32,
    fired: u32,
    late_fires: u32,
    saved: u32,
    flush_failures: u32,
    hydrated: u32,
}

impl MetricsAccumulator {
    pub(crate) fn new(interval: Duration) -> Self {
        Self::starting_at(Instant::now(), interval)
    }

    pub(crate) fn starting_at(start: Instant, interval: Duration) -> Self {
        Self {
            interval_start: start,
            interval,
            ticks: 0,
            fired: 0,
            late_fires: 0,
            saved: 0,
            flush_failures: 0,
            hydrated: 0,
        }
    }

    pub(crate) fn record_tick(&mut self, report: &TickReport) {
        self.ticks = self.ticks.saturating_add(1);
        self.fired = self.fired.saturating_add(report.schedules.fired as u32);
        self.late_fires = self.late_fires.saturating_add(report.schedules.late as u32);
    }

    pub(crate) fn record_flush(&mut self, report: &FlushReport<EntityKey>) {
        let written = report.saved + report.registered.len();
        self.saved = self.saved.saturating_add(written as u32);
    }

    pub(crate) fn record_flush_failure(&mut self) {
        self.flush_failures = self.flush_failures.saturating_add(1);
    }

    pub(crate) fn record_hydrated(&mut self, count: usize) {
        self.hydrated = self.hydrated.saturating_add(count as u32);
    }

    pub(crate) fn maybe_snapshot(
        &mut self,
        now: Instant,
        depths: QueueDepths,
    ) -> Option<HeartbeatMetricsSnapshot> {
        let elapsed = now.saturating_duration_since(self.interval_start);
        if elapsed < self.interval {
            return None;
        }

        let elapsed_seconds = elapsed.as_secs_f32().max(f32::EPSILON);
        let snapshot = HeartbeatMetricsSnapshot {
            tps: self.ticks as f32 / elapsed_seconds,
            fired_per_sec: self.fired as f32 / elapsed_seconds,
            saved_per_sec: self.saved as f32 / elapsed_seconds,
            late_fires: self.late_fires,
            flush_failures: self.flush_failures,
            hydrated: self.hydrated,
            scheduled_effects: depths.scheduled_effects,
            save_queue_depth: depths.save_queue,
            lazy_queue_depth: depths.lazy_queue,
        };

        *self = Self::starting_at(now, self.interval);
        Some(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::RwLock;
    use std::thread;

    use super::*;
    use crate::clock::GameTime;
    use crate::save::IdRegistered;
    use crate::save::DbId;
    use crate::schedule::CheckReport;

    fn poison_lock(lock: &RwLock<HeartbeatMetricsSnapshot>) {
        thread::scope(|scope| {
            let _ = scope
                .spawn(|| {
                    let _guard = lock.write().expect("write guard");
                    panic!("poison metrics lock");
                })
                .join();
        });
    }

    fn tick(fired: usize, late: usize) -> TickReport {
        TickReport {
            now: GameTime::ZERO,
            schedules: CheckReport {
                fired,
                late,
                max_lateness: Duration::ZERO,
            },
            swept: None,
        }
    }

    #[test]
    fn snapshot_computes_rates_over_interval() {
        let base = Instant::now();
        let mut accumulator = MetricsAccumulator::starting_at(base, Duration::from_secs(2));

        accumulator.record_tick(&tick(3, 1));
        accumulator.record_tick(&tick(1, 0));
        accumulator.record_flush(&FlushReport {
            registered: vec![IdRegistered {
                key: EntityKey(1),
                id: DbId(1),
            }],
            saved: 5,
            ..FlushReport::default()
        });

        let snapshot = accumulator
            .maybe_snapshot(
                base + Duration::from_secs(2),
                QueueDepths {
                    scheduled_effects: 7,
                    save_queue: 2,
                    lazy_queue: 0,
                },
            )
            .expect("snapshot should be emitted");

        assert!((snapshot.tps - 1.0).abs() < 0.01);
        assert!((snapshot.fired_per_sec - 2.0).abs() < 0.01);
        assert!((snapshot.saved_per_sec - 3.0).abs() < 0.01);
        assert_eq!(snapshot.late_fires, 1);
        assert_eq!(snapshot.scheduled_effects, 7);
        assert_eq!(snapshot.save_queue_depth, 2);
    }

    #[test]
    fn snapshot_not_emitted_before_interval() {
        let base = Instant::now();
        let mut accumulator = MetricsAccumulator::starting_at(base, Duration::from_secs(1));
        accumulator.record_tick(&tick(0, 0));

        assert!(accumulator
            .maybe_snapshot(base + Duration::from_millis(500), QueueDepths::default())
            .is_none());
    }

    #[test]
    fn counters_reset_after_snapshot() {
        let base = Instant::now();
        let mut accumulator = MetricsAccumulator::starting_at(base, Duration::from_secs(1));
        accumulator.record_flush_failure();
        accumulator
            .maybe_snapshot(base + Duration::from_secs(1), QueueDepths::default())
            .expect("first snapshot");

        let second = accumulator
            .maybe_snapshot(base + Duration::from_secs(2), QueueDepths::default())
            .expect("second snapshot");
        assert_eq!(second.flush_failures, 0);
    }

    #[test]
    fn snapshot_recovers_after_poison_without_panic() {
        let handle = MetricsHandle::default();
        poison_lock(handle.snapshot.as_ref());

        assert_eq!(handle.snapshot(), HeartbeatMetricsSnapshot::default());
    }

    #[test]
    fn publish_recovers_after_poison_without_panic() {
        let handle = MetricsHandle::default();
        poison_lock(handle.snapshot.as_ref());

        let expected = HeartbeatMetricsSnapshot {
            tps: 10.0,
            save_queue_depth: 4,
            ..HeartbeatMetricsSnapshot::default()
        };
        handle.publish(expected);

        assert_eq!(handle.snapshot(), expected);
    }
}
