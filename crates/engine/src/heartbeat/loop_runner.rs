use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::config::HeartbeatConfig;
use crate::world::World;

use super::metrics::{MetricsAccumulator, QueueDepths};
use super::MetricsHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatSummary {
    pub ticks: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub dropped_backlog: Duration,
}

/// Drives `world` at a fixed tick rate until `shutdown` is set or the
/// configured run time elapses. Every tick fires due schedules; saves flush
/// on their own interval and leftover frame time goes to lazy loading.
///
/// Does not flush on exit; the caller owns the final flush.
pub fn run_heartbeat(
    world: &mut World,
    config: &HeartbeatConfig,
    shutdown: &AtomicBool,
    metrics_handle: &MetricsHandle,
) -> HeartbeatSummary {
    let target_tps = config.target_tps.max(1);
    let fixed_dt = Duration::from_secs_f64(1.0 / target_tps as f64);
    let max_frame_delta =
        normalize_non_zero_duration(config.max_frame_delta, Duration::from_secs(1));
    let max_ticks_per_frame = config.max_ticks_per_frame.max(1);
    let metrics_log_interval =
        normalize_non_zero_duration(config.metrics_log_interval, Duration::from_secs(30));
    let flush_interval = normalize_non_zero_duration(config.flush_interval, Duration::from_secs(1));
    let lazy_load_budget = world.config().lazy_load_budget;

    info!(
        target_tps,
        max_frame_delta_ms = max_frame_delta.as_millis() as u64,
        max_ticks_per_frame,
        metrics_log_interval_ms = metrics_log_interval.as_millis() as u64,
        flush_interval_ms = flush_interval.as_millis() as u64,
        run_for_ms = config.run_for.map(|run_for| run_for.as_millis() as u64),
        "heartbeat_config"
    );

    let started = Instant::now();
    let mut summary = HeartbeatSummary::default();
    let mut accumulator = Duration::ZERO;
    let mut last_frame_instant = started;
    let mut last_flush_instant = started;
    let mut metrics_accumulator = MetricsAccumulator::new(metrics_log_interval);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!(reason = "requested", "shutdown_requested");
            break;
        }
        if config
            .run_for
            .is_some_and(|run_for| started.elapsed() >= run_for)
        {
            info!(reason = "run_time_elapsed", "shutdown_requested");
            break;
        }

        let now = Instant::now();
        let raw_frame_dt = now.saturating_duration_since(last_frame_instant);
        last_frame_instant = now;
        accumulator = accumulator.saturating_add(clamp_frame_delta(raw_frame_dt, max_frame_delta));

        let step_plan = plan_sim_steps(accumulator, fixed_dt, max_ticks_per_frame);
        for _ in 0..step_plan.ticks_to_run {
            let report = world.tick();
            metrics_accumulator.record_tick(&report);
            summary.ticks = summary.ticks.saturating_add(1);
        }
        accumulator = step_plan.remaining_accumulator;

        if step_plan.dropped_backlog > Duration::ZERO {
            summary.dropped_backlog = summary
                .dropped_backlog
                .saturating_add(step_plan.dropped_backlog);
            warn!(
                dropped_backlog_ms = step_plan.dropped_backlog.as_millis() as u64,
                max_ticks_per_frame, "tick_backlog_dropped"
            );
        }

        if now.saturating_duration_since(last_flush_instant) >= flush_interval {
            last_flush_instant = now;
            summary.flushes = summary.flushes.saturating_add(1);
            match world.flush() {
                Ok(report) => metrics_accumulator.record_flush(&report),
                Err(error) => {
                    // unsaved entities stay flagged and requeued; retried next interval
                    summary.flush_failures = summary.flush_failures.saturating_add(1);
                    metrics_accumulator.record_flush_failure();
                    error!(
                        error = %error,
                        save_queue = world.save_manager().queued_len(),
                        initialisation_queue = world.save_manager().initialisation_len(),
                        "flush_failed"
                    );
                }
            }
        }

        if step_plan.dropped_backlog.is_zero() && world.save_manager().lazy_load_len() > 0 {
            let hydrated = world.flush_lazy_load(lazy_load_budget);
            metrics_accumulator.record_hydrated(hydrated);
        }

        let depths = QueueDepths {
            scheduled_effects: world.scheduler().len(),
            save_queue: world.save_manager().queued_len(),
            lazy_queue: world.save_manager().lazy_load_len(),
        };
        if let Some(snapshot) = metrics_accumulator.maybe_snapshot(now, depths) {
            metrics_handle.publish(snapshot);
            info!(
                tps = snapshot.tps,
                fired_per_sec = snapshot.fired_per_sec,
                saved_per_sec = snapshot.saved_per_sec,
                late_fires = snapshot.late_fires,
                flush_failures = snapshot.flush_failures,
                hydrated = snapshot.hydrated,
                scheduled_effects = snapshot.scheduled_effects,
                save_queue = snapshot.save_queue_depth,
                lazy_queue = snapshot.lazy_queue_depth,
                entity_count = world.entity_count(),
                "heartbeat_metrics"
            );
        }

        let frame_work = Instant::now().saturating_duration_since(now);
        let idle = compute_idle_sleep(accumulator, fixed_dt, frame_work);
        if idle > Duration::ZERO {
            thread::sleep(idle);
        }
    }

    info!(
        ticks = summary.ticks,
        flushes = summary.flushes,
        flush_failures = summary.flush_failures,
        "heartbeat_stopped"
    );
    summary
}

#[derive(Debug, Clone, Copy)]
struct StepPlan {
    ticks_to_run: u32,
    remaining_accumulator: Duration,
    dropped_backlog: Duration,
}

fn plan_sim_steps(
    mut accumulator: Duration,
    fixed_dt: Duration,
    max_ticks_per_frame: u32,
) -> StepPlan {
    let mut ticks_to_run = 0u32;

    while accumulator >= fixed_dt && ticks_to_run < max_ticks_per_frame {
        accumulator = accumulator.saturating_sub(fixed_dt);
        ticks_to_run = ticks_to_run.saturating_add(1);
    }

    let dropped_backlog = if accumulator >= fixed_dt {
        std::mem::replace(&mut accumulator, Duration::ZERO)
    } else {
        Duration::ZERO
    };
    StepPlan {
        ticks_to_run,
        remaining_accumulator: accumulator,
        dropped_backlog,
    }
}

fn clamp_frame_delta(frame_dt: Duration, max_frame_delta: Duration) -> Duration {
    frame_dt.min(max_frame_delta)
}

fn normalize_non_zero_duration(value: Duration, fallback: Duration) -> Duration {
    if value.is_zero() {
        fallback
    } else {
        value
    }
}

/// Time left before the next tick is due, minus what this frame already
/// spent.
fn compute_idle_sleep(accumulator: Duration, fixed_dt: Duration, frame_work: Duration) -> Duration {
    fixed_dt
        .saturating_sub(accumulator)
        .saturating_sub(frame_work)
}
