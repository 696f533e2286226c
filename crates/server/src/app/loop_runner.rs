use std::io::{self, BufRead};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use mud_engine::{run_heartbeat, MetricsHandle, World, WorldError};
use thiserror::Error;
use tracing::{error, info, warn};

use super::bootstrap::AppWiring;

const SHUTDOWN_COMMANDS: [&str; 2] = ["shutdown", "quit"];
const FINAL_FLUSH_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
enum ShutdownError {
    #[error("final flush failed after {attempts} attempts: {source}")]
    Flush {
        attempts: usize,
        #[source]
        source: WorldError,
    },
    #[error(
        "unsaved work remains: save_queue={save_queue} initialisation_queue={initialisation_queue} pending_deletes={pending_deletes}"
    )]
    Unsaved {
        save_queue: usize,
        initialisation_queue: usize,
        pending_deletes: usize,
    },
}

pub(crate) fn run(app: AppWiring) -> ExitCode {
    let AppWiring {
        mut world,
        heartbeat,
    } = app;
    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_console(Arc::clone(&shutdown));

    let metrics = MetricsHandle::default();
    let summary = run_heartbeat(&mut world, &heartbeat, &shutdown, &metrics);
    let last = metrics.snapshot();
    info!(
        ticks = summary.ticks,
        flush_failures = summary.flush_failures,
        tps = last.tps,
        saved_per_sec = last.saved_per_sec,
        late_fires = last.late_fires,
        "heartbeat_final_metrics"
    );

    match final_flush(&mut world) {
        Ok(saved) => {
            info!(saved, "final_flush_complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "final_flush_failed");
            ExitCode::FAILURE
        }
    }
}

/// Flushes until nothing is left to write. Transient failures are retried a
/// few times; work still queued afterwards is an error.
fn final_flush(world: &mut World) -> Result<usize, ShutdownError> {
    let mut saved = 0;
    let mut attempts = 0;
    while world.save_manager().has_pending_work() && attempts < FINAL_FLUSH_ATTEMPTS {
        attempts += 1;
        match world.flush() {
            Ok(report) => saved += report.saved,
            Err(source) if attempts == FINAL_FLUSH_ATTEMPTS => {
                return Err(ShutdownError::Flush { attempts, source });
            }
            Err(err) => warn!(attempt = attempts, error = %err, "final_flush_retry"),
        }
    }

    let saves = world.save_manager();
    if saves.has_pending_work() {
        return Err(ShutdownError::Unsaved {
            save_queue: saves.queued_len(),
            initialisation_queue: saves.initialisation_len(),
            pending_deletes: saves.pending_delete_len(),
        });
    }
    Ok(saved)
}

fn spawn_console(shutdown: Arc<AtomicBool>) {
    let spawned = thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if is_shutdown_command(&line) {
                    info!(command = line.trim(), "console_shutdown_requested");
                    shutdown.store(true, Ordering::Relaxed);
                    break;
                }
            }
        });
    if let Err(err) = spawned {
        warn!(error = %err, "console_unavailable");
    }
}

fn is_shutdown_command(line: &str) -> bool {
    let command = line.trim();
    SHUTDOWN_COMMANDS
        .iter()
        .any(|candidate| command.eq_ignore_ascii_case(candidate))
}
