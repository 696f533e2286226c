use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::save::{SaveConfig, DEFAULT_MAX_FLUSH_PASSES, DEFAULT_SAVE_BATCH_SIZE};
use crate::schedule::DEFAULT_LATE_FIRE_WARNING;

pub const TARGET_TPS_ENV_VAR: &str = "MUD_TARGET_TPS";
pub const SAVE_BATCH_SIZE_ENV_VAR: &str = "MUD_SAVE_BATCH_SIZE";
pub const LATE_FIRE_WARNING_ENV_VAR: &str = "MUD_LATE_FIRE_WARNING_MS";
pub const RUN_SECONDS_ENV_VAR: &str = "MUD_RUN_SECONDS";

/// Tuning for the scheduler and save pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub save_batch_size: usize,
    pub max_flush_passes: usize,
    pub late_fire_warning: Duration,
    /// How often owners of scheduled saving effects are re-flagged so their
    /// remaining durations reach storage.
    pub effect_duration_sweep_interval: Duration,
    pub lazy_load_budget: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            save_batch_size: DEFAULT_SAVE_BATCH_SIZE,
            max_flush_passes: DEFAULT_MAX_FLUSH_PASSES,
            late_fire_warning: DEFAULT_LATE_FIRE_WARNING,
            effect_duration_sweep_interval: Duration::from_secs(60),
            lazy_load_budget: Duration::from_millis(50),
        }
    }
}

impl EngineConfig {
    pub fn save_config(&self) -> SaveConfig {
        SaveConfig {
            batch_size: self.save_batch_size,
            max_flush_passes: self.max_flush_passes,
        }
    }

    pub fn with_env_overrides(mut self) -> Self {
        self.save_batch_size = env_override(SAVE_BATCH_SIZE_ENV_VAR, self.save_batch_size);
        self.late_fire_warning = Duration::from_millis(env_override(
            LATE_FIRE_WARNING_ENV_VAR,
            self.late_fire_warning.as_millis() as u64,
        ));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub target_tps: u32,
    pub max_frame_delta: Duration,
    pub max_ticks_per_frame: u32,
    pub metrics_log_interval: Duration,
    pub flush_interval: Duration,
    /// Stop after this long; `None` runs until shutdown is requested.
    pub run_for: Option<Duration>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            target_tps: 10,
            max_frame_delta: Duration::from_secs(1),
            max_ticks_per_frame: 5,
            metrics_log_interval: Duration::from_secs(30),
            flush_interval: Duration::from_secs(1),
            run_for: None,
        }
    }
}

impl HeartbeatConfig {
    pub fn with_env_overrides(mut self) -> Self {
        self.target_tps = env_override(TARGET_TPS_ENV_VAR, self.target_tps);
        let run_seconds = env_override(
            RUN_SECONDS_ENV_VAR,
            self.run_for.map(|run_for| run_for.as_secs()).unwrap_or(0),
        );
        self.run_for = (run_seconds > 0).then(|| Duration::from_secs(run_seconds));
        self
    }
}

fn env_override<T>(var: &'static str, fallback: T) -> T
where
    T: FromStr + Display + Copy,
    T::Err: Display,
{
    parse_override(var, env::var(var), fallback)
}

fn parse_override<T>(var: &'static str, raw: Result<String, env::VarError>, fallback: T) -> T
where
    T: FromStr + Display + Copy,
    T::Err: Display,
{
    match raw {
        Ok(value) => match value.trim().parse::<T>() {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!(
                    env_var = var,
                    value = value.as_str(),
                    error = %error,
                    fallback = %fallback,
                    "invalid env override; falling back to default"
                );
                fallback
            }
        },
        Err(env::VarError::NotPresent) => fallback,
        Err(error) => {
            warn!(
                env_var = var,
                error = %error,
                fallback = %fallback,
                "unable to read env override; falling back to default"
            );
            fallback
        }
    }
}
