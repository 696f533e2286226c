use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub mod clock;
pub mod config;
pub mod effects;
pub mod heartbeat;
pub mod save;
pub mod schedule;
pub mod world;

pub use clock::{Clock, GameTime, ManualClock, SystemClock};
pub use config::{EngineConfig, HeartbeatConfig};
pub use effects::{
    DefinitionError, DefinitionWriter, DurationChange, Effect, EffectCommand, EffectContext,
    EffectCore, EffectDefinition, EffectError, EffectHandler, EffectId, EffectLoader,
    EffectRegistry, LoadContext, PerceptionTypes, RegistryError,
};
pub use heartbeat::{run_heartbeat, HeartbeatMetricsSnapshot, HeartbeatSummary, MetricsHandle};
pub use save::{
    DbId, FileStorage, FlushReport, InitialisationPhase, LazyLoadPriority, MemoryStorage,
    SaveConfig, SaveError, SaveManager, SaveTarget, Storage, StorageError, StoredEffect,
    StoredRecord, TransactionScope,
};
pub use schedule::{CheckReport, EffectScheduler, ScheduleEntry, ScheduleError};
pub use world::{
    Entity, EntityKey, EntityKind, EntityMut, EntityState, LoadReport, TickReport, World,
    WorldError,
};

pub const ROOT_ENV_VAR: &str = "MUD_ROOT";

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub root: PathBuf,
    pub data_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to read environment variable {var}: {source}")]
    EnvVar {
        var: &'static str,
        #[source]
        source: env::VarError,
    },
    #[error("failed to resolve current executable path: {0}")]
    CurrentExe(#[source] std::io::Error),
    #[error("current executable path has no parent directory: {0}")]
    ExeHasNoParent(PathBuf),
    #[error("failed to create data directory at {path}: {source}")]
    CreateDataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "MUD_ROOT is set but does not point to a valid server root: {path}\n\
A valid root must contain Cargo.toml and either crates/ or data/."
    )]
    InvalidEnvRoot { path: PathBuf },
    #[error(
        "Could not detect server root by walking upward from executable directory: {start_dir}\n\
Expected a directory containing Cargo.toml and either crates/ or data/.\n\
Set {env_var} explicitly, for example:\n\
export {env_var}=\"/path/to/mud\""
    )]
    RootNotFound {
        start_dir: PathBuf,
        env_var: &'static str,
    },
}

pub fn resolve_app_paths() -> Result<AppPaths, StartupError> {
    let root = resolve_root()?;
    let data_dir = root.join("data");

    fs::create_dir_all(&data_dir).map_err(|source| StartupError::CreateDataDir {
        path: data_dir.clone(),
        source,
    })?;

    Ok(AppPaths { root, data_dir })
}

fn resolve_root() -> Result<PathBuf, StartupError> {
    match env::var(ROOT_ENV_VAR) {
        Ok(value) => {
            let normalized = normalize_path(&PathBuf::from(value));
            if is_repo_marker(&normalized) {
                Ok(normalized)
            } else {
                Err(StartupError::InvalidEnvRoot { path: normalized })
            }
        }
        Err(env::VarError::NotPresent) => {
            let exe = env::current_exe().map_err(StartupError::CurrentExe)?;
            let exe_dir = exe
                .parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| StartupError::ExeHasNoParent(exe.clone()))?;

            exe_dir
                .ancestors()
                .find(|candidate| is_repo_marker(candidate))
                .map(normalize_path)
                .ok_or_else(|| StartupError::RootNotFound {
                    start_dir: normalize_path(&exe_dir),
                    env_var: ROOT_ENV_VAR,
                })
        }
        Err(source) => Err(StartupError::EnvVar {
            var: ROOT_ENV_VAR,
            source,
        }),
    }
}

fn is_repo_marker(path: &Path) -> bool {
    let cargo_toml = path.join("Cargo.toml").is_file();
    let has_crates = path.join("crates").is_dir();
    let has_data = path.join("data").is_dir();

    cargo_toml && (has_crates || has_data)
}

fn normalize_path(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
