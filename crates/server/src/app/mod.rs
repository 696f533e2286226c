mod bootstrap;
mod loop_runner;

use mud_engine::{RegistryError, StartupError, StorageError, WorldError};
use thiserror::Error;

use crate::content::SeedError;

pub(crate) use bootstrap::build_app;
pub(crate) use loop_runner::run;

#[derive(Debug, Error)]
pub(crate) enum AppError {
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error("failed to open storage: {0}")]
    Storage(#[from] StorageError),
    #[error("failed to register effect types: {0}")]
    Registry(#[from] RegistryError),
    #[error("failed to load world: {0}")]
    World(#[from] WorldError),
    #[error("failed to seed world: {0}")]
    Seed(#[from] SeedError),
}
