use mud_engine::{
    resolve_app_paths, EngineConfig, FileStorage, HeartbeatConfig, SystemClock, World,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use super::AppError;
use crate::content;

pub(crate) struct AppWiring {
    pub(crate) world: World,
    pub(crate) heartbeat: HeartbeatConfig,
}

pub(crate) fn build_app() -> Result<AppWiring, AppError> {
    init_tracing();
    info!("=== MUD Server Startup ===");

    let paths = resolve_app_paths()?;
    let engine_config = EngineConfig::default().with_env_overrides();
    let heartbeat = HeartbeatConfig::default().with_env_overrides();
    let storage = FileStorage::open(paths.data_dir.clone())?;
    let registry = content::build_registry()?;
    info!(
        root = %paths.root.display(),
        data_dir = %paths.data_dir.display(),
        effect_types = registry.len(),
        save_batch_size = engine_config.save_batch_size,
        "startup_paths"
    );

    let mut world = World::new(
        engine_config,
        Box::new(SystemClock::new()),
        Box::new(storage),
        registry,
    );
    let loaded = world.load()?;
    if loaded.entities == 0 {
        info!("storage_empty_seeding_world");
        let seed = content::parse_seed(content::DEFAULT_SEED)?;
        content::seed_world(&mut world, &seed)?;
    }

    Ok(AppWiring { world, heartbeat })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .init();
}
