//! Effect types this server ships with and the world it starts from.

mod effects;
mod seed;

#[cfg(test)]
mod tests;

use mud_engine::{EffectRegistry, RegistryError};

pub(crate) use seed::{parse_seed, seed_world, SeedError, DEFAULT_SEED};

pub(crate) fn register_effects(registry: &mut EffectRegistry) -> Result<(), RegistryError> {
    registry.register(effects::STAT_MODIFIER, effects::load_stat_modifier)?;
    registry.register(effects::CONCEALED, effects::load_concealed)?;
    registry.register(effects::POISONED, effects::load_poisoned)?;
    registry.register(effects::WEAKENED, effects::load_weakened)?;
    registry.register(effects::TETHERED, effects::load_tethered)?;
    Ok(())
}

pub(crate) fn build_registry() -> Result<EffectRegistry, RegistryError> {
    let mut registry = EffectRegistry::new();
    register_effects(&mut registry)?;
    Ok(registry)
}
