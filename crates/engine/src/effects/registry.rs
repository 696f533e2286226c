use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::save::DbId;
use crate::world::EntityKey;

use super::definition::{DefinitionError, EffectDefinition};
use super::effect::{Effect, EffectId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no loader registered for effect type '{specific_type}'")]
    UnknownType { specific_type: String },
    #[error("effect type '{specific_type}' is already registered")]
    DuplicateRegistration { specific_type: &'static str },
    #[error(transparent)]
    Definition(#[from] DefinitionError),
}

/// Information a loader needs to rebuild an effect for a particular owner.
pub struct LoadContext<'a> {
    pub id: EffectId,
    pub owner: EntityKey,
    resolve: &'a dyn Fn(DbId) -> Option<EntityKey>,
}

impl<'a> LoadContext<'a> {
    pub fn new(
        id: EffectId,
        owner: EntityKey,
        resolve: &'a dyn Fn(DbId) -> Option<EntityKey>,
    ) -> Self {
        Self { id, owner, resolve }
    }

    /// Looks up a referenced entity by durable id; `None` when it no longer
    /// exists.
    pub fn entity(&self, id: DbId) -> Option<EntityKey> {
        (self.resolve)(id)
    }
}

/// `Ok(None)` means the definition is valid but refers to something that no
/// longer exists, so the effect should be skipped.
pub type EffectLoader =
    fn(&EffectDefinition, &LoadContext<'_>) -> Result<Option<Box<dyn Effect>>, DefinitionError>;

/// Type tag to loader table, filled once at startup.
#[derive(Default, Clone)]
pub struct EffectRegistry {
    loaders: HashMap<&'static str, EffectLoader>,
}

impl fmt::Debug for EffectRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}

impl EffectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        specific_type: &'static str,
        loader: EffectLoader,
    ) -> Result<(), RegistryError> {
        if self.loaders.contains_key(specific_type) {
            return Err(RegistryError::DuplicateRegistration { specific_type });
        }
        self.loaders.insert(specific_type, loader);
        Ok(())
    }

    pub fn contains(&self, specific_type: &str) -> bool {
        self.loaders.contains_key(specific_type)
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        let mut types = self.loaders.keys().copied().collect::<Vec<_>>();
        types.sort_unstable();
        types
    }

    pub fn load_effect(
        &self,
        raw_definition: &str,
        ctx: &LoadContext<'_>,
    ) -> Result<Option<Box<dyn Effect>>, RegistryError> {
        let definition = EffectDefinition::parse(raw_definition)?;
        self.load_definition(&definition, ctx)
    }

    pub fn load_definition(
        &self,
        definition: &EffectDefinition,
        ctx: &LoadContext<'_>,
    ) -> Result<Option<Box<dyn Effect>>, RegistryError> {
        let loader = self
            .loaders
            .get(definition.specific_type())
            .ok_or_else(|| RegistryError::UnknownType {
                specific_type: definition.specific_type().to_string(),
            })?;
        Ok(loader(definition, ctx)?)
    }
}
