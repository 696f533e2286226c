use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::effects::EffectHandler;
use crate::save::{DbId, InitialisationPhase, LazyLoadPriority, StoredEffect};

/// In-memory handle for a live entity. Never persisted; see [`DbId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityKey(pub u64);

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct EntityKeyAllocator {
    next: u64,
}

impl EntityKeyAllocator {
    pub fn allocate(&mut self) -> EntityKey {
        self.next = self.next.saturating_add(1);
        EntityKey(self.next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Room,
    Character,
    Item,
}

impl EntityKind {
    /// Rooms hold characters and items, characters hold items.
    pub fn initialisation_phase(self) -> InitialisationPhase {
        match self {
            Self::Room => InitialisationPhase::First,
            Self::Character => InitialisationPhase::Second,
            Self::Item => InitialisationPhase::AfterFirstDatabaseHit,
        }
    }

    pub fn lazy_load_priority(self) -> LazyLoadPriority {
        match self {
            Self::Character => LazyLoadPriority::High,
            Self::Room => LazyLoadPriority::Normal,
            Self::Item => LazyLoadPriority::Low,
        }
    }
}

/// The persisted half of an entity. Effect hooks get mutable access to this
/// while the owning [`EffectHandler`] is borrowed separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityState {
    key: EntityKey,
    db_id: Option<DbId>,
    kind: EntityKind,
    name: String,
    attributes: BTreeMap<String, i64>,
    parent: Option<EntityKey>,
    changed: bool,
}

impl EntityState {
    pub fn new(key: EntityKey, kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            key,
            db_id: None,
            kind,
            name: name.into(),
            attributes: BTreeMap::new(),
            parent: None,
            changed: false,
        }
    }

    pub fn key(&self) -> EntityKey {
        self.key
    }

    pub fn db_id(&self) -> Option<DbId> {
        self.db_id
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Missing attributes read as zero.
    pub fn attribute(&self, name: &str) -> i64 {
        self.attributes.get(name).copied().unwrap_or(0)
    }

    pub fn attributes(&self) -> &BTreeMap<String, i64> {
        &self.attributes
    }

    pub fn set_attribute(&mut self, name: &str, value: i64) {
        self.attributes.insert(name.to_string(), value);
    }

    pub fn parent(&self) -> Option<EntityKey> {
        self.parent
    }

    pub fn set_parent(&mut self, parent: Option<EntityKey>) {
        self.parent = parent;
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    /// Returns `true` only on the clean to dirty transition; the caller queues
    /// the save exactly then.
    pub fn set_changed(&mut self) -> bool {
        !std::mem::replace(&mut self.changed, true)
    }

    pub fn clear_changed(&mut self) {
        self.changed = false;
    }

    pub(crate) fn set_db_id(&mut self, id: DbId) {
        self.db_id = Some(id);
    }

    pub(crate) fn replace_attributes(&mut self, attributes: BTreeMap<String, i64>) {
        self.attributes = attributes;
    }
}

#[derive(Debug)]
pub struct Entity {
    pub(crate) state: EntityState,
    pub(crate) effects: EffectHandler,
    /// Stored effects not yet turned back into live ones.
    pub(crate) pending_effects: Vec<StoredEffect>,
    /// Stored effects no loader could read. Written back unchanged so a
    /// missing registration does not destroy saved data.
    pub(crate) unreadable_effects: Vec<StoredEffect>,
}

impl Entity {
    pub(crate) fn new(state: EntityState) -> Self {
        let effects = EffectHandler::new(state.key());
        Self {
            state,
            effects,
            pending_effects: Vec::new(),
            unreadable_effects: Vec::new(),
        }
    }

    pub fn state(&self) -> &EntityState {
        &self.state
    }

    pub fn effects(&self) -> &EffectHandler {
        &self.effects
    }

    pub fn is_hydrated(&self) -> bool {
        self.pending_effects.is_empty()
    }

    pub(crate) fn parts_mut(&mut self) -> (&mut EntityState, &mut EffectHandler) {
        (&mut self.state, &mut self.effects)
    }
}
