use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{Clock, GameTime};
use crate::config::EngineConfig;
use crate::effects::{
    DurationChange, Effect, EffectCommand, EffectContext, EffectCore, EffectError, EffectHandler,
    EffectId, EffectIdAllocator, EffectRegistry, PerceptionTypes,
};
use crate::save::{DbId, FlushReport, SaveError, SaveManager, Storage, StorageError};
use crate::schedule::{CheckReport, EffectScheduler};

use super::entity::{Entity, EntityKey, EntityKeyAllocator, EntityKind, EntityState};
use super::store::{EntityStore, Hooks, SaveView};

#[derive(Debug, Error)]
pub enum WorldError {
    #[error("entity {key} does not exist")]
    UnknownEntity { key: EntityKey },
    #[error("entity {key} still has no durable id after flushing")]
    IdentityUnavailable { key: EntityKey },
    #[error("world already holds {entities} entities; load into an empty world")]
    AlreadyPopulated { entities: usize },
    #[error(transparent)]
    Effect(#[from] EffectError),
    #[error(transparent)]
    Save(#[from] SaveError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub now: GameTime,
    pub schedules: CheckReport,
    /// Owners re-flagged by the duration sweep, when it ran this tick.
    pub swept: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub entities: usize,
    pub awaiting_hydration: usize,
    pub orphaned: usize,
}

/// Mutable access to one entity's state. Every change marks it for saving.
pub struct EntityMut<'a> {
    state: &'a mut EntityState,
    saves: &'a mut SaveManager<EntityKey>,
}

impl EntityMut<'_> {
    pub fn state(&self) -> &EntityState {
        self.state
    }

    pub fn set_attribute(&mut self, name: &str, value: i64) {
        self.state.set_attribute(name, value);
        self.mark_changed();
    }

    pub fn adjust_attribute(&mut self, name: &str, delta: i64) -> i64 {
        let value = self.state.attribute(name).saturating_add(delta);
        self.set_attribute(name, value);
        value
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.state.set_name(name);
        self.mark_changed();
    }

    pub fn mark_changed(&mut self) -> bool {
        let flagged = self.state.set_changed();
        if flagged {
            self.saves.add(self.state.key());
        }
        flagged
    }
}

/// Owns every entity together with the scheduler, save queue and storage
/// they share. All effect operations go through here so hooks always see a
/// consistent context.
pub struct World {
    config: EngineConfig,
    clock: Box<dyn Clock>,
    storage: Box<dyn Storage>,
    registry: EffectRegistry,
    scheduler: EffectScheduler,
    saves: SaveManager<EntityKey>,
    store: EntityStore,
    entity_keys: EntityKeyAllocator,
    effect_ids: EffectIdAllocator,
    follow_ups: Vec<EffectCommand>,
    last_duration_sweep: GameTime,
}

impl World {
    pub fn new(
        config: EngineConfig,
        clock: Box<dyn Clock>,
        storage: Box<dyn Storage>,
        registry: EffectRegistry,
    ) -> Self {
        let scheduler = EffectScheduler::new(config.late_fire_warning);
        let saves = SaveManager::new(config.save_config());
        let last_duration_sweep = clock.now();
        Self {
            config,
            clock,
            storage,
            registry,
            scheduler,
            saves,
            store: EntityStore::default(),
            entity_keys: EntityKeyAllocator::default(),
            effect_ids: EffectIdAllocator::default(),
            follow_ups: Vec::new(),
            last_duration_sweep,
        }
    }

    pub fn now(&self) -> GameTime {
        self.clock.now()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &EffectScheduler {
        &self.scheduler
    }

    pub fn save_manager(&self) -> &SaveManager<EntityKey> {
        &self.saves
    }

    pub fn registry(&self) -> &EffectRegistry {
        &self.registry
    }

    pub fn entity_count(&self) -> usize {
        self.store.len()
    }

    pub fn entity(&self, key: EntityKey) -> Option<&Entity> {
        self.store.get(key)
    }

    pub fn entity_mut(&mut self, key: EntityKey) -> Option<EntityMut<'_>> {
        let entity = self.store.get_mut(key)?;
        Some(EntityMut {
            state: &mut entity.state,
            saves: &mut self.saves,
        })
    }

    pub fn find_by_db_id(&self, id: DbId) -> Option<EntityKey> {
        self.store.resolve_db(id)
    }

    pub fn allocate_effect_id(&mut self) -> EffectId {
        self.effect_ids.allocate()
    }

    /// Creates an entity with no durable id. It is inserted into storage on
    /// the next flush, in the phase its kind calls for.
    pub fn create_entity(
        &mut self,
        kind: EntityKind,
        name: impl Into<String>,
        parent: Option<EntityKey>,
    ) -> Result<EntityKey, WorldError> {
        if let Some(parent) = parent {
            if !self.store.contains(parent) {
                return Err(WorldError::UnknownEntity { key: parent });
            }
        }
        let key = self.entity_keys.allocate();
        let mut state = EntityState::new(key, kind, name);
        state.set_parent(parent);
        self.store.insert(Entity::new(state));
        self.saves
            .add_initialisation(key, kind.initialisation_phase());
        debug!(entity = %key, kind = ?kind, "entity_created");
        Ok(key)
    }

    pub fn set_attribute(&mut self, key: EntityKey, name: &str, value: i64) -> Result<(), WorldError> {
        let mut entity = self
            .entity_mut(key)
            .ok_or(WorldError::UnknownEntity { key })?;
        entity.set_attribute(name, value);
        Ok(())
    }

    pub fn set_parent(&mut self, key: EntityKey, parent: Option<EntityKey>) -> Result<(), WorldError> {
        if let Some(parent) = parent {
            if !self.store.contains(parent) {
                return Err(WorldError::UnknownEntity { key: parent });
            }
        }
        let entity = self
            .store
            .get_mut(key)
            .ok_or(WorldError::UnknownEntity { key })?;
        entity.state.set_parent(parent);
        self.mark_dirty(key);
        Ok(())
    }

    /// Returns `true` when this call moved the entity from clean to changed.
    pub fn mark_changed(&mut self, key: EntityKey) -> Result<bool, WorldError> {
        if !self.store.contains(key) {
            return Err(WorldError::UnknownEntity { key });
        }
        Ok(self.mark_dirty(key))
    }

    pub fn add_effect(
        &mut self,
        effect: Box<dyn Effect>,
        duration: Option<Duration>,
    ) -> Result<EffectId, WorldError> {
        let owner = effect.owner();
        let added = self.with_owner(owner, |handler, cx| handler.add_effect(effect, duration, cx))?;
        Ok(added?)
    }

    /// Allocates an id, builds the effect for `owner` and adds it.
    pub fn add_effect_for<E: Effect>(
        &mut self,
        owner: EntityKey,
        duration: Option<Duration>,
        build: impl FnOnce(EffectCore) -> E,
    ) -> Result<EffectId, WorldError> {
        if !self.store.contains(owner) {
            return Err(WorldError::UnknownEntity { key: owner });
        }
        let core = EffectCore::new(self.allocate_effect_id(), owner);
        self.add_effect(Box::new(build(core)), duration)
    }

    pub fn remove_effect(
        &mut self,
        owner: EntityKey,
        effect: EffectId,
        fire_removal_action: bool,
    ) -> Result<bool, WorldError> {
        self.with_owner(owner, |handler, cx| {
            handler
                .remove_effect(effect, fire_removal_action, cx)
                .is_some()
        })
    }

    pub fn remove_all_effects(
        &mut self,
        owner: EntityKey,
        predicate: impl Fn(&dyn Effect) -> bool,
        fire_removal_action: bool,
    ) -> Result<usize, WorldError> {
        self.with_owner(owner, |handler, cx| {
            handler
                .remove_all_effects(predicate, fire_removal_action, cx)
                .len()
        })
    }

    pub fn reschedule(
        &mut self,
        owner: EntityKey,
        effect: EffectId,
        new_duration: Duration,
    ) -> Result<Option<GameTime>, WorldError> {
        self.with_owner(owner, |handler, cx| handler.reschedule(effect, new_duration, cx))
    }

    pub fn reschedule_if_longer(
        &mut self,
        owner: EntityKey,
        effect: EffectId,
        new_duration: Duration,
    ) -> Result<Option<GameTime>, WorldError> {
        self.with_owner(owner, |handler, cx| {
            handler.reschedule_if_longer(effect, new_duration, cx)
        })
    }

    pub fn add_duration(
        &mut self,
        owner: EntityKey,
        effect: EffectId,
        extension: Duration,
    ) -> Result<DurationChange, WorldError> {
        self.with_owner(owner, |handler, cx| handler.add_duration(effect, extension, cx))
    }

    pub fn remove_duration(
        &mut self,
        owner: EntityKey,
        effect: EffectId,
        reduction: Duration,
    ) -> Result<DurationChange, WorldError> {
        self.with_owner(owner, |handler, cx| handler.remove_duration(effect, reduction, cx))
    }

    pub fn remaining_duration(&self, effect: EffectId) -> Duration {
        self.scheduler.remaining_duration(effect, self.now())
    }

    pub fn get_perception(&self, key: EntityKey, base: PerceptionTypes) -> Option<PerceptionTypes> {
        self.store
            .get(key)
            .map(|entity| entity.effects.get_perception(base))
    }

    pub fn hidden_from_perception(
        &self,
        target: EntityKey,
        perceiver: EntityKey,
        types: PerceptionTypes,
    ) -> bool {
        self.store
            .get(target)
            .is_some_and(|entity| entity.effects.hidden_from_perception(perceiver, types))
    }

    /// The entity's durable id. An entity still waiting for its first insert
    /// forces a flush so the caller never sees a placeholder.
    pub fn db_id(&mut self, key: EntityKey) -> Result<DbId, WorldError> {
        let entity = self.store.get(key).ok_or(WorldError::UnknownEntity { key })?;
        if let Some(id) = entity.state.db_id() {
            return Ok(id);
        }
        if self.saves.is_pending_initialisation(key) {
            debug!(entity = %key, "identity_forced_flush");
            self.flush()?;
        }
        self.store
            .db_id_of(key)
            .ok_or(WorldError::IdentityUnavailable { key })
    }

    /// Removes an entity for good: its effects are purged (optionally running
    /// removal hooks), its schedules cancelled and its queued saves aborted.
    /// Children are detached. The durable delete is attempted at once; if it
    /// fails it stays queued and is retried by every later flush.
    pub fn destroy_entity(
        &mut self,
        key: EntityKey,
        fire_removal_actions: bool,
    ) -> Result<(), WorldError> {
        if !self.store.contains(key) {
            return Err(WorldError::UnknownEntity { key });
        }
        let purged = self.with_owner(key, |handler, cx| {
            handler
                .remove_all_effects(|_| true, fire_removal_actions, cx)
                .len()
        })?;
        // follow-ups may have attached something new before we got here
        let cancelled = self.scheduler.destroy(key).len();
        self.saves.abort(key);

        let Some(entity) = self.store.remove(key) else {
            return Err(WorldError::UnknownEntity { key });
        };
        self.queue_newly_changed();
        for child in self.store.children_of(key) {
            if let Some(child_entity) = self.store.get_mut(child) {
                child_entity.state.set_parent(None);
            }
            self.mark_dirty(child);
        }

        if let Some(id) = entity.state.db_id() {
            self.saves.add_delete(id);
            if let Err(source) = self.saves.flush_deletes(self.storage.as_mut()) {
                warn!(
                    entity = %key,
                    db_id = %id,
                    pending_deletes = self.saves.pending_delete_len(),
                    error = %source,
                    "entity_delete_deferred"
                );
            }
        }
        info!(
            entity = %key,
            purged,
            cancelled,
            "entity_destroyed"
        );
        Ok(())
    }

    /// Fires every due schedule. Follow-ups requested by expiry hooks are
    /// applied before the next due entry fires.
    pub fn check_schedules(&mut self) -> CheckReport {
        let now = self.clock.now();
        let mut hooks = Hooks {
            now,
            store: &mut self.store,
            saves: &mut self.saves,
            follow_ups: &mut self.follow_ups,
            registry: &self.registry,
            effect_ids: &mut self.effect_ids,
        };
        self.scheduler
            .check_schedules(now, &mut hooks, |scheduler, hooks, entry| {
                let expired = hooks.with_owner(scheduler, entry.owner(), |handler, cx| {
                    handler.expire_effect(entry.effect(), cx).is_some()
                });
                if expired != Some(true) {
                    debug!(
                        effect = %entry.effect(),
                        owner = %entry.owner(),
                        "stale_schedule_ignored"
                    );
                }
                hooks.drain_follow_ups(scheduler);
            })
    }

    pub fn flush(&mut self) -> Result<FlushReport<EntityKey>, WorldError> {
        let now = self.clock.now();
        let mut view = SaveView::new(&mut self.store, &self.scheduler, now);
        let report = self.saves.flush(&mut view, self.storage.as_mut())?;
        for registered in &report.registered {
            debug!(entity = %registered.key, db_id = %registered.id, "id_registered");
        }
        Ok(report)
    }

    /// Hydrates loaded entities in priority order within `budget`.
    pub fn flush_lazy_load(&mut self, budget: Duration) -> usize {
        let now = self.clock.now();
        let store = &mut self.store;
        let registry = &self.registry;
        let effect_ids = &mut self.effect_ids;
        let scheduler = &mut self.scheduler;
        let mut stale = Vec::new();
        let loaded = self.saves.flush_lazy_load(budget, |key| {
            if store.hydrate(key, registry, effect_ids, scheduler, now) {
                stale.push(key);
            }
        });
        for key in stale {
            self.mark_dirty(key);
        }
        loaded
    }

    /// Re-flags owners of scheduled saving effects so their remaining
    /// durations are written on the next flush.
    pub fn save_effect_durations(&mut self) -> usize {
        let mut flagged = 0;
        for owner in self.scheduler.saving_owners() {
            if self.mark_dirty(owner) {
                flagged += 1;
            }
        }
        debug!(flagged, "effect_durations_swept");
        flagged
    }

    /// One heartbeat of simulation: fire due schedules, then run the duration
    /// sweep when its interval has passed. Flushing is left to the caller.
    pub fn tick(&mut self) -> TickReport {
        let now = self.clock.now();
        let schedules = self.check_schedules();
        let swept = if now.saturating_duration_since(self.last_duration_sweep)
            >= self.config.effect_duration_sweep_interval
        {
            self.last_duration_sweep = now;
            Some(self.save_effect_durations())
        } else {
            None
        };
        TickReport {
            now,
            schedules,
            swept,
        }
    }

    /// Rebuilds entities from storage. Stored effects are attached lazily,
    /// highest priority first; see [`World::flush_lazy_load`].
    pub fn load(&mut self) -> Result<LoadReport, WorldError> {
        if self.store.len() > 0 {
            return Err(WorldError::AlreadyPopulated {
                entities: self.store.len(),
            });
        }
        let records = self.storage.load_all()?;
        let mut report = LoadReport::default();
        let mut parents = Vec::new();

        self.saves.begin_bulk_load();
        for record in records {
            let key = self.entity_keys.allocate();
            let mut state = EntityState::new(key, record.kind, record.name);
            state.replace_attributes(record.attributes);
            state.set_db_id(record.id);
            let mut entity = Entity::new(state);
            if !record.effects.is_empty() {
                entity.pending_effects = record.effects;
                self.saves
                    .add_lazy_load(key, record.kind.lazy_load_priority());
                report.awaiting_hydration += 1;
            }
            self.store.insert(entity);
            if let Some(parent) = record.parent {
                parents.push((key, parent));
            }
            report.entities += 1;
        }
        self.saves.end_bulk_load();

        for (key, parent_id) in parents {
            match self.store.resolve_db(parent_id) {
                Some(parent) => {
                    if let Some(entity) = self.store.get_mut(key) {
                        entity.state.set_parent(Some(parent));
                    }
                }
                None => {
                    warn!(entity = %key, parent = %parent_id, "stored_parent_missing");
                    report.orphaned += 1;
                    self.mark_dirty(key);
                }
            }
        }

        info!(
            entities = report.entities,
            awaiting_hydration = report.awaiting_hydration,
            orphaned = report.orphaned,
            "world_loaded"
        );
        Ok(report)
    }

    pub fn describe(&self, key: EntityKey) -> String {
        self.store.describe(key)
    }

    pub fn debug_dump(&self) -> String {
        format!(
            "entities={} save_queue={} initialisation_queue={} lazy_queue={}\n{}",
            self.store.len(),
            self.saves.queued_len(),
            self.saves.initialisation_len(),
            self.saves.lazy_load_len(),
            self.scheduler.debug_dump(self.now())
        )
    }

    /// Queues entities the store re-flagged on its own, such as waiters
    /// released by a destroyed reference target.
    fn queue_newly_changed(&mut self) {
        for key in self.store.take_newly_changed() {
            self.saves.add(key);
        }
    }

    fn mark_dirty(&mut self, key: EntityKey) -> bool {
        let Some(entity) = self.store.get_mut(key) else {
            return false;
        };
        let flagged = entity.state.set_changed();
        if flagged {
            self.saves.add(key);
        }
        flagged
    }

    fn with_owner<R>(
        &mut self,
        key: EntityKey,
        f: impl FnOnce(&mut EffectHandler, &mut EffectContext<'_>) -> R,
    ) -> Result<R, WorldError> {
        let now = self.clock.now();
        let mut hooks = Hooks {
            now,
            store: &mut self.store,
            saves: &mut self.saves,
            follow_ups: &mut self.follow_ups,
            registry: &self.registry,
            effect_ids: &mut self.effect_ids,
        };
        let result = hooks.with_owner(&mut self.scheduler, key, f);
        hooks.drain_follow_ups(&mut self.scheduler);
        result.ok_or(WorldError::UnknownEntity { key })
    }
}
