use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::GameTime;
use crate::effects::{
    DefinitionWriter, EffectCommand, EffectContext, EffectHandler, EffectIdAllocator,
    EffectRegistry, LoadContext,
};
use crate::save::{
    DbId, SaveManager, SaveTarget, StorageError, StoredEffect, StoredRecord, TransactionScope,
};
use crate::schedule::EffectScheduler;

use super::entity::{Entity, EntityKey};

/// Follow-up commands can chain into more follow-ups; this bounds a runaway
/// chain.
const MAX_FOLLOW_UP_ROUNDS: usize = 64;

pub(crate) struct RecordDraft {
    pub(crate) record: StoredRecord,
    /// Live entities the record refers to that have no durable id yet.
    pub(crate) missing: Vec<EntityKey>,
}

#[derive(Debug, Default)]
pub(crate) struct EntityStore {
    entities: HashMap<EntityKey, Entity>,
    by_db_id: HashMap<DbId, EntityKey>,
    /// target -> entities whose last save left out a reference to target
    awaiting_identity: HashMap<EntityKey, HashSet<EntityKey>>,
    newly_changed: Vec<EntityKey>,
}

impl EntityStore {
    pub(crate) fn len(&self) -> usize {
        self.entities.len()
    }

    pub(crate) fn contains(&self, key: EntityKey) -> bool {
        self.entities.contains_key(&key)
    }

    pub(crate) fn get(&self, key: EntityKey) -> Option<&Entity> {
        self.entities.get(&key)
    }

    pub(crate) fn get_mut(&mut self, key: EntityKey) -> Option<&mut Entity> {
        self.entities.get_mut(&key)
    }

    pub(crate) fn insert(&mut self, entity: Entity) {
        if let Some(id) = entity.state.db_id() {
            self.by_db_id.insert(id, entity.state.key());
        }
        self.entities.insert(entity.state.key(), entity);
    }

    /// Removes the entity. Anything waiting on its identity is re-flagged so
    /// the next save drops the dangling reference.
    pub(crate) fn remove(&mut self, key: EntityKey) -> Option<Entity> {
        let entity = self.entities.remove(&key)?;
        if let Some(id) = entity.state.db_id() {
            self.by_db_id.remove(&id);
        }
        for waiters in self.awaiting_identity.values_mut() {
            waiters.remove(&key);
        }
        self.reflag_waiters(key);
        Some(entity)
    }

    pub(crate) fn resolve_db(&self, id: DbId) -> Option<EntityKey> {
        self.by_db_id.get(&id).copied()
    }

    pub(crate) fn db_id_of(&self, key: EntityKey) -> Option<DbId> {
        self.entities.get(&key).and_then(|entity| entity.state.db_id())
    }

    pub(crate) fn children_of(&self, parent: EntityKey) -> Vec<EntityKey> {
        let mut children = self
            .entities
            .values()
            .filter(|entity| entity.state.parent() == Some(parent))
            .map(|entity| entity.state.key())
            .collect::<Vec<_>>();
        children.sort_unstable();
        children
    }

    pub(crate) fn assign_db_id(&mut self, key: EntityKey, id: DbId) {
        let Some(entity) = self.entities.get_mut(&key) else {
            return;
        };
        entity.state.set_db_id(id);
        self.by_db_id.insert(id, key);
        self.reflag_waiters(key);
    }

    pub(crate) fn await_identity(&mut self, target: EntityKey, waiter: EntityKey) {
        self.awaiting_identity
            .entry(target)
            .or_default()
            .insert(waiter);
    }

    pub(crate) fn take_newly_changed(&mut self) -> Vec<EntityKey> {
        std::mem::take(&mut self.newly_changed)
    }

    pub(crate) fn describe(&self, key: EntityKey) -> String {
        match self.entities.get(&key) {
            Some(entity) => format!(
                "{:?} '{}' {} db_id={} changed={} effects={} pending_effects={}",
                entity.state.kind(),
                entity.state.name(),
                key,
                entity
                    .state
                    .db_id()
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "none".to_string()),
                entity.state.changed(),
                entity.effects.len(),
                entity.pending_effects.len()
            ),
            None => format!("{key} (destroyed)"),
        }
    }

    fn reflag_waiters(&mut self, target: EntityKey) {
        let Some(waiters) = self.awaiting_identity.remove(&target) else {
            return;
        };
        let mut waiters = waiters.into_iter().collect::<Vec<_>>();
        waiters.sort_unstable();
        for waiter in waiters {
            if let Some(entity) = self.entities.get_mut(&waiter) {
                if entity.state.set_changed() {
                    self.newly_changed.push(waiter);
                }
            }
        }
    }

    /// Snapshot of an entity as a storage record. References to live entities
    /// without a durable id are left out and reported in `missing`;
    /// references to entities that no longer exist are simply dropped.
    pub(crate) fn build_record(
        &self,
        key: EntityKey,
        id: DbId,
        scheduler: &EffectScheduler,
        now: GameTime,
    ) -> Option<RecordDraft> {
        let entity = self.entities.get(&key)?;
        let missing = RefCell::new(Vec::new());
        let resolve = |target: EntityKey| -> Option<DbId> {
            let found = self.entities.get(&target)?;
            let db_id = found.state.db_id();
            if db_id.is_none() {
                missing.borrow_mut().push(target);
            }
            db_id
        };

        let parent = entity.state.parent().and_then(|parent| resolve(parent));
        let mut effects = Vec::new();
        for effect in entity.effects.saving_effects() {
            let mut writer = DefinitionWriter::new(effect.specific_type(), &resolve);
            if !effect.save_definition(&mut writer) {
                debug!(
                    owner = %key,
                    effect = %effect.id(),
                    effect_type = effect.specific_type(),
                    "effect_definition_incomplete"
                );
                continue;
            }
            effects.push(StoredEffect {
                specific_type: effect.specific_type().to_string(),
                definition: writer.finish(),
                remaining_ms: scheduler
                    .entry(effect.id())
                    .map(|entry| entry.remaining(now).as_millis() as u64),
            });
        }
        effects.extend(entity.pending_effects.iter().cloned());
        effects.extend(entity.unreadable_effects.iter().cloned());

        let record = StoredRecord {
            id,
            kind: entity.state.kind(),
            name: entity.state.name().to_string(),
            attributes: entity.state.attributes().clone(),
            parent,
            effects,
        };
        Some(RecordDraft {
            record,
            missing: missing.into_inner(),
        })
    }

    /// Turns an entity's stored effects back into live ones. Returns `true`
    /// when something was dropped and the durable record is now stale.
    pub(crate) fn hydrate(
        &mut self,
        key: EntityKey,
        registry: &EffectRegistry,
        effect_ids: &mut EffectIdAllocator,
        scheduler: &mut EffectScheduler,
        now: GameTime,
    ) -> bool {
        let pending = match self.entities.get_mut(&key) {
            Some(entity) if !entity.pending_effects.is_empty() => {
                std::mem::take(&mut entity.pending_effects)
            }
            _ => return false,
        };

        let mut restored = Vec::with_capacity(pending.len());
        let mut unreadable = Vec::new();
        let mut dropped = 0usize;
        {
            let by_db_id = &self.by_db_id;
            let resolve = |id: DbId| by_db_id.get(&id).copied();
            for stored in pending {
                let ctx = LoadContext::new(effect_ids.allocate(), key, &resolve);
                match registry.load_effect(&stored.definition, &ctx) {
                    Ok(Some(effect)) => {
                        restored.push((effect, stored.remaining_ms.map(Duration::from_millis)))
                    }
                    Ok(None) => {
                        dropped += 1;
                        info!(
                            owner = %key,
                            effect_type = stored.specific_type.as_str(),
                            "stored_effect_reference_missing"
                        );
                    }
                    Err(error) => {
                        warn!(
                            owner = %key,
                            effect_type = stored.specific_type.as_str(),
                            error = %error,
                            "stored_effect_unreadable"
                        );
                        unreadable.push(stored);
                    }
                }
            }
        }

        let Some(entity) = self.entities.get_mut(&key) else {
            return false;
        };
        entity.unreadable_effects.extend(unreadable);
        for (effect, remaining) in restored {
            if let Err(error) = entity.effects.restore_effect(effect, remaining, scheduler, now) {
                dropped += 1;
                warn!(owner = %key, error = %error, "stored_effect_restore_failed");
            }
        }
        debug!(
            owner = %key,
            active = entity.effects.len(),
            dropped,
            "entity_hydrated"
        );
        dropped > 0
    }
}

/// The store as seen by the save manager during a flush.
pub(crate) struct SaveView<'a> {
    store: &'a mut EntityStore,
    scheduler: &'a EffectScheduler,
    now: GameTime,
}

impl<'a> SaveView<'a> {
    pub(crate) fn new(
        store: &'a mut EntityStore,
        scheduler: &'a EffectScheduler,
        now: GameTime,
    ) -> Self {
        Self {
            store,
            scheduler,
            now,
        }
    }
}

impl SaveTarget<EntityKey> for SaveView<'_> {
    fn is_changed(&self, key: EntityKey) -> bool {
        self.store
            .get(key)
            .is_some_and(|entity| entity.state.changed())
    }

    fn save(&mut self, key: EntityKey, tx: &mut TransactionScope<'_>) -> Result<(), StorageError> {
        let Some(id) = self.store.db_id_of(key) else {
            debug!(entity = %key, "save_waiting_on_initialisation");
            return Ok(());
        };
        let Some(draft) = self.store.build_record(key, id, self.scheduler, self.now) else {
            return Ok(());
        };

        if draft.missing.is_empty() {
            tx.write(draft.record)?;
        } else {
            debug!(
                entity = %key,
                waiting_on = draft.missing.len(),
                "save_waiting_on_identity"
            );
            for target in draft.missing {
                self.store.await_identity(target, key);
            }
        }
        if let Some(entity) = self.store.get_mut(key) {
            entity.state.clear_changed();
        }
        Ok(())
    }

    fn restore_changed(&mut self, key: EntityKey) {
        if let Some(entity) = self.store.get_mut(key) {
            entity.state.set_changed();
        }
    }

    fn database_insert(
        &mut self,
        key: EntityKey,
        tx: &mut TransactionScope<'_>,
    ) -> Result<DbId, StorageError> {
        let draft = self
            .store
            .build_record(key, DbId(0), self.scheduler, self.now)
            .ok_or_else(|| StorageError::Backend(format!("entity {key} vanished before insert")))?;
        for target in draft.missing {
            self.store.await_identity(target, key);
        }
        tx.insert(draft.record)
    }

    fn set_id_from_database(&mut self, key: EntityKey, id: DbId) {
        self.store.assign_db_id(key, id);
    }

    fn take_newly_changed(&mut self) -> Vec<EntityKey> {
        self.store.take_newly_changed()
    }

    fn describe(&self, key: EntityKey) -> String {
        self.store.describe(key)
    }
}

/// Borrowed world state a hook runs against, minus the scheduler, which is
/// passed separately so scheduler callbacks can use it too.
pub(crate) struct Hooks<'a> {
    pub(crate) now: GameTime,
    pub(crate) store: &'a mut EntityStore,
    pub(crate) saves: &'a mut SaveManager<EntityKey>,
    pub(crate) follow_ups: &'a mut Vec<EffectCommand>,
    pub(crate) registry: &'a EffectRegistry,
    pub(crate) effect_ids: &'a mut EffectIdAllocator,
}

impl Hooks<'_> {
    pub(crate) fn hydrate(&mut self, scheduler: &mut EffectScheduler, key: EntityKey) {
        if self
            .store
            .hydrate(key, self.registry, self.effect_ids, scheduler, self.now)
        {
            if let Some(entity) = self.store.get_mut(key) {
                if entity.state.set_changed() {
                    self.saves.add(key);
                }
            }
        }
    }

    pub(crate) fn with_owner<R>(
        &mut self,
        scheduler: &mut EffectScheduler,
        key: EntityKey,
        f: impl FnOnce(&mut EffectHandler, &mut EffectContext<'_>) -> R,
    ) -> Option<R> {
        self.hydrate(scheduler, key);
        let entity = self.store.get_mut(key)?;
        let (state, handler) = entity.parts_mut();
        let mut cx = EffectContext::new(
            self.now,
            state,
            scheduler,
            self.saves,
            self.follow_ups,
            self.effect_ids,
        );
        Some(f(handler, &mut cx))
    }

    /// Applies queued follow-ups until none remain.
    pub(crate) fn drain_follow_ups(&mut self, scheduler: &mut EffectScheduler) {
        let mut rounds = 0;
        while !self.follow_ups.is_empty() {
            rounds += 1;
            if rounds > MAX_FOLLOW_UP_ROUNDS {
                warn!(
                    dropped = self.follow_ups.len(),
                    rounds = MAX_FOLLOW_UP_ROUNDS,
                    "follow_up_rounds_exhausted"
                );
                self.follow_ups.clear();
                return;
            }
            let batch = std::mem::take(&mut *self.follow_ups);
            for command in batch {
                self.apply(scheduler, command);
            }
        }
    }

    fn apply(&mut self, scheduler: &mut EffectScheduler, command: EffectCommand) {
        match command {
            EffectCommand::Add {
                target,
                effect,
                duration,
            } => {
                let effect_type = effect.specific_type();
                let outcome = self.with_owner(scheduler, target, |handler, cx| {
                    handler.add_effect(effect, duration, cx)
                });
                match outcome {
                    Some(Ok(id)) => debug!(
                        owner = %target,
                        effect = %id,
                        effect_type,
                        "follow_up_effect_added"
                    ),
                    Some(Err(error)) => warn!(
                        owner = %target,
                        effect_type,
                        error = %error,
                        "follow_up_add_rejected"
                    ),
                    None => warn!(owner = %target, effect_type, "follow_up_target_missing"),
                }
            }
            EffectCommand::Remove {
                target,
                effect,
                fire_removal_action,
            } => {
                let removed = self.with_owner(scheduler, target, |handler, cx| {
                    handler
                        .remove_effect(effect, fire_removal_action, cx)
                        .is_some()
                });
                if removed != Some(true) {
                    debug!(owner = %target, effect = %effect, "follow_up_remove_missed");
                }
            }
        }
    }
}
