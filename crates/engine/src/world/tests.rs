use std::any::Any;
use std::time::Duration;

use super::*;
use crate::clock::ManualClock;
use crate::config::EngineConfig;
use crate::effects::{
    DefinitionError, DefinitionWriter, Effect, EffectContext, EffectCore, EffectDefinition,
    EffectId, EffectRegistry, LoadContext, PerceptionTypes,
};
use crate::save::{MemoryStorage, StoredEffect};

#[derive(Debug)]
struct Boost {
    core: EffectCore,
    amount: i64,
}

impl Effect for Boost {
    fn core(&self) -> &EffectCore {
        &self.core
    }

    fn specific_type(&self) -> &'static str {
        "Boost"
    }

    fn saving_effect(&self) -> bool {
        true
    }

    fn initial_effect(&mut self, cx: &mut EffectContext<'_>) {
        cx.adjust_owner_attribute("strength", self.amount);
    }

    fn removal_effect(&mut self, cx: &mut EffectContext<'_>) {
        cx.adjust_owner_attribute("strength", -self.amount);
    }

    fn save_definition(&self, writer: &mut DefinitionWriter<'_>) -> bool {
        writer.field("Amount", self.amount);
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn load_boost(
    definition: &EffectDefinition,
    ctx: &LoadContext<'_>,
) -> Result<Option<Box<dyn Effect>>, DefinitionError> {
    Ok(Some(Box::new(Boost {
        core: EffectCore::new(ctx.id, ctx.owner),
        amount: definition.parse_field("Amount")?,
    })))
}

#[derive(Debug)]
struct Anchored {
    core: EffectCore,
    anchor: EntityKey,
}

impl Effect for Anchored {
    fn core(&self) -> &EffectCore {
        &self.core
    }

    fn specific_type(&self) -> &'static str {
        "Anchored"
    }

    fn saving_effect(&self) -> bool {
        true
    }

    fn save_definition(&self, writer: &mut DefinitionWriter<'_>) -> bool {
        writer.entity_ref("Anchor", self.anchor)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn load_anchored(
    definition: &EffectDefinition,
    ctx: &LoadContext<'_>,
) -> Result<Option<Box<dyn Effect>>, DefinitionError> {
    let Some(anchor) = ctx.entity(definition.db_id_field("Anchor")?) else {
        return Ok(None);
    };
    Ok(Some(Box::new(Anchored {
        core: EffectCore::new(ctx.id, ctx.owner),
        anchor,
    })))
}

/// Burns out into a timed boost on its owner.
#[derive(Debug)]
struct Fuse {
    core: EffectCore,
    then: Duration,
}

impl Effect for Fuse {
    fn core(&self) -> &EffectCore {
        &self.core
    }

    fn specific_type(&self) -> &'static str {
        "Fuse"
    }

    fn expire_effect(&mut self, cx: &mut EffectContext<'_>) {
        let owner = cx.owner_key();
        let core = cx.new_core(owner);
        cx.queue_add(owner, Box::new(Boost { core, amount: 2 }), Some(self.then));
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct Veil {
    core: EffectCore,
}

impl Effect for Veil {
    fn core(&self) -> &EffectCore {
        &self.core
    }

    fn specific_type(&self) -> &'static str {
        "Veil"
    }

    fn hides(&self) -> PerceptionTypes {
        PerceptionTypes::VISUAL
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn registry() -> EffectRegistry {
    let mut registry = EffectRegistry::new();
    registry.register("Boost", load_boost).expect("boost");
    registry.register("Anchored", load_anchored).expect("anchored");
    registry
}

fn world_over(clock: &ManualClock, storage: &MemoryStorage) -> World {
    World::new(
        EngineConfig::default(),
        Box::new(clock.clone()),
        Box::new(storage.clone()),
        registry(),
    )
}

fn boost(
    world: &mut World,
    owner: EntityKey,
    amount: i64,
    duration: Option<Duration>,
) -> EffectId {
    world
        .add_effect_for(owner, duration, |core| Boost { core, amount })
        .expect("add boost")
}

fn stored_effects(storage: &MemoryStorage, name: &str) -> Vec<StoredEffect> {
    storage.record_named(name).expect("record").effects
}

#[test]
fn timed_effect_counts_down_and_fires_once() {
    let clock = ManualClock::new();
    let storage = MemoryStorage::new();
    let mut world = world_over(&clock, &storage);
    let hero = world
        .create_entity(EntityKind::Character, "hero", None)
        .expect("hero");

    let effect = boost(&mut world, hero, 3, Some(Duration::from_secs(5)));
    assert_eq!(world.entity(hero).expect("hero").state().attribute("strength"), 3);

    clock.advance(Duration::from_secs(3));
    assert_eq!(world.remaining_duration(effect), Duration::from_secs(2));
    assert_eq!(world.check_schedules().fired, 0);

    clock.advance(Duration::from_secs(2));
    assert_eq!(world.check_schedules().fired, 1);
    assert_eq!(world.check_schedules().fired, 0);

    let hero_entity = world.entity(hero).expect("hero");
    assert!(hero_entity.effects().is_empty());
    assert_eq!(hero_entity.state().attribute("strength"), 0);
    assert_eq!(world.remaining_duration(effect), Duration::ZERO);
}

#[test]
fn reschedule_if_longer_only_extends() {
    let clock = ManualClock::new();
    let mut world = world_over(&clock, &MemoryStorage::new());
    let hero = world
        .create_entity(EntityKind::Character, "hero", None)
        .expect("hero");
    let effect = boost(&mut world, hero, 1, Some(Duration::from_secs(5)));

    clock.advance(Duration::from_secs(3));
    world
        .reschedule_if_longer(hero, effect, Duration::from_secs(10))
        .expect("reschedule");
    assert_eq!(world.remaining_duration(effect), Duration::from_secs(10));

    world
        .reschedule_if_longer(hero, effect, Duration::from_secs(4))
        .expect("reschedule");
    assert_eq!(world.remaining_duration(effect), Duration::from_secs(10));
}

#[test]
fn removing_effect_cancels_its_schedule() {
    let clock = ManualClock::new();
    let mut world = world_over(&clock, &MemoryStorage::new());
    let hero = world
        .create_entity(EntityKind::Character, "hero", None)
        .expect("hero");
    let effect = boost(&mut world, hero, 4, Some(Duration::from_secs(5)));

    assert!(world.remove_effect(hero, effect, true).expect("remove"));
    assert!(!world.scheduler().is_scheduled(effect));
    assert_eq!(world.entity(hero).expect("hero").state().attribute("strength"), 0);

    clock.advance(Duration::from_secs(6));
    assert_eq!(world.check_schedules().fired, 0);
}

#[test]
fn initialisation_follows_containment_order() {
    let clock = ManualClock::new();
    let storage = MemoryStorage::new();
    let mut world = world_over(&clock, &storage);
    let room = world
        .create_entity(EntityKind::Room, "hall", None)
        .expect("room");
    let hero = world
        .create_entity(EntityKind::Character, "hero", Some(room))
        .expect("hero");
    let lamp = world
        .create_entity(EntityKind::Item, "lamp", Some(hero))
        .expect("lamp");

    let report = world.flush().expect("flush");

    let order = report
        .registered
        .iter()
        .map(|registered| registered.key)
        .collect::<Vec<_>>();
    assert_eq!(order, vec![room, hero, lamp]);
    assert_eq!(report.transactions, 3);

    let room_id = world.db_id(room).expect("room id");
    let hero_id = world.db_id(hero).expect("hero id");
    assert_eq!(storage.record_named("hero").expect("hero").parent, Some(room_id));
    assert_eq!(storage.record_named("lamp").expect("lamp").parent, Some(hero_id));
}

#[test]
fn db_id_forces_pending_insert() {
    let clock = ManualClock::new();
    let storage = MemoryStorage::new();
    let mut world = world_over(&clock, &storage);
    let room = world
        .create_entity(EntityKind::Room, "hall", None)
        .expect("room");
    assert!(storage.is_empty());

    let id = world.db_id(room).expect("id");

    assert_eq!(storage.len(), 1);
    assert_eq!(world.find_by_db_id(id), Some(room));
    assert_eq!(world.db_id(room).expect("cached"), id);
}

#[test]
fn reference_saved_once_target_has_identity() {
    let clock = ManualClock::new();
    let storage = MemoryStorage::new();
    let mut world = world_over(&clock, &storage);
    let hero = world
        .create_entity(EntityKind::Character, "hero", None)
        .expect("hero");
    let stone = world
        .create_entity(EntityKind::Item, "stone", None)
        .expect("stone");
    world
        .add_effect_for(hero, None, |core| Anchored { core, anchor: stone })
        .expect("anchor");

    storage.poison("stone");
    assert!(world.flush().is_err());
    assert!(stored_effects(&storage, "hero").is_empty());
    assert!(world.entity(hero).expect("hero").state().changed());

    storage.heal("stone");
    world.flush().expect("flush");

    let stone_id = world.db_id(stone).expect("stone id");
    let effects = stored_effects(&storage, "hero");
    assert_eq!(effects.len(), 1);
    let definition = EffectDefinition::parse(&effects[0].definition).expect("definition");
    assert_eq!(definition.db_id_field("Anchor").expect("anchor"), stone_id);
    assert!(!world.entity(hero).expect("hero").state().changed());
}

#[test]
fn references_to_new_entities_resolve_in_same_flush() {
    let clock = ManualClock::new();
    let storage = MemoryStorage::new();
    let mut world = world_over(&clock, &storage);
    let stone = world
        .create_entity(EntityKind::Item, "stone", None)
        .expect("stone");
    let hero = world
        .create_entity(EntityKind::Character, "hero", None)
        .expect("hero");
    world.flush().expect("initial flush");
    world
        .add_effect_for(hero, None, |core| Anchored { core, anchor: stone })
        .expect("anchor");
    let pebble = world
        .create_entity(EntityKind::Item, "pebble", None)
        .expect("pebble");
    world
        .add_effect_for(hero, None, |core| Anchored { core, anchor: pebble })
        .expect("anchor");

    world.flush().expect("flush");

    assert_eq!(stored_effects(&storage, "hero").len(), 2);
    assert!(!world.save_manager().has_pending_work());
}

#[test]
fn destroy_purges_effects_and_deletes_record() {
    let clock = ManualClock::new();
    let storage = MemoryStorage::new();
    let mut world = world_over(&clock, &storage);
    let room = world
        .create_entity(EntityKind::Room, "hall", None)
        .expect("room");
    let hero = world
        .create_entity(EntityKind::Character, "hero", Some(room))
        .expect("hero");
    let effect = boost(&mut world, room, 2, Some(Duration::from_secs(5)));
    world.flush().expect("flush");
    assert_eq!(storage.len(), 2);

    world.destroy_entity(room, true).expect("destroy");

    assert!(world.entity(room).is_none());
    assert!(!world.scheduler().is_scheduled(effect));
    assert!(storage.record_named("hall").is_none());
    assert_eq!(storage.stats().records_deleted, 1);
    assert_eq!(world.entity(hero).expect("hero").state().parent(), None);

    world.flush().expect("flush");
    assert_eq!(storage.record_named("hero").expect("hero").parent, None);

    clock.advance(Duration::from_secs(6));
    assert_eq!(world.check_schedules().fired, 0);
    assert!(matches!(
        world.destroy_entity(room, false),
        Err(WorldError::UnknownEntity { .. })
    ));
}

#[test]
fn load_restores_remaining_durations_lazily() {
    let storage = MemoryStorage::new();
    {
        let clock = ManualClock::new();
        let mut world = world_over(&clock, &storage);
        let hero = world
            .create_entity(EntityKind::Character, "hero", None)
            .expect("hero");
        world.flush().expect("insert");
        boost(&mut world, hero, 3, Some(Duration::from_secs(10)));
        clock.advance(Duration::from_secs(4));
        world.flush().expect("save");
    }
    let effects = stored_effects(&storage, "hero");
    assert_eq!(effects.len(), 1);
    assert_eq!(effects[0].remaining_ms, Some(6_000));

    let clock = ManualClock::new();
    let mut world = world_over(&clock, &storage);
    let report = world.load().expect("load");
    assert_eq!(report.entities, 1);
    assert_eq!(report.awaiting_hydration, 1);

    let hero = world.find_by_db_id(storage.record_named("hero").expect("hero").id)
        .expect("hero loaded");
    assert!(!world.entity(hero).expect("hero").is_hydrated());
    assert_eq!(world.flush_lazy_load(Duration::from_secs(1)), 1);

    let hero_entity = world.entity(hero).expect("hero");
    assert!(hero_entity.is_hydrated());
    assert_eq!(hero_entity.effects().len(), 1);
    assert_eq!(hero_entity.state().attribute("strength"), 3);
    assert!(!hero_entity.state().changed());

    clock.advance(Duration::from_secs(6));
    assert_eq!(world.check_schedules().fired, 1);
    assert_eq!(world.entity(hero).expect("hero").state().attribute("strength"), 0);
}

#[test]
fn touching_unhydrated_entity_hydrates_it_first() {
    let storage = MemoryStorage::new();
    {
        let clock = ManualClock::new();
        let mut world = world_over(&clock, &storage);
        let hero = world
            .create_entity(EntityKind::Character, "hero", None)
            .expect("hero");
        boost(&mut world, hero, 3, None);
        world.flush().expect("flush");
    }

    let clock = ManualClock::new();
    let mut world = world_over(&clock, &storage);
    world.load().expect("load");
    let hero = world.find_by_db_id(storage.record_named("hero").expect("hero").id)
        .expect("hero");

    let removed = world
        .remove_all_effects(hero, |effect| effect.is::<Boost>(), true)
        .expect("remove");

    assert_eq!(removed, 1);
    assert_eq!(world.entity(hero).expect("hero").state().attribute("strength"), 0);
}

#[test]
fn missing_reference_is_dropped_at_load() {
    let storage = MemoryStorage::new();
    {
        let clock = ManualClock::new();
        let mut world = world_over(&clock, &storage);
        let hero = world
            .create_entity(EntityKind::Character, "hero", None)
            .expect("hero");
        let stone = world
            .create_entity(EntityKind::Item, "stone", None)
            .expect("stone");
        world
            .add_effect_for(hero, None, |core| Anchored { core, anchor: stone })
            .expect("anchor");
        world.flush().expect("flush");
        assert_eq!(stored_effects(&storage, "hero").len(), 1);
        world.destroy_entity(stone, false).expect("destroy");
    }

    let clock = ManualClock::new();
    let mut world = world_over(&clock, &storage);
    world.load().expect("load");
    world.flush_lazy_load(Duration::from_secs(1));

    let hero = world.find_by_db_id(storage.record_named("hero").expect("hero").id)
        .expect("hero");
    assert!(world.entity(hero).expect("hero").effects().is_empty());
    assert!(world.entity(hero).expect("hero").state().changed());

    world.flush().expect("flush");
    assert!(stored_effects(&storage, "hero").is_empty());
}

#[test]
fn unreadable_effects_survive_a_save() {
    let storage = MemoryStorage::new();
    {
        let clock = ManualClock::new();
        let mut world = world_over(&clock, &storage);
        let hero = world
            .create_entity(EntityKind::Character, "hero", None)
            .expect("hero");
        boost(&mut world, hero, 1, None);
        world.flush().expect("flush");
    }

    let clock = ManualClock::new();
    let mut world = World::new(
        EngineConfig::default(),
        Box::new(clock.clone()),
        Box::new(storage.clone()),
        EffectRegistry::new(),
    );
    world.load().expect("load");
    world.flush_lazy_load(Duration::from_secs(1));
    let hero = world.find_by_db_id(storage.record_named("hero").expect("hero").id)
        .expect("hero");
    assert!(world.entity(hero).expect("hero").effects().is_empty());

    world.set_attribute(hero, "wisdom", 4).expect("set");
    world.flush().expect("flush");

    let record = storage.record_named("hero").expect("hero");
    assert_eq!(record.attributes.get("wisdom"), Some(&4));
    assert_eq!(record.effects.len(), 1);
    assert_eq!(record.effects[0].specific_type, "Boost");
}

#[test]
fn failed_commit_keeps_changes_for_next_flush() {
    let clock = ManualClock::new();
    let storage = MemoryStorage::new();
    let mut world = world_over(&clock, &storage);
    let hero = world
        .create_entity(EntityKind::Character, "hero", None)
        .expect("hero");
    world.flush().expect("insert");

    world.set_attribute(hero, "strength", 5).expect("set");
    storage.fail_next_commits(1);
    assert!(matches!(world.flush(), Err(WorldError::Save(_))));
    assert_eq!(
        storage.record_named("hero").expect("hero").attributes.get("strength"),
        None
    );
    assert!(world.entity(hero).expect("hero").state().changed());

    world.flush().expect("retry");
    assert_eq!(
        storage.record_named("hero").expect("hero").attributes.get("strength"),
        Some(&5)
    );
}

#[test]
fn expiry_follow_up_applies_before_next_entry() {
    let clock = ManualClock::new();
    let mut world = world_over(&clock, &MemoryStorage::new());
    let hero = world
        .create_entity(EntityKind::Character, "hero", None)
        .expect("hero");
    world
        .add_effect_for(hero, Some(Duration::from_secs(1)), |core| Fuse {
            core,
            then: Duration::from_secs(2),
        })
        .expect("fuse");

    clock.advance(Duration::from_secs(1));
    assert_eq!(world.check_schedules().fired, 1);
    let hero_entity = world.entity(hero).expect("hero");
    assert!(hero_entity.effects().has_effect_of_type::<Boost>());
    assert!(!hero_entity.effects().has_effect_of_type::<Fuse>());
    assert_eq!(hero_entity.state().attribute("strength"), 2);

    clock.advance(Duration::from_secs(2));
    assert_eq!(world.check_schedules().fired, 1);
    assert_eq!(world.entity(hero).expect("hero").state().attribute("strength"), 0);
}

#[test]
fn already_due_follow_up_fires_in_same_check() {
    let clock = ManualClock::new();
    let mut world = world_over(&clock, &MemoryStorage::new());
    let hero = world
        .create_entity(EntityKind::Character, "hero", None)
        .expect("hero");
    world
        .add_effect_for(hero, Some(Duration::from_secs(1)), |core| Fuse {
            core,
            then: Duration::ZERO,
        })
        .expect("fuse");

    clock.advance(Duration::from_secs(1));
    let report = world.check_schedules();

    assert_eq!(report.fired, 2);
    let hero_entity = world.entity(hero).expect("hero");
    assert!(hero_entity.effects().is_empty());
    assert_eq!(hero_entity.state().attribute("strength"), 0);
}

#[test]
fn tick_sweeps_durations_on_interval() {
    let clock = ManualClock::new();
    let storage = MemoryStorage::new();
    let mut world = world_over(&clock, &storage);
    let hero = world
        .create_entity(EntityKind::Character, "hero", None)
        .expect("hero");
    boost(&mut world, hero, 1, Some(Duration::from_secs(600)));
    world.flush().expect("flush");
    assert!(!world.entity(hero).expect("hero").state().changed());

    clock.advance(Duration::from_secs(30));
    assert_eq!(world.tick().swept, None);

    clock.advance(Duration::from_secs(30));
    assert_eq!(world.tick().swept, Some(1));
    assert!(world.entity(hero).expect("hero").state().changed());

    world.flush().expect("flush");
    assert_eq!(stored_effects(&storage, "hero")[0].remaining_ms, Some(540_000));
}

#[test]
fn hidden_effects_affect_perception_checks() {
    let clock = ManualClock::new();
    let mut world = world_over(&clock, &MemoryStorage::new());
    let thief = world
        .create_entity(EntityKind::Character, "thief", None)
        .expect("thief");
    let guard = world
        .create_entity(EntityKind::Character, "guard", None)
        .expect("guard");

    assert!(!world.hidden_from_perception(thief, guard, PerceptionTypes::VISUAL));
    world
        .add_effect_for(thief, None, |core| Veil { core })
        .expect("veil");

    assert!(world.hidden_from_perception(thief, guard, PerceptionTypes::VISUAL));
    assert!(!world.hidden_from_perception(thief, guard, PerceptionTypes::AUDIBLE));
}

#[test]
fn operations_on_unknown_entities_fail() {
    let clock = ManualClock::new();
    let mut world = world_over(&clock, &MemoryStorage::new());
    let ghost = EntityKey(99);

    assert!(matches!(
        world.add_effect_for(ghost, None, |core| Veil { core }),
        Err(WorldError::UnknownEntity { key }) if key == ghost
    ));
    assert!(matches!(
        world.create_entity(EntityKind::Item, "orphan", Some(ghost)),
        Err(WorldError::UnknownEntity { .. })
    ));
    assert!(matches!(world.db_id(ghost), Err(WorldError::UnknownEntity { .. })));
}

#[test]
fn load_refuses_populated_world() {
    let clock = ManualClock::new();
    let mut world = world_over(&clock, &MemoryStorage::new());
    world
        .create_entity(EntityKind::Room, "hall", None)
        .expect("room");

    assert!(matches!(
        world.load(),
        Err(WorldError::AlreadyPopulated { entities: 1 })
    ));
}

#[test]
fn destroying_awaited_entity_requeues_waiters() {
    let clock = ManualClock::new();
    let storage = MemoryStorage::new();
    let mut world = world_over(&clock, &storage);
    let keeper = world
        .create_entity(EntityKind::Character, "keeper", None)
        .expect("keeper");
    let shelf = world
        .create_entity(EntityKind::Room, "shelf", Some(keeper))
        .expect("shelf");
    storage.poison("keeper");
    assert!(world.flush().is_err());
    assert!(storage.record_named("shelf").is_some());

    world.destroy_entity(keeper, false).expect("destroy");

    assert!(world.save_manager().is_save_queued(shelf));
    world.flush().expect("flush");
    world.set_attribute(shelf, "hp", 5).expect("set");
    world.flush().expect("flush");

    let record = storage.record_named("shelf").expect("shelf");
    assert_eq!(record.attributes.get("hp"), Some(&5));
    assert_eq!(record.parent, None);
    assert!(!world.entity(shelf).expect("shelf").state().changed());
}

#[test]
fn waiters_released_before_failed_phase_stay_queued() {
    let clock = ManualClock::new();
    let storage = MemoryStorage::new();
    let mut world = world_over(&clock, &storage);
    let keeper = world
        .create_entity(EntityKind::Character, "keeper", None)
        .expect("keeper");
    let shelf = world
        .create_entity(EntityKind::Room, "shelf", Some(keeper))
        .expect("shelf");
    world
        .create_entity(EntityKind::Item, "junk", None)
        .expect("junk");
    storage.poison("junk");

    assert!(world.flush().is_err());
    assert!(world.save_manager().is_save_queued(shelf));
    world.set_attribute(shelf, "hp", 5).expect("set");

    storage.heal("junk");
    world.flush().expect("retry");

    let keeper_id = world.db_id(keeper).expect("keeper id");
    let record = storage.record_named("shelf").expect("shelf");
    assert_eq!(record.parent, Some(keeper_id));
    assert_eq!(record.attributes.get("hp"), Some(&5));
}

#[test]
fn failed_delete_is_retried_by_later_flush() {
    let clock = ManualClock::new();
    let storage = MemoryStorage::new();
    let mut world = world_over(&clock, &storage);
    let junk = world
        .create_entity(EntityKind::Item, "junk", None)
        .expect("junk");
    world.flush().expect("insert");

    storage.fail_next_commits(1);
    world.destroy_entity(junk, false).expect("destroy");

    assert!(world.entity(junk).is_none());
    assert!(storage.record_named("junk").is_some());
    assert_eq!(world.save_manager().pending_delete_len(), 1);

    let report = world.flush().expect("flush");
    assert_eq!(report.deleted, 1);
    assert!(storage.record_named("junk").is_none());
    assert_eq!(world.save_manager().pending_delete_len(), 0);

    let mut reloaded = world_over(&clock, &storage);
    assert_eq!(reloaded.load().expect("load").entities, 0);
}
