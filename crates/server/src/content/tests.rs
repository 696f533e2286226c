use std::time::Duration;

use mud_engine::{
    Effect, EngineConfig, EntityKey, ManualClock, MemoryStorage, PerceptionTypes, World,
};

use super::effects::{Poisoned, Tethered, Weakened, HEALTH, STRENGTH};
use super::seed::SeedReport;
use super::*;

const SMITH: &str = "Aldric the Smith";
const HOUND: &str = "a mangy hound";

fn world_over(clock: &ManualClock, storage: &MemoryStorage) -> World {
    World::new(
        EngineConfig::default(),
        Box::new(clock.clone()),
        Box::new(storage.clone()),
        build_registry().expect("registry"),
    )
}

fn seeded(clock: &ManualClock, storage: &MemoryStorage) -> World {
    let mut world = world_over(clock, storage);
    let seed = parse_seed(DEFAULT_SEED).expect("default seed");
    seed_world(&mut world, &seed).expect("seed");
    world
}

fn key_named(world: &World, storage: &MemoryStorage, name: &str) -> EntityKey {
    let record = storage.record_named(name).expect("record");
    world.find_by_db_id(record.id).expect("loaded")
}

fn attribute(world: &World, key: EntityKey, name: &str) -> i64 {
    world.entity(key).expect("entity").state().attribute(name)
}

#[test]
fn registry_knows_every_shipped_type() {
    let registry = build_registry().expect("registry");

    assert_eq!(
        registry.registered_types(),
        vec!["Concealed", "Poisoned", "StatModifier", "Tethered", "Weakened"]
    );
}

#[test]
fn default_seed_builds_and_persists_world() {
    let clock = ManualClock::new();
    let storage = MemoryStorage::new();
    let mut world = world_over(&clock, &storage);
    let seed = parse_seed(DEFAULT_SEED).expect("default seed");

    let report = seed_world(&mut world, &seed).expect("seed");

    assert_eq!(
        report,
        SeedReport {
            rooms: 2,
            characters: 3,
            items: 2,
            effects: 4,
        }
    );
    assert_eq!(storage.len(), 7);
    assert!(!world.save_manager().has_pending_work());

    let smith = key_named(&world, &storage, SMITH);
    let hound = key_named(&world, &storage, HOUND);
    assert_eq!(attribute(&world, smith, STRENGTH), 16);
    assert_eq!(attribute(&world, hound, HEALTH), 8);
    assert_eq!(
        storage.record_named(SMITH).expect("smith").attributes.get(STRENGTH),
        Some(&16)
    );
    assert_eq!(storage.record_named(HOUND).expect("hound").effects.len(), 2);
}

#[test]
fn concealment_hides_from_others_only() {
    let clock = ManualClock::new();
    let storage = MemoryStorage::new();
    let world = seeded(&clock, &storage);
    let mira = key_named(&world, &storage, "Mira");
    let smith = key_named(&world, &storage, SMITH);

    assert!(world.hidden_from_perception(mira, smith, PerceptionTypes::VISUAL));
    assert!(!world.hidden_from_perception(mira, mira, PerceptionTypes::VISUAL));
    assert!(!world.hidden_from_perception(mira, smith, PerceptionTypes::SENSE_ALL));
}

#[test]
fn poison_runs_its_course_into_weakness() {
    let clock = ManualClock::new();
    let storage = MemoryStorage::new();
    let mut world = seeded(&clock, &storage);
    let hound = key_named(&world, &storage, HOUND);
    assert_eq!(attribute(&world, hound, STRENGTH), 6);

    clock.advance(Duration::from_secs(45));
    world.check_schedules();

    let effects = world.entity(hound).expect("hound").effects();
    assert!(!effects.has_effect_of_type::<Poisoned>());
    let weakened = effects
        .effects_of_type::<Weakened>()
        .next()
        .expect("weakened");
    assert_eq!(weakened.penalty, 2);
    assert_eq!(attribute(&world, hound, STRENGTH), 4);

    clock.advance(super::effects::WEAKENED_DURATION);
    world.check_schedules();
    assert_eq!(attribute(&world, hound, STRENGTH), 6);
    assert!(!world
        .entity(hound)
        .expect("hound")
        .effects()
        .has_effect_of_type::<Weakened>());
}

#[test]
fn curing_poison_skips_the_aftermath() {
    let clock = ManualClock::new();
    let storage = MemoryStorage::new();
    let mut world = seeded(&clock, &storage);
    let hound = key_named(&world, &storage, HOUND);

    let removed = world
        .remove_all_effects(hound, |effect| effect.is::<Poisoned>(), true)
        .expect("cure");

    assert_eq!(removed, 1);
    assert!(world.entity(hound).expect("hound").effects().has_effect_of_type::<Tethered>());
    assert!(!world
        .entity(hound)
        .expect("hound")
        .effects()
        .has_effect_of_type::<Weakened>());
}

#[test]
fn restart_restores_effects_without_reapplying_them() {
    let storage = MemoryStorage::new();
    {
        let clock = ManualClock::new();
        let mut world = seeded(&clock, &storage);
        clock.advance(Duration::from_secs(15));
        world.save_effect_durations();
        world.flush().expect("flush");
    }

    let clock = ManualClock::new();
    let mut world = world_over(&clock, &storage);
    let loaded = world.load().expect("load");
    assert_eq!(loaded.entities, 7);
    world.flush_lazy_load(Duration::from_secs(5));

    let smith = key_named(&world, &storage, SMITH);
    let hound = key_named(&world, &storage, HOUND);
    assert_eq!(attribute(&world, smith, STRENGTH), 16);
    assert_eq!(attribute(&world, hound, HEALTH), 8);

    let hound_effects = world.entity(hound).expect("hound").effects();
    let tether = hound_effects
        .effects_of_type::<Tethered>()
        .next()
        .expect("tether");
    assert_eq!(tether.anchor, smith);

    let poison = hound_effects
        .effects_of_type::<Poisoned>()
        .next()
        .expect("poison");
    assert_eq!(world.remaining_duration(poison.id()), Duration::from_secs(30));
}

#[test]
fn tether_to_destroyed_character_is_dropped_on_load() {
    let storage = MemoryStorage::new();
    {
        let clock = ManualClock::new();
        let mut world = seeded(&clock, &storage);
        let smith = key_named(&world, &storage, SMITH);
        world.destroy_entity(smith, true).expect("destroy");
    }
    assert!(storage.record_named(SMITH).is_none());

    let clock = ManualClock::new();
    let mut world = world_over(&clock, &storage);
    world.load().expect("load");
    world.flush_lazy_load(Duration::from_secs(5));

    let hound = key_named(&world, &storage, HOUND);
    let effects = world.entity(hound).expect("hound").effects();
    assert!(!effects.has_effect_of_type::<Tethered>());
    assert!(effects.has_effect_of_type::<Poisoned>());

    world.flush().expect("flush");
    assert_eq!(storage.record_named(HOUND).expect("hound").effects.len(), 1);
    assert_eq!(
        storage.record_named("iron hammer").expect("hammer").parent,
        None
    );
}

#[test]
fn seed_parse_error_names_field() {
    let error = parse_seed(r#"{ "seed_version": "one", "rooms": [] }"#).expect_err("bad seed");

    match error {
        SeedError::Parse { path, .. } => assert_eq!(path, "seed_version"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn seed_rejects_wrong_version() {
    let error = parse_seed(r#"{ "seed_version": 2, "rooms": [] }"#).expect_err("bad seed");

    assert!(matches!(error, SeedError::Invalid { ref path, .. } if path == "seed_version"));
}

#[test]
fn seed_rejects_unknown_tether_anchor() {
    let raw = r#"{
        "seed_version": 1,
        "rooms": [
            {
                "name": "Cellar",
                "characters": [
                    { "name": "rat", "effects": [ { "kind": "tethered", "anchor": "nobody" } ] }
                ]
            }
        ]
    }"#;

    let error = parse_seed(raw).expect_err("bad seed");

    assert!(matches!(
        error,
        SeedError::Invalid { ref path, .. }
            if path == "rooms[0].characters[0].effects[0].anchor"
    ));
}

#[test]
fn seed_rejects_duplicate_character_names() {
    let raw = r#"{
        "seed_version": 1,
        "rooms": [
            { "name": "A", "characters": [ { "name": "twin" } ] },
            { "name": "B", "characters": [ { "name": "twin" } ] }
        ]
    }"#;

    let error = parse_seed(raw).expect_err("bad seed");

    assert!(matches!(
        error,
        SeedError::Invalid { ref path, .. } if path == "rooms[1].characters[0].name"
    ));
}
