use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use mud_engine::{EntityKey, EntityKind, World, WorldError};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use super::effects::{Concealed, Poisoned, StatModifier, Tethered};

const SEED_VERSION: u32 = 1;

pub(crate) const DEFAULT_SEED: &str = include_str!("../../seed/world.json");

#[derive(Debug, Error)]
pub(crate) enum SeedError {
    #[error("parse seed json at {path}: {message}")]
    Parse { path: String, message: String },
    #[error("seed validation failed at {path}: {message}")]
    Invalid { path: String, message: String },
    #[error(transparent)]
    World(#[from] WorldError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SeedWorld {
    pub(crate) seed_version: u32,
    pub(crate) rooms: Vec<SeedRoom>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SeedRoom {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) items: Vec<SeedItem>,
    #[serde(default)]
    pub(crate) characters: Vec<SeedCharacter>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SeedCharacter {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) attributes: BTreeMap<String, i64>,
    #[serde(default)]
    pub(crate) items: Vec<SeedItem>,
    #[serde(default)]
    pub(crate) effects: Vec<SeedEffect>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SeedItem {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) attributes: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum SeedEffect {
    StatModifier {
        attribute: String,
        amount: i64,
        #[serde(default)]
        duration_secs: Option<u64>,
    },
    Concealed {
        #[serde(default)]
        duration_secs: Option<u64>,
    },
    Poisoned {
        damage: i64,
        duration_secs: u64,
    },
    Tethered {
        anchor: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SeedReport {
    pub(crate) rooms: usize,
    pub(crate) characters: usize,
    pub(crate) items: usize,
    pub(crate) effects: usize,
}

pub(crate) fn parse_seed(raw: &str) -> Result<SeedWorld, SeedError> {
    let mut deserializer = serde_json::Deserializer::from_str(raw);
    let seed = serde_path_to_error::deserialize::<_, SeedWorld>(&mut deserializer).map_err(
        |error| SeedError::Parse {
            path: error.path().to_string(),
            message: error.into_inner().to_string(),
        },
    )?;
    validate_seed(&seed)?;
    Ok(seed)
}

fn validate_seed(seed: &SeedWorld) -> Result<(), SeedError> {
    if seed.seed_version != SEED_VERSION {
        return Err(invalid(
            "seed_version",
            format!("expected {SEED_VERSION}, got {}", seed.seed_version),
        ));
    }

    let mut character_names = HashMap::new();
    for (room_index, room) in seed.rooms.iter().enumerate() {
        for (index, character) in room.characters.iter().enumerate() {
            let path = format!("rooms[{room_index}].characters[{index}].name");
            if let Some(first) = character_names.insert(character.name.as_str(), path.clone()) {
                return Err(invalid(
                    &path,
                    format!("duplicate character '{}' (first at {first})", character.name),
                ));
            }
        }
    }

    for (room_index, room) in seed.rooms.iter().enumerate() {
        for (index, character) in room.characters.iter().enumerate() {
            for (effect_index, effect) in character.effects.iter().enumerate() {
                if let SeedEffect::Tethered { anchor } = effect {
                    if anchor == &character.name {
                        return Err(invalid(
                            &format!(
                                "rooms[{room_index}].characters[{index}].effects[{effect_index}].anchor"
                            ),
                            "a character cannot be tethered to itself",
                        ));
                    }
                    if !character_names.contains_key(anchor.as_str()) {
                        return Err(invalid(
                            &format!(
                                "rooms[{room_index}].characters[{index}].effects[{effect_index}].anchor"
                            ),
                            format!("unknown character '{anchor}'"),
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}

fn invalid(path: &str, message: impl Into<String>) -> SeedError {
    SeedError::Invalid {
        path: path.to_string(),
        message: message.into(),
    }
}

/// Builds the seed's rooms, characters and items, attaches their effects and
/// flushes so every seeded entity has a durable id.
pub(crate) fn seed_world(world: &mut World, seed: &SeedWorld) -> Result<SeedReport, SeedError> {
    let mut report = SeedReport::default();
    let mut characters = Vec::new();
    let mut by_name = HashMap::new();

    for room in &seed.rooms {
        let room_key = world.create_entity(EntityKind::Room, room.name.as_str(), None)?;
        report.rooms += 1;
        report.items += create_items(world, &room.items, room_key)?;

        for character in &room.characters {
            let key = world.create_entity(
                EntityKind::Character,
                character.name.as_str(),
                Some(room_key),
            )?;
            for (attribute, value) in &character.attributes {
                world.set_attribute(key, attribute, *value)?;
            }
            report.characters += 1;
            report.items += create_items(world, &character.items, key)?;
            by_name.insert(character.name.as_str(), key);
            characters.push((key, character));
        }
    }

    for (key, character) in characters {
        for effect in &character.effects {
            apply_effect(world, key, effect, &by_name)?;
            report.effects += 1;
        }
    }

    let flushed = world.flush()?;
    info!(
        rooms = report.rooms,
        characters = report.characters,
        items = report.items,
        effects = report.effects,
        registered = flushed.registered.len(),
        "world_seeded"
    );
    Ok(report)
}

fn create_items(
    world: &mut World,
    items: &[SeedItem],
    holder: EntityKey,
) -> Result<usize, WorldError> {
    for item in items {
        let key = world.create_entity(EntityKind::Item, item.name.as_str(), Some(holder))?;
        for (attribute, value) in &item.attributes {
            world.set_attribute(key, attribute, *value)?;
        }
    }
    Ok(items.len())
}

fn apply_effect(
    world: &mut World,
    owner: EntityKey,
    effect: &SeedEffect,
    by_name: &HashMap<&str, EntityKey>,
) -> Result<(), SeedError> {
    match effect {
        SeedEffect::StatModifier {
            attribute,
            amount,
            duration_secs,
        } => {
            world.add_effect_for(owner, duration_secs.map(Duration::from_secs), |core| {
                StatModifier::new(core, attribute.as_str(), *amount)
            })?;
        }
        SeedEffect::Concealed { duration_secs } => {
            world.add_effect_for(owner, duration_secs.map(Duration::from_secs), Concealed::new)?;
        }
        SeedEffect::Poisoned {
            damage,
            duration_secs,
        } => {
            world.add_effect_for(owner, Some(Duration::from_secs(*duration_secs)), |core| {
                Poisoned::new(core, *damage)
            })?;
        }
        SeedEffect::Tethered { anchor } => {
            let target = by_name
                .get(anchor.as_str())
                .copied()
                .ok_or_else(|| invalid("anchor", format!("unknown character '{anchor}'")))?;
            world.add_effect_for(owner, None, |core| Tethered::new(core, target))?;
        }
    }
    Ok(())
}
