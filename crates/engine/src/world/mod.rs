mod entity;
mod game_world;
mod store;

pub use entity::{Entity, EntityKey, EntityKeyAllocator, EntityKind, EntityState};
pub use game_world::{EntityMut, LoadReport, TickReport, World, WorldError};

#[cfg(test)]
mod tests;
