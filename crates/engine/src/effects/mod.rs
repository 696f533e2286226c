//! Effects attached to entities.
//!
//! - **Effect**: the polymorphic contract (`effect`)
//! - **EffectHandler**: per-owner container that forwards durations to the
//!   scheduler (`handler`)
//! - **Definitions**: the tagged XML blob saved for persistent effects and the
//!   registry that turns it back into a concrete effect (`definition`,
//!   `registry`)

mod definition;
mod effect;
mod handler;
mod registry;

pub use definition::{DefinitionError, DefinitionWriter, EffectDefinition};
pub use effect::{
    Effect, EffectCommand, EffectContext, EffectCore, EffectId, EffectIdAllocator,
    PerceptionTypes,
};
pub use handler::{DurationChange, EffectError, EffectHandler};
pub use registry::{EffectLoader, EffectRegistry, LoadContext, RegistryError};

pub(crate) use handler::schedule_target;
