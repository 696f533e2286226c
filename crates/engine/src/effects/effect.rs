use std::any::Any;
use std::fmt;
use std::time::Duration;

use bitflags::bitflags;

use crate::clock::GameTime;
use crate::save::SaveManager;
use crate::schedule::EffectScheduler;
use crate::world::{EntityKey, EntityState};

use super::definition::DefinitionWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EffectId(pub u64);

impl fmt::Display for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fx#{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct EffectIdAllocator {
    next: u64,
}

impl EffectIdAllocator {
    pub fn allocate(&mut self) -> EffectId {
        self.next = self.next.saturating_add(1);
        EffectId(self.next)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PerceptionTypes: u32 {
        const VISUAL = 1 << 0;
        const AUDIBLE = 1 << 1;
        const OLFACTORY = 1 << 2;
        const TACTILE = 1 << 3;
        const INFRARED = 1 << 4;
        const ETHEREAL = 1 << 5;
        const PSYCHIC = 1 << 6;
        const SENSE_ALL = Self::VISUAL.bits()
            | Self::AUDIBLE.bits()
            | Self::OLFACTORY.bits()
            | Self::TACTILE.bits();
    }
}

/// Fields every effect carries. The owner is fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectCore {
    id: EffectId,
    owner: EntityKey,
}

impl EffectCore {
    pub fn new(id: EffectId, owner: EntityKey) -> Self {
        Self { id, owner }
    }

    pub fn id(&self) -> EffectId {
        self.id
    }

    pub fn owner(&self) -> EntityKey {
        self.owner
    }
}

/// Follow-up work requested from inside an effect hook. Hooks cannot reach the
/// owner's effect list or other entities directly; the world applies these
/// once the hook has returned.
pub enum EffectCommand {
    Add {
        target: EntityKey,
        effect: Box<dyn Effect>,
        duration: Option<Duration>,
    },
    Remove {
        target: EntityKey,
        effect: EffectId,
        fire_removal_action: bool,
    },
}

impl fmt::Debug for EffectCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add {
                target,
                effect,
                duration,
            } => f
                .debug_struct("Add")
                .field("target", target)
                .field("effect", &effect.specific_type())
                .field("duration", duration)
                .finish(),
            Self::Remove {
                target,
                effect,
                fire_removal_action,
            } => f
                .debug_struct("Remove")
                .field("target", target)
                .field("effect", effect)
                .field("fire_removal_action", fire_removal_action)
                .finish(),
        }
    }
}

/// Everything a hook may touch while it runs.
pub struct EffectContext<'a> {
    pub now: GameTime,
    pub owner: &'a mut EntityState,
    pub scheduler: &'a mut EffectScheduler,
    pub saves: &'a mut SaveManager<EntityKey>,
    follow_ups: &'a mut Vec<EffectCommand>,
    effect_ids: &'a mut EffectIdAllocator,
}

impl<'a> EffectContext<'a> {
    pub fn new(
        now: GameTime,
        owner: &'a mut EntityState,
        scheduler: &'a mut EffectScheduler,
        saves: &'a mut SaveManager<EntityKey>,
        follow_ups: &'a mut Vec<EffectCommand>,
        effect_ids: &'a mut EffectIdAllocator,
    ) -> Self {
        Self {
            now,
            owner,
            scheduler,
            saves,
            follow_ups,
            effect_ids,
        }
    }

    pub fn owner_key(&self) -> EntityKey {
        self.owner.key()
    }

    /// Flags the owner changed, queueing it for save on the false to true
    /// transition only.
    pub fn mark_owner_changed(&mut self) {
        if self.owner.set_changed() {
            self.saves.add(self.owner.key());
        }
    }

    pub fn set_owner_attribute(&mut self, name: &str, value: i64) {
        self.owner.set_attribute(name, value);
        self.mark_owner_changed();
    }

    pub fn adjust_owner_attribute(&mut self, name: &str, delta: i64) -> i64 {
        let value = self.owner.attribute(name).saturating_add(delta);
        self.set_owner_attribute(name, value);
        value
    }

    /// Core for a new effect on `owner`, typically one about to be queued.
    pub fn new_core(&mut self, owner: EntityKey) -> EffectCore {
        EffectCore::new(self.effect_ids.allocate(), owner)
    }

    pub fn queue(&mut self, command: EffectCommand) {
        self.follow_ups.push(command);
    }

    pub fn queue_add(&mut self, target: EntityKey, effect: Box<dyn Effect>, duration: Option<Duration>) {
        self.queue(EffectCommand::Add {
            target,
            effect,
            duration,
        });
    }
}

/// A unit of transient or persistent state attached to one entity.
///
/// Hooks default to doing nothing; natural expiry defaults to the removal hook.
pub trait Effect: fmt::Debug + Any {
    fn core(&self) -> &EffectCore;

    /// Discriminator written into saved definitions and used to find the loader.
    fn specific_type(&self) -> &'static str;

    fn id(&self) -> EffectId {
        self.core().id()
    }

    fn owner(&self) -> EntityKey {
        self.core().owner()
    }

    fn saving_effect(&self) -> bool {
        false
    }

    fn applies(&self) -> bool {
        true
    }

    fn applies_to(&self, _perceiver: EntityKey) -> bool {
        self.applies()
    }

    fn perception_granting(&self) -> PerceptionTypes {
        PerceptionTypes::empty()
    }

    fn perception_denying(&self) -> PerceptionTypes {
        PerceptionTypes::empty()
    }

    fn hides(&self) -> PerceptionTypes {
        PerceptionTypes::empty()
    }

    fn initial_effect(&mut self, _cx: &mut EffectContext<'_>) {}

    fn removal_effect(&mut self, _cx: &mut EffectContext<'_>) {}

    fn expire_effect(&mut self, cx: &mut EffectContext<'_>) {
        self.removal_effect(cx);
    }

    /// Writes subtype fields. Returning `false` means the definition cannot be
    /// written yet (for example a referenced entity has no durable identity).
    fn save_definition(&self, _writer: &mut DefinitionWriter<'_>) -> bool {
        true
    }

    fn describe(&self) -> String {
        format!("{} {}", self.specific_type(), self.id())
    }

    fn as_any(&self) -> &dyn Any;
}

impl<'a> dyn Effect + 'a {
    pub fn downcast_ref<T: Effect>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn is<T: Effect>(&self) -> bool {
        self.as_any().is::<T>()
    }
}
