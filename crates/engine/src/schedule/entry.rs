use std::time::Duration;

use crate::clock::GameTime;
use crate::effects::EffectId;
use crate::world::EntityKey;

/// The scheduler's view of an effect: enough to fire it and to find its owner
/// without touching the effect itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduledEffect {
    pub effect: EffectId,
    pub owner: EntityKey,
    pub saving: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub target: ScheduledEffect,
    pub trigger_eta: GameTime,
    pub duration: Duration,
}

impl ScheduleEntry {
    pub fn effect(&self) -> EffectId {
        self.target.effect
    }

    pub fn owner(&self) -> EntityKey {
        self.target.owner
    }

    pub fn remaining(&self, now: GameTime) -> Duration {
        self.trigger_eta.saturating_duration_since(now)
    }
}

/// Total order over live entries: due time first, then insertion sequence so
/// equal due times fire first-in first-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ScheduleKey {
    pub(crate) trigger_eta: GameTime,
    pub(crate) sequence: u64,
}
