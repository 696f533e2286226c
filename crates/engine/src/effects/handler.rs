use std::time::Duration;

use thiserror::Error;

use crate::clock::GameTime;
use crate::schedule::{EffectScheduler, ScheduleError, ScheduledEffect, ShortenOutcome};
use crate::world::EntityKey;

use super::effect::{Effect, EffectContext, EffectId, PerceptionTypes};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EffectError {
    #[error("effect {effect} is already active on {owner}")]
    Duplicate { effect: EffectId, owner: EntityKey },
    #[error("effect {effect} belongs to {effect_owner} but was added to {handler_owner}")]
    OwnerMismatch {
        effect: EffectId,
        effect_owner: EntityKey,
        handler_owner: EntityKey,
    },
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationChange {
    Rescheduled(GameTime),
    /// The effect ran out of time and was removed as if it had expired.
    Expired,
    NotScheduled,
}

pub(crate) fn schedule_target(effect: &dyn Effect) -> ScheduledEffect {
    ScheduledEffect {
        effect: effect.id(),
        owner: effect.owner(),
        saving: effect.saving_effect(),
    }
}

/// Active effects for one owner.
///
/// Hooks run with the effect already detached from the list when it is
/// leaving, and with the effect in place when it is arriving.
#[derive(Debug)]
pub struct EffectHandler {
    owner: EntityKey,
    effects: Vec<Box<dyn Effect>>,
}

impl EffectHandler {
    pub fn new(owner: EntityKey) -> Self {
        Self {
            owner,
            effects: Vec::new(),
        }
    }

    pub fn owner(&self) -> EntityKey {
        self.owner
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn effects(&self) -> impl Iterator<Item = &dyn Effect> {
        self.effects.iter().map(|effect| effect.as_ref())
    }

    pub fn effect(&self, id: EffectId) -> Option<&dyn Effect> {
        self.effects
            .iter()
            .find(|effect| effect.id() == id)
            .map(|effect| effect.as_ref())
    }

    pub fn contains(&self, id: EffectId) -> bool {
        self.position(id).is_some()
    }

    pub fn effects_of_type<T: Effect>(&self) -> impl Iterator<Item = &T> {
        self.effects
            .iter()
            .filter_map(|effect| effect.as_ref().downcast_ref::<T>())
    }

    pub fn has_effect_of_type<T: Effect>(&self) -> bool {
        self.effects_of_type::<T>().next().is_some()
    }

    pub fn saving_effects(&self) -> impl Iterator<Item = &dyn Effect> {
        self.effects().filter(|effect| effect.saving_effect())
    }

    pub fn add_effect(
        &mut self,
        effect: Box<dyn Effect>,
        duration: Option<Duration>,
        cx: &mut EffectContext<'_>,
    ) -> Result<EffectId, EffectError> {
        let id = effect.id();
        if effect.owner() != self.owner {
            return Err(EffectError::OwnerMismatch {
                effect: id,
                effect_owner: effect.owner(),
                handler_owner: self.owner,
            });
        }
        if self.contains(id) {
            return Err(EffectError::Duplicate {
                effect: id,
                owner: self.owner,
            });
        }
        if let Some(existing) = cx.scheduler.entry(id) {
            return Err(ScheduleError::AlreadyScheduled {
                effect: id,
                trigger_eta: existing.trigger_eta,
            }
            .into());
        }

        let target = schedule_target(effect.as_ref());
        self.effects.push(effect);
        if let Some(effect) = self.effects.last_mut() {
            effect.initial_effect(cx);
        }
        if target.saving {
            cx.mark_owner_changed();
        }
        if let Some(duration) = duration {
            cx.scheduler.add_schedule(target, duration, cx.now)?;
        }
        Ok(id)
    }

    /// Reattaches an effect read back from storage. Hooks do not run and the
    /// owner is not marked changed, since the saved state already reflects the
    /// effect. `remaining` schedules it relative to `now`.
    pub fn restore_effect(
        &mut self,
        effect: Box<dyn Effect>,
        remaining: Option<Duration>,
        scheduler: &mut EffectScheduler,
        now: GameTime,
    ) -> Result<EffectId, EffectError> {
        let id = effect.id();
        if effect.owner() != self.owner {
            return Err(EffectError::OwnerMismatch {
                effect: id,
                effect_owner: effect.owner(),
                handler_owner: self.owner,
            });
        }
        if self.contains(id) {
            return Err(EffectError::Duplicate {
                effect: id,
                owner: self.owner,
            });
        }
        let target = schedule_target(effect.as_ref());
        if let Some(remaining) = remaining {
            scheduler.add_schedule(target, remaining, now)?;
        }
        self.effects.push(effect);
        Ok(id)
    }

    pub fn remove_effect(
        &mut self,
        id: EffectId,
        fire_removal_action: bool,
        cx: &mut EffectContext<'_>,
    ) -> Option<Box<dyn Effect>> {
        let mut effect = self.detach(id, cx)?;
        if fire_removal_action {
            effect.removal_effect(cx);
        }
        if effect.saving_effect() {
            cx.mark_owner_changed();
        }
        Some(effect)
    }

    /// Natural expiry. An effect that is no longer attached is ignored, which
    /// makes a stale schedule firing harmless.
    pub fn expire_effect(
        &mut self,
        id: EffectId,
        cx: &mut EffectContext<'_>,
    ) -> Option<Box<dyn Effect>> {
        let mut effect = self.detach(id, cx)?;
        effect.expire_effect(cx);
        if effect.saving_effect() {
            cx.mark_owner_changed();
        }
        Some(effect)
    }

    pub fn remove_all_effects(
        &mut self,
        predicate: impl Fn(&dyn Effect) -> bool,
        fire_removal_action: bool,
        cx: &mut EffectContext<'_>,
    ) -> Vec<Box<dyn Effect>> {
        let snapshot = self
            .effects
            .iter()
            .filter(|effect| predicate(effect.as_ref()))
            .map(|effect| effect.id())
            .collect::<Vec<_>>();
        snapshot
            .into_iter()
            .filter_map(|id| self.remove_effect(id, fire_removal_action, cx))
            .collect()
    }

    pub fn reschedule(
        &mut self,
        id: EffectId,
        new_duration: Duration,
        cx: &mut EffectContext<'_>,
    ) -> Option<GameTime> {
        let target = schedule_target(self.effect(id)?);
        Some(cx.scheduler.reschedule(target, new_duration, cx.now))
    }

    pub fn reschedule_if_longer(
        &mut self,
        id: EffectId,
        new_duration: Duration,
        cx: &mut EffectContext<'_>,
    ) -> Option<GameTime> {
        let target = schedule_target(self.effect(id)?);
        Some(
            cx.scheduler
                .reschedule_if_longer(target, new_duration, cx.now),
        )
    }

    pub fn add_duration(
        &mut self,
        id: EffectId,
        extension: Duration,
        cx: &mut EffectContext<'_>,
    ) -> DurationChange {
        if !self.contains(id) {
            return DurationChange::NotScheduled;
        }
        match cx.scheduler.extend_schedule(id, extension) {
            Some(trigger_eta) => DurationChange::Rescheduled(trigger_eta),
            None => DurationChange::NotScheduled,
        }
    }

    /// Shortens the schedule. A reduction that would leave no time expires the
    /// effect immediately rather than letting it go negative.
    pub fn remove_duration(
        &mut self,
        id: EffectId,
        reduction: Duration,
        cx: &mut EffectContext<'_>,
    ) -> DurationChange {
        if !self.contains(id) {
            return DurationChange::NotScheduled;
        }
        match cx.scheduler.shorten_schedule(id, reduction, cx.now) {
            ShortenOutcome::Shortened(trigger_eta) => DurationChange::Rescheduled(trigger_eta),
            ShortenOutcome::NotScheduled => DurationChange::NotScheduled,
            ShortenOutcome::WouldExpire => {
                self.expire_effect(id, cx);
                DurationChange::Expired
            }
        }
    }

    pub fn get_perception(&self, base: PerceptionTypes) -> PerceptionTypes {
        let (granted, denied) = self
            .effects()
            .filter(|effect| effect.applies())
            .fold(
                (PerceptionTypes::empty(), PerceptionTypes::empty()),
                |(granted, denied), effect| {
                    (
                        granted | effect.perception_granting(),
                        denied | effect.perception_denying(),
                    )
                },
            );
        (base | granted) & !denied
    }

    /// True when every sense in `types` is hidden from `perceiver` by an
    /// applicable effect.
    pub fn hidden_from_perception(&self, perceiver: EntityKey, types: PerceptionTypes) -> bool {
        if types.is_empty() {
            return false;
        }
        let hidden = self
            .effects()
            .filter(|effect| effect.applies_to(perceiver))
            .fold(PerceptionTypes::empty(), |hidden, effect| {
                hidden | effect.hides()
            });
        (types & !hidden).is_empty()
    }

    fn position(&self, id: EffectId) -> Option<usize> {
        self.effects.iter().position(|effect| effect.id() == id)
    }

    fn detach(&mut self, id: EffectId, cx: &mut EffectContext<'_>) -> Option<Box<dyn Effect>> {
        let index = self.position(id)?;
        cx.scheduler.unschedule(id);
        Some(self.effects.remove(index))
    }
}
