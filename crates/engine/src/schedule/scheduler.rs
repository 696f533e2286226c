use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::GameTime;
use crate::effects::EffectId;
use crate::world::EntityKey;

use super::entry::{ScheduleEntry, ScheduleKey, ScheduledEffect};

pub const DEFAULT_LATE_FIRE_WARNING: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("effect {effect} already has a live schedule due at {trigger_eta}")]
    AlreadyScheduled {
        effect: EffectId,
        trigger_eta: GameTime,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub fired: usize,
    pub late: usize,
    pub max_lateness: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortenOutcome {
    Shortened(GameTime),
    /// The reduction reaches or passes the due time. The entry is left alone so
    /// the caller can expire the effect itself.
    WouldExpire,
    NotScheduled,
}

/// Global time-ordered index of effect expirations.
///
/// `ordered` and `by_effect` always describe the same set of entries; every
/// mutation goes through `insert`/`take` so the two never disagree.
#[derive(Debug)]
pub struct EffectScheduler {
    ordered: BTreeMap<ScheduleKey, ScheduleEntry>,
    by_effect: HashMap<EffectId, ScheduleKey>,
    next_sequence: u64,
    late_fire_warning: Duration,
}

impl Default for EffectScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_LATE_FIRE_WARNING)
    }
}

impl EffectScheduler {
    pub fn new(late_fire_warning: Duration) -> Self {
        Self {
            ordered: BTreeMap::new(),
            by_effect: HashMap::new(),
            next_sequence: 0,
            late_fire_warning,
        }
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn set_late_fire_warning(&mut self, threshold: Duration) {
        self.late_fire_warning = threshold;
    }

    pub fn add_schedule(
        &mut self,
        target: ScheduledEffect,
        duration: Duration,
        now: GameTime,
    ) -> Result<GameTime, ScheduleError> {
        if let Some(existing) = self.entry(target.effect) {
            return Err(ScheduleError::AlreadyScheduled {
                effect: target.effect,
                trigger_eta: existing.trigger_eta,
            });
        }
        let trigger_eta = now + duration;
        self.insert(target, trigger_eta, duration);
        Ok(trigger_eta)
    }

    /// Cancels the live entry for `effect`. Calling this for an effect with no
    /// entry is a no-op.
    pub fn unschedule(&mut self, effect: EffectId) -> Option<ScheduleEntry> {
        self.take(effect)
    }

    /// Replaces any live entry with one due `new_duration` from now.
    pub fn reschedule(
        &mut self,
        target: ScheduledEffect,
        new_duration: Duration,
        now: GameTime,
    ) -> GameTime {
        self.take(target.effect);
        let trigger_eta = now + new_duration;
        self.insert(target, trigger_eta, new_duration);
        trigger_eta
    }

    /// Moves the due time later only. An earlier request leaves the entry
    /// untouched; a missing entry is created.
    pub fn reschedule_if_longer(
        &mut self,
        target: ScheduledEffect,
        new_duration: Duration,
        now: GameTime,
    ) -> GameTime {
        let candidate = now + new_duration;
        match self.entry(target.effect) {
            Some(existing) if existing.trigger_eta >= candidate => existing.trigger_eta,
            _ => self.reschedule(target, new_duration, now),
        }
    }

    /// Pushes the due time of a live entry back by `extension`. Returns the new
    /// due time, or `None` when the effect is not scheduled.
    pub fn extend_schedule(&mut self, effect: EffectId, extension: Duration) -> Option<GameTime> {
        let entry = self.take(effect)?;
        let trigger_eta = entry.trigger_eta + extension;
        self.insert(
            entry.target,
            trigger_eta,
            entry.duration.saturating_add(extension),
        );
        Some(trigger_eta)
    }

    pub fn shorten_schedule(
        &mut self,
        effect: EffectId,
        reduction: Duration,
        now: GameTime,
    ) -> ShortenOutcome {
        let Some(entry) = self.entry(effect).copied() else {
            return ShortenOutcome::NotScheduled;
        };
        if entry.remaining(now) <= reduction {
            return ShortenOutcome::WouldExpire;
        }
        self.take(effect);
        let trigger_eta = entry.trigger_eta.saturating_sub(reduction);
        self.insert(
            entry.target,
            trigger_eta,
            entry.duration.saturating_sub(reduction),
        );
        ShortenOutcome::Shortened(trigger_eta)
    }

    pub fn remaining_duration(&self, effect: EffectId, now: GameTime) -> Duration {
        self.entry(effect)
            .map(|entry| entry.remaining(now))
            .unwrap_or(Duration::ZERO)
    }

    pub fn original_duration(&self, effect: EffectId) -> Duration {
        self.entry(effect)
            .map(|entry| entry.duration)
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_scheduled(&self, effect: EffectId) -> bool {
        self.by_effect.contains_key(&effect)
    }

    pub fn entry(&self, effect: EffectId) -> Option<&ScheduleEntry> {
        self.by_effect
            .get(&effect)
            .and_then(|key| self.ordered.get(key))
    }

    pub fn next_due(&self) -> Option<GameTime> {
        self.ordered.keys().next().map(|key| key.trigger_eta)
    }

    /// Removes and returns the earliest entry if it is due.
    pub fn pop_due(&mut self, now: GameTime) -> Option<ScheduleEntry> {
        let (key, entry) = self.ordered.first_key_value()?;
        if key.trigger_eta > now {
            return None;
        }
        let effect = entry.target.effect;
        self.take(effect)
    }

    /// Fires every due entry in due order.
    ///
    /// Each entry is fully removed before `fire` runs, so the callback may add,
    /// reschedule or cancel entries freely. Entries it adds that are already due
    /// fire within the same call.
    pub fn check_schedules<C>(
        &mut self,
        now: GameTime,
        ctx: &mut C,
        mut fire: impl FnMut(&mut Self, &mut C, ScheduleEntry),
    ) -> CheckReport {
        let mut report = CheckReport::default();
        while let Some(entry) = self.pop_due(now) {
            let lateness = now.saturating_duration_since(entry.trigger_eta);
            if lateness > self.late_fire_warning {
                report.late += 1;
                warn!(
                    effect = %entry.effect(),
                    owner = %entry.owner(),
                    late_ms = lateness.as_millis() as u64,
                    "schedule_fired_late"
                );
            }
            report.max_lateness = report.max_lateness.max(lateness);
            report.fired += 1;
            fire(self, ctx, entry);
        }
        if report.fired > 0 {
            debug!(
                fired = report.fired,
                remaining = self.len(),
                "schedules_checked"
            );
        }
        report
    }

    /// Cancels every entry owned by `owner`, returning them in due order so the
    /// caller can run expiry or removal hooks.
    pub fn destroy(&mut self, owner: EntityKey) -> Vec<ScheduleEntry> {
        let effects = self
            .ordered
            .values()
            .filter(|entry| entry.owner() == owner)
            .map(ScheduleEntry::effect)
            .collect::<Vec<_>>();
        effects
            .into_iter()
            .filter_map(|effect| self.take(effect))
            .collect()
    }

    pub fn entries_for(&self, owner: EntityKey) -> Vec<ScheduleEntry> {
        self.ordered
            .values()
            .filter(|entry| entry.owner() == owner)
            .copied()
            .collect()
    }

    /// Owners holding at least one scheduled saving effect, in due order of
    /// their earliest such entry.
    pub fn saving_owners(&self) -> Vec<EntityKey> {
        let mut seen = HashSet::new();
        self.ordered
            .values()
            .filter(|entry| entry.target.saving)
            .map(ScheduleEntry::owner)
            .filter(|owner| seen.insert(*owner))
            .collect()
    }

    pub fn debug_dump(&self, now: GameTime) -> String {
        let mut output = format!("schedules={} now={}", self.len(), now);
        for entry in self.ordered.values() {
            let _ = write!(
                output,
                "\neffect={} owner={} due={} remaining_ms={} duration_ms={} saving={}",
                entry.effect(),
                entry.owner(),
                entry.trigger_eta,
                entry.remaining(now).as_millis(),
                entry.duration.as_millis(),
                entry.target.saving
            );
        }
        output
    }

    fn insert(&mut self, target: ScheduledEffect, trigger_eta: GameTime, duration: Duration) {
        let key = ScheduleKey {
            trigger_eta,
            sequence: self.next_sequence,
        };
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.ordered.insert(
            key,
            ScheduleEntry {
                target,
                trigger_eta,
                duration,
            },
        );
        self.by_effect.insert(target.effect, key);
    }

    fn take(&mut self, effect: EffectId) -> Option<ScheduleEntry> {
        let key = self.by_effect.remove(&effect)?;
        self.ordered.remove(&key)
    }
}
