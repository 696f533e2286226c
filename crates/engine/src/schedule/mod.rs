mod entry;
mod scheduler;

pub use entry::{ScheduleEntry, ScheduledEffect};
pub use scheduler::{
    CheckReport, EffectScheduler, ScheduleError, ShortenOutcome, DEFAULT_LATE_FIRE_WARNING,
};
