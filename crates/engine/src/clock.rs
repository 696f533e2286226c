use std::cell::Cell;
use std::fmt;
use std::ops::{Add, AddAssign};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Monotonic game time, measured from the moment the clock started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GameTime(Duration);

impl GameTime {
    pub const ZERO: GameTime = GameTime(Duration::ZERO);

    pub fn from_duration(offset: Duration) -> Self {
        Self(offset)
    }

    pub fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    pub fn as_duration(self) -> Duration {
        self.0
    }

    pub fn saturating_duration_since(self, earlier: GameTime) -> Duration {
        self.0.saturating_sub(earlier.0)
    }

    pub fn saturating_sub(self, amount: Duration) -> GameTime {
        Self(self.0.saturating_sub(amount))
    }
}

impl Add<Duration> for GameTime {
    type Output = GameTime;

    fn add(self, rhs: Duration) -> GameTime {
        GameTime(self.0.saturating_add(rhs))
    }
}

impl AddAssign<Duration> for GameTime {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 = self.0.saturating_add(rhs);
    }
}

impl fmt::Display for GameTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0.as_millis())
    }
}

pub trait Clock {
    fn now(&self) -> GameTime;
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> GameTime {
        GameTime(Instant::now().saturating_duration_since(self.started))
    }
}

/// Hand-driven clock. Clones share the same underlying time, so a test can keep
/// one handle while the world owns another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<GameTime>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(start: GameTime) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }

    pub fn set(&self, to: GameTime) {
        self.now.set(to);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> GameTime {
        self.now.get()
    }
}
