use tokio::time::Instant;

/// Monotonic tick, in microseconds since the owning [`Clock`]'s epoch.
pub type Tick = u64;

pub const TICKS_PER_SEC: u64 = 1_000_000;
pub const TICKS_PER_MS: u64 = TICKS_PER_SEC / 1000;

/// Wrap-safe "is `a` later than `b`": true iff going forward from `b` reaches `a` in less than
///  half the tick range. With microsecond ticks a wrap takes half a million years, but all
///  comparisons go through here so the arithmetic is uniform with the packet id space.
pub fn is_newer(a: Tick, b: Tick) -> bool {
    a != b && a.wrapping_sub(b) < u64::MAX / 2
}

/// Ticks elapsed from `older` to `newer`, zero if `newer` is actually behind.
pub fn ticks_in_between(newer: Tick, older: Tick) -> u64 {
    if is_newer(older, newer) {
        0
    } else {
        newer.wrapping_sub(older)
    }
}

pub fn ticks_to_millis(ticks: u64) -> u64 {
    ticks / TICKS_PER_MS
}

pub fn millis_to_ticks(millis: u64) -> u64 {
    millis * TICKS_PER_MS
}

/// Per-connection tick source. Backed by `tokio::time::Instant` so tests running on a paused
///  runtime drive the engine's timers in virtual time.
#[derive(Debug, Clone)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Clock {
        Clock {
            epoch: Instant::now(),
        }
    }

    pub fn now(&self) -> Tick {
        let elapsed = self.epoch.elapsed();
        elapsed.as_secs() * TICKS_PER_SEC + u64::from(elapsed.subsec_micros())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}
