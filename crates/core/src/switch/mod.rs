//! Debounced state switching.
//!
//! [`SwitchController`] turns a dense stream of classified indices into
//! sparse [`SwitchEvent`]s. Two gates apply in order: the [`SwitchPolicy`]
//! decides whether a candidate is worth acting on, then the cooldown
//! suppresses any switch that follows the previous one too closely. The very
//! first accepted index after `Uninitialized` bypasses the cooldown.

use std::time::{Duration, Instant};

/// Minimum time between two accepted switches.
pub const SWITCH_COOLDOWN: Duration = Duration::from_millis(50);

/// A transition the loop must apply to the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchEvent {
    /// `None` for the very first switch, there is nothing to hide yet.
    pub previous: Option<usize>,
    pub next: usize,
    pub at: Instant,
}

/// Smoothing strategy consulted before the cooldown gate.
pub trait SwitchPolicy: Send {
    /// Returns whether `candidate` may replace `current`. Only called when
    /// the two differ.
    fn admit(&mut self, current: Option<usize>, candidate: usize) -> bool;

    /// Called whenever the controller accepts a switch or resets.
    fn settle(&mut self) {}
}

/// Every differing candidate is admitted.
#[derive(Debug, Default, Clone, Copy)]
pub struct Immediate;

impl SwitchPolicy for Immediate {
    fn admit(&mut self, _current: Option<usize>, _candidate: usize) -> bool {
        true
    }
}

/// A candidate must be seen on `frames` consecutive classifications.
#[derive(Debug, Clone)]
pub struct Sustain {
    frames: u32,
    candidate: Option<usize>,
    seen: u32,
}

impl Sustain {
    pub fn new(frames: u32) -> Self {
        Self {
            frames: frames.max(1),
            candidate: None,
            seen: 0,
        }
    }
}

impl SwitchPolicy for Sustain {
    fn admit(&mut self, current: Option<usize>, candidate: usize) -> bool {
        // Nothing is shown yet, waiting would only delay the first frame.
        if current.is_none() {
            return true;
        }
        if self.candidate == Some(candidate) {
            self.seen = self.seen.saturating_add(1);
        } else {
            self.candidate = Some(candidate);
            self.seen = 1;
        }
        self.seen >= self.frames
    }

    fn settle(&mut self) {
        self.candidate = None;
        self.seen = 0;
    }
}

/// Builds the policy matching a configured sustain length.
pub fn policy_for(sustain_frames: u32) -> Box<dyn SwitchPolicy> {
    if sustain_frames <= 1 {
        Box::new(Immediate)
    } else {
        Box::new(Sustain::new(sustain_frames))
    }
}

/// Cooldown-gated state machine over `{Uninitialized} ∪ {0..N-1}`.
pub struct SwitchController {
    cooldown: Duration,
    current: Option<usize>,
    last_switch: Option<Instant>,
    policy: Box<dyn SwitchPolicy>,
}

impl SwitchController {
    /// Controller with the [`Immediate`] policy.
    pub fn new(cooldown: Duration) -> Self {
        Self::with_policy(cooldown, Box::new(Immediate))
    }

    /// Controller gated by `policy` before the cooldown.
    pub fn with_policy(cooldown: Duration, policy: Box<dyn SwitchPolicy>) -> Self {
        Self {
            cooldown,
            current: None,
            last_switch: None,
            policy,
        }
    }

    /// Index currently shown, `None` while uninitialized.
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// Feeds one classification and returns the switch to perform, if any.
    pub fn apply(&mut self, next: usize, now: Instant) -> Option<SwitchEvent> {
        if self.current == Some(next) {
            self.policy.settle();
            return None;
        }
        if !self.policy.admit(self.current, next) {
            return None;
        }
        if let (Some(_), Some(last)) = (self.current, self.last_switch) {
            if now.saturating_duration_since(last) < self.cooldown {
                return None;
            }
        }

        let event = SwitchEvent {
            previous: self.current,
            next,
            at: now,
        };
        self.current = Some(next);
        self.last_switch = Some(now);
        self.policy.settle();
        Some(event)
    }

    /// Returns to `Uninitialized`.
    pub fn reset(&mut self) {
        self.current = None;
        self.last_switch = None;
        self.policy.settle();
    }
}

impl Default for SwitchController {
    fn default() -> Self {
        Self::new(SWITCH_COOLDOWN)
    }
}

impl std::fmt::Debug for SwitchController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchController")
            .field("cooldown", &self.cooldown)
            .field("current", &self.current)
            .field("last_switch", &self.last_switch)
            .finish()
    }
}
