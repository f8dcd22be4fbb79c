//! Press-gesture classification
//! A directional control reports only press-in and press-out timestamps;
//! this machine turns them into the short/long/release intents the session
//! coordinator consumes. Keeping it pure makes the long-press threshold
//! testable away from any UI toolkit.

use std::time::{Duration, Instant};

use crate::core::bluetooth::constants::LONG_PRESS_THRESHOLD;

/// How a finished or ongoing press should be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressKind {
    /// Released before the threshold: one short step.
    Short,
    /// Held past the threshold: assert continuously until release.
    Long,
    /// The control was let go after a long press.
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GestureState {
    Idle,
    Pressed { since: Instant },
    /// The threshold passed while still held; a long dispatch is active.
    LongFired,
}

/// State machine: `Idle -> Pressed -> {ShortFired | LongFired} -> Idle`.
///
/// `press_down` starts a gesture; `poll` reports the threshold crossing
/// while the control is still held; `press_up` closes the gesture.
#[derive(Debug)]
pub struct PressGesture {
    state: GestureState,
    threshold: Duration,
}

impl PressGesture {
    pub fn new() -> Self {
        Self::with_threshold(LONG_PRESS_THRESHOLD)
    }

    pub fn with_threshold(threshold: Duration) -> Self {
        Self {
            state: GestureState::Idle,
            threshold,
        }
    }

    /// The control went down. A press while already pressed is ignored
    /// (bounce from the toolkit), so one physical press fires exactly one
    /// dispatch.
    pub fn press_down(&mut self, now: Instant) {
        if matches!(self.state, GestureState::Idle) {
            self.state = GestureState::Pressed { since: now };
        }
    }

    /// Checks whether the held press crossed the long-press threshold.
    /// Returns `Some(PressKind::Long)` exactly once per gesture.
    pub fn poll(&mut self, now: Instant) -> Option<PressKind> {
        if let GestureState::Pressed { since } = self.state {
            if now.duration_since(since) >= self.threshold {
                self.state = GestureState::LongFired;
                return Some(PressKind::Long);
            }
        }
        None
    }

    /// The control went up. A press that never crossed the threshold is a
    /// short press; one that did yields a release for the active long
    /// dispatch.
    pub fn press_up(&mut self, _now: Instant) -> Option<PressKind> {
        match self.state {
            GestureState::Pressed { .. } => {
                // No Long was ever reported for this gesture, so even a slow
                // release counts as a single short step.
                self.state = GestureState::Idle;
                Some(PressKind::Short)
            }
            GestureState::LongFired => {
                self.state = GestureState::Idle;
                Some(PressKind::Release)
            }
            GestureState::Idle => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, GestureState::Idle)
    }
}

impl Default for PressGesture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: Duration = Duration::from_millis(600);

    #[test]
    fn quick_tap_is_short() {
        let mut gesture = PressGesture::with_threshold(THRESHOLD);
        let t0 = Instant::now();
        gesture.press_down(t0);
        assert_eq!(
            gesture.press_up(t0 + Duration::from_millis(150)),
            Some(PressKind::Short)
        );
        assert!(gesture.is_idle());
    }

    #[test]
    fn held_press_fires_long_then_release() {
        let mut gesture = PressGesture::with_threshold(THRESHOLD);
        let t0 = Instant::now();
        gesture.press_down(t0);
        assert_eq!(gesture.poll(t0 + Duration::from_millis(300)), None);
        assert_eq!(
            gesture.poll(t0 + Duration::from_millis(600)),
            Some(PressKind::Long)
        );
        // Long fires once, not on every poll.
        assert_eq!(gesture.poll(t0 + Duration::from_millis(900)), None);
        assert_eq!(
            gesture.press_up(t0 + Duration::from_millis(1000)),
            Some(PressKind::Release)
        );
        assert!(gesture.is_idle());
    }

    #[test]
    fn one_press_one_dispatch() {
        let mut gesture = PressGesture::with_threshold(THRESHOLD);
        let t0 = Instant::now();
        gesture.press_down(t0);
        // Toolkit bounce: a second press-in while held changes nothing.
        gesture.press_down(t0 + Duration::from_millis(50));
        let mut fired = 0;
        for ms in (0..1200).step_by(100) {
            if gesture.poll(t0 + Duration::from_millis(ms)).is_some() {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
    }

    #[test]
    fn release_without_press_is_ignored() {
        let mut gesture = PressGesture::with_threshold(THRESHOLD);
        assert_eq!(gesture.press_up(Instant::now()), None);
    }
}
