//! Cyclic frame-slot tracking.

/// Tracks which frame slot is being recorded.
///
/// Slots cycle through `0..frames_in_flight`. Every per-slot resource
/// elsewhere is indexed by [`FrameClock::current_slot`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameClock {
    frames_in_flight: usize,
    current: usize,
    previous: usize,
    frame_number: u64,
}

impl FrameClock {
    /// Create a clock starting at slot 0.
    ///
    /// `frames_in_flight` is clamped to at least one slot.
    pub fn new(frames_in_flight: usize) -> Self {
        let frames_in_flight = frames_in_flight.max(1);
        Self {
            frames_in_flight,
            current: 0,
            previous: frames_in_flight - 1,
            frame_number: 0,
        }
    }

    pub const fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub const fn current_slot(&self) -> usize {
        self.current
    }

    /// Slot used by the frame before the current one.
    pub const fn previous_slot(&self) -> usize {
        self.previous
    }

    /// Number of completed frames.
    pub const fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Move to the next slot once a frame completed.
    pub fn advance(&mut self) {
        self.previous = self.current;
        self.current = (self.current + 1) % self.frames_in_flight;
        self.frame_number += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_through_slots() {
        let mut clock = FrameClock::new(3);
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(clock.current_slot());
            clock.advance();
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(clock.frame_number(), 7);
    }

    #[test]
    fn previous_slot_trails_current() {
        let mut clock = FrameClock::new(3);
        for _ in 0..10 {
            assert_eq!(clock.previous_slot(), (clock.current_slot() + 2) % 3);
            clock.advance();
        }
    }

    #[test]
    fn single_slot_always_zero() {
        let mut clock = FrameClock::new(1);
        clock.advance();
        clock.advance();
        assert_eq!(clock.current_slot(), 0);
        assert_eq!(clock.previous_slot(), 0);
    }

    #[test]
    fn zero_frames_clamped_to_one() {
        let clock = FrameClock::new(0);
        assert_eq!(clock.frames_in_flight(), 1);
        assert_eq!(clock.current_slot(), 0);
    }
}
