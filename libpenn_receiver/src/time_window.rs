use std::fmt;
use std::ops::Range;

use super::constants::{TICK_HALF_RANGE, TICK_MASK, TICK_ROLLOVER};
use super::microslice::{PayloadCounts, PayloadWord};

/// A 28-bit board clock value. All arithmetic wraps at 2^28 and ordering is only
/// meaningful between ticks less than half the rollover apart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Tick(u32);

impl Tick {
    pub fn new(raw: u32) -> Self {
        Tick(raw & TICK_MASK)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn wrapping_add(self, ticks: u32) -> Self {
        Tick(self.0.wrapping_add(ticks) & TICK_MASK)
    }

    pub fn wrapping_sub(self, ticks: u32) -> Self {
        Tick(self.0.wrapping_sub(ticks) & TICK_MASK)
    }

    /// Signed distance from `other` to `self`, in [-2^27, 2^27)
    pub fn distance_from(self, other: Tick) -> i32 {
        let diff = self.0.wrapping_sub(other.0) & TICK_MASK;
        if diff >= TICK_HALF_RANGE {
            diff as i32 - TICK_ROLLOVER as i32
        } else {
            diff as i32
        }
    }

    pub fn is_at_or_after(self, other: Tick) -> bool {
        self.distance_from(other) >= 0
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#09x}", self.0)
    }
}

/// The millislice currently being filled: it ends at `boundary`, and everything at or after
/// `overlap` is duplicated into the start of the next millislice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub boundary: Tick,
    pub overlap: Tick,
    width: u32,
    overlap_width: u32,
}

impl TimeWindow {
    /// The first window of a run is anchored on the first tick seen, there is no external epoch
    pub fn starting_at(first_tick: Tick, width: u32, overlap_width: u32) -> Self {
        Self::ending_at(first_tick.wrapping_add(width), width, overlap_width)
    }

    pub fn ending_at(boundary: Tick, width: u32, overlap_width: u32) -> Self {
        Self {
            boundary,
            overlap: boundary.wrapping_sub(overlap_width),
            width,
            overlap_width,
        }
    }

    /// Move on to the next window
    pub fn advance(&mut self) {
        self.boundary = self.boundary.wrapping_add(self.width);
        self.overlap = self.boundary.wrapping_sub(self.overlap_width);
    }

    /// First tick that belongs to this window
    pub fn start(&self) -> Tick {
        self.boundary.wrapping_sub(self.width)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn overlap_width(&self) -> u32 {
        self.overlap_width
    }
}

/// How a run of payload words falls relative to a window.
///
/// The three word ranges are contiguous and cover the input: `current` and `overlap` stay
/// in the slice being filled, `overlap` is also copied into the next slice and `remainder`
/// moves to the next slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub current: Range<usize>,
    pub overlap: Range<usize>,
    pub remainder: Range<usize>,
    pub current_counts: PayloadCounts,
    pub overlap_counts: PayloadCounts,
    pub remainder_counts: PayloadCounts,
}

impl Split {
    pub fn crosses_boundary(&self) -> bool {
        !self.remainder.is_empty()
    }

    /// Words that belong to the slice being filled
    pub fn kept(&self) -> Range<usize> {
        self.current.start..self.overlap.end
    }
}

/// Find where the window boundary and the overlap start fall inside `words[range]`.
///
/// Words without a tick never open a new region; they follow whatever precedes them.
pub fn split_words(words: &[PayloadWord], range: Range<usize>, window: &TimeWindow) -> Split {
    let boundary_at = words[range.clone()]
        .iter()
        .position(|w| w.tick().is_some_and(|t| t.is_at_or_after(window.boundary)))
        .map(|i| range.start + i)
        .unwrap_or(range.end);

    let overlap_at = words[range.start..boundary_at]
        .iter()
        .position(|w| w.tick().is_some_and(|t| t.is_at_or_after(window.overlap)))
        .map(|i| range.start + i)
        .unwrap_or(boundary_at);

    Split {
        current: range.start..overlap_at,
        overlap: overlap_at..boundary_at,
        remainder: boundary_at..range.end,
        current_counts: PayloadCounts::from_words(&words[range.start..overlap_at]),
        overlap_counts: PayloadCounts::from_words(&words[overlap_at..boundary_at]),
        remainder_counts: PayloadCounts::from_words(&words[boundary_at..range.end]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::microslice::{decode_payload, encode_word, PayloadType};

    fn payload_with_ticks(ticks: &[u32]) -> (Vec<u8>, Vec<PayloadWord>) {
        let mut payload = Vec::new();
        for (i, tick) in ticks.iter().enumerate() {
            let kind = if i + 1 == ticks.len() {
                PayloadType::Timestamp
            } else {
                PayloadType::Counter
            };
            encode_word(kind, *tick, &[], &mut payload);
        }
        let words = decode_payload(&payload).unwrap();
        (payload, words)
    }

    #[test]
    fn test_tick_wraparound_ordering() {
        let before = Tick::new(TICK_ROLLOVER - 2);
        let after = Tick::new(3);
        assert!(after.is_at_or_after(before));
        assert!(!before.is_at_or_after(after));
        assert_eq!(after.distance_from(before), 5);
        assert_eq!(before.distance_from(after), -5);
        assert_eq!(before.wrapping_add(5), after);
        assert_eq!(after.wrapping_sub(5), before);
    }

    #[test]
    fn test_window_advance_wraps() {
        let width = 1000;
        let mut window = TimeWindow::ending_at(Tick::new(TICK_ROLLOVER - 1), width, 100);
        assert_eq!(window.overlap, Tick::new(TICK_ROLLOVER - 101));
        let old = window.boundary;
        window.advance();
        assert_eq!(
            window.boundary.value(),
            (old.value() + width) % TICK_ROLLOVER
        );
        assert_eq!(window.boundary, Tick::new(999));
        assert_eq!(window.overlap, Tick::new(899));
        assert_eq!(window.start(), Tick::new(TICK_ROLLOVER - 1));
    }

    #[test]
    fn test_first_window_anchored_on_first_tick() {
        let window = TimeWindow::starting_at(Tick::new(500), 64, 16);
        assert_eq!(window.boundary, Tick::new(564));
        assert_eq!(window.overlap, Tick::new(548));
        assert_eq!(window.start(), Tick::new(500));
    }

    #[test]
    fn test_split_partitions_payload() {
        let (payload, words) = payload_with_ticks(&[10, 20, 30, 40, 50]);
        let window = TimeWindow::ending_at(Tick::new(40), 40, 15);
        let split = split_words(&words, 0..words.len(), &window);
        assert_eq!(split.current, 0..2);
        assert_eq!(split.overlap, 2..3);
        assert_eq!(split.remainder, 3..5);
        assert!(split.crosses_boundary());
        assert_eq!(split.remainder_counts.timestamp, 1);

        // Conservation of bytes: every payload byte lands in exactly one region
        let bytes = |r: Range<usize>| -> usize { words[r].iter().map(|w| w.size()).sum() };
        assert_eq!(
            bytes(split.current.clone())
                + bytes(split.overlap.clone())
                + bytes(split.remainder.clone()),
            payload.len()
        );
    }

    #[test]
    fn test_split_across_rollover() {
        let near_end = TICK_ROLLOVER - 4;
        let (_, words) = payload_with_ticks(&[near_end, near_end + 2, 1, 5]);
        let window = TimeWindow::ending_at(Tick::new(2), 8, 4);
        let split = split_words(&words, 0..words.len(), &window);
        // overlap starts at rollover - 2, boundary at 2
        assert_eq!(split.current, 0..1);
        assert_eq!(split.overlap, 1..3);
        assert_eq!(split.remainder, 3..4);
    }

    #[test]
    fn test_split_without_crossing() {
        let (_, words) = payload_with_ticks(&[1, 2, 3]);
        let window = TimeWindow::ending_at(Tick::new(100), 100, 0);
        let split = split_words(&words, 0..words.len(), &window);
        assert_eq!(split.kept(), 0..3);
        assert!(split.overlap.is_empty());
        assert!(!split.crosses_boundary());
    }
}
