use std::ops::Range;

use super::buffer_pool::{BufferPool, RawBuffer};
use super::error::AssemblerError;
use super::microslice::{contains_timestamp, Microslice, PayloadCounts};
use super::millislice::MillisliceMetadata;
use super::time_window::{split_words, Tick, TimeWindow};

/// Reframed microslice units waiting to be written at the start of the next millislice
#[derive(Debug, Default)]
struct Carry {
    bytes: Vec<u8>,
    counts: PayloadCounts,
    microslices: u32,
    complete_microslices: u32,
}

impl Carry {
    fn push(&mut self, ms: &Microslice, words: Range<usize>) -> Result<(), AssemblerError> {
        ms.write_unit(words.clone(), &mut self.bytes)?;
        self.counts.add(&PayloadCounts::from_words(&ms.words[words.clone()]));
        self.microslices += 1;
        if contains_timestamp(&ms.words[words]) {
            self.complete_microslices += 1;
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.bytes.clear();
        self.counts = PayloadCounts::default();
        self.microslices = 0;
        self.complete_microslices = 0;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub millislices: u64,
    pub bytes_emitted: u64,
    pub overflow_drops: u64,
    pub discarded_millislices: u64,
    pub window_resyncs: u64,
}

/// MillisliceAssembler takes validated microslices and packs them into fixed width,
/// overlapping millislices.
///
/// Each millislice is one RawBuffer from the pool. A microslice is written as one or more
/// units (the original header with a rewritten block size, followed by payload words) so a
/// consumer can walk the buffer with a [`MillisliceReader`](super::millislice::MillisliceReader).
/// When a payload word crosses the current window boundary the buffer is stamped and
/// handed to the filled queue, and the words past the boundary continue in the next
/// millislice, behind a copy of the previous window's overlap region.
#[derive(Debug)]
pub struct MillisliceAssembler {
    pool: BufferPool,
    width: u32,
    overlap_width: u32,
    window: Option<TimeWindow>,
    current: Option<RawBuffer>,
    counts: PayloadCounts,
    microslices: u32,
    complete_microslices: u32,
    next_overlap: Carry,
    pending_overlap: Carry,
    sequence_id: u16,
    stats: AssemblerStats,
}

impl MillisliceAssembler {
    /// Widths are expected to be validated by the configuration already
    pub fn new(pool: BufferPool, width: u32, overlap_width: u32) -> Self {
        Self {
            pool,
            width,
            overlap_width,
            window: None,
            current: None,
            counts: PayloadCounts::default(),
            microslices: 0,
            complete_microslices: 0,
            next_overlap: Carry::default(),
            pending_overlap: Carry::default(),
            sequence_id: 0,
            stats: AssemblerStats::default(),
        }
    }

    pub fn window(&self) -> Option<&TimeWindow> {
        self.window.as_ref()
    }

    pub fn stats(&self) -> &AssemblerStats {
        &self.stats
    }

    /// True while a buffer is being filled
    pub fn is_filling(&self) -> bool {
        self.current.is_some()
    }

    /// Place a microslice, emitting every millislice it completes. Returns how many were
    /// emitted. A pool error is fatal; the caller should stop feeding data.
    pub fn add_microslice(&mut self, ms: &Microslice) -> Result<usize, AssemblerError> {
        if self.window.is_none() {
            if let Some(first_tick) = ms.first_tick() {
                let window = TimeWindow::starting_at(first_tick, self.width, self.overlap_width);
                log::debug!(
                    "First payload tick {} sets the initial millislice boundary to {}",
                    first_tick,
                    window.boundary
                );
                self.window = Some(window);
            }
        }

        let mut emitted = 0;
        if let (Some(window), Some(first_tick)) = (self.window, ms.first_tick()) {
            // Ticks never run backwards within a connection, so data before the open
            // window means the clock moved more than half the rollover since the last word
            if first_tick.distance_from(window.start()) < 0 {
                emitted += self.resync(&window, first_tick)?;
            }
        }

        let mut start = 0;
        loop {
            let window = match self.window {
                Some(w) => w,
                None => {
                    // No tick seen yet, nothing to split against
                    self.write_part(ms, start..ms.words.len())?;
                    return Ok(emitted);
                }
            };

            let split = split_words(&ms.words, start..ms.words.len(), &window);
            // A dropped part must not reappear in the next slice through the overlap copy
            let kept = self.write_part(ms, split.kept())?;
            if kept && !split.overlap.is_empty() {
                self.next_overlap.push(ms, split.overlap.clone())?;
            }
            if !split.crosses_boundary() {
                return Ok(emitted);
            }

            log::trace!(
                "Microslice {} crosses boundary {} with {} words remaining",
                ms.header.sequence_id,
                window.boundary,
                split.remainder.len()
            );
            self.finish_millislice(&window)?;
            emitted += 1;
            if let Some(w) = self.window.as_mut() {
                w.advance();
            }
            start = split.remainder.start;
        }
    }

    /// Close the open millislice and anchor a new window on `tick`. Overlap from the old
    /// window is not carried since the new one does not follow it.
    fn resync(&mut self, window: &TimeWindow, tick: Tick) -> Result<usize, AssemblerError> {
        log::warn!(
            "Payload tick {} lies before the open millislice window starting at {}; the clock jumped by more than half the rollover, re-anchoring",
            tick,
            window.start()
        );
        let emitted = if self.current.is_some() {
            self.finish_millislice(window)?;
            1
        } else {
            0
        };
        self.next_overlap.clear();
        self.pending_overlap.clear();
        self.window = Some(TimeWindow::starting_at(tick, self.width, self.overlap_width));
        self.stats.window_resyncs += 1;
        Ok(emitted)
    }

    /// Return the partially filled buffer to the pool without emitting it and forget the
    /// rolling window. Used on stop and on connection loss.
    pub fn discard_in_flight(&mut self) {
        if let Some(buffer) = self.current.take() {
            log::debug!(
                "Discarding partially filled millislice with {} microslices ({})",
                self.microslices,
                human_bytes::human_bytes(buffer.len() as f64)
            );
            self.stats.discarded_millislices += 1;
            if let Err(e) = self.pool.commit_empty(buffer) {
                log::error!("Could not return discarded buffer to the pool: {e}");
            }
        }
        self.reset_slice_counters();
        self.next_overlap.clear();
        self.pending_overlap.clear();
        self.window = None;
    }

    /// Full reset at the start of a run
    pub fn reset(&mut self) {
        self.discard_in_flight();
        self.sequence_id = 0;
        self.stats = AssemblerStats::default();
    }

    fn reset_slice_counters(&mut self) {
        self.counts = PayloadCounts::default();
        self.microslices = 0;
        self.complete_microslices = 0;
    }

    /// Make sure there is a buffer to write into, seeding a new one with the carried overlap
    fn ensure_buffer(&mut self) -> Result<(), AssemblerError> {
        if self.current.is_some() {
            return Ok(());
        }
        let mut buffer = self.pool.acquire()?;
        self.reset_slice_counters();
        let carry = &self.pending_overlap;
        if !carry.bytes.is_empty() {
            if carry.bytes.len() <= buffer.remaining() {
                buffer.data_mut().extend_from_slice(&carry.bytes);
                self.counts.add(&carry.counts);
                self.microslices += carry.microslices;
                self.complete_microslices += carry.complete_microslices;
            } else {
                log::error!(
                    "Overlap of {} does not fit in a raw buffer of {}; dropping it",
                    human_bytes::human_bytes(carry.bytes.len() as f64),
                    human_bytes::human_bytes(buffer.capacity() as f64)
                );
                self.stats.overflow_drops += 1;
            }
        }
        self.pending_overlap.clear();
        self.current = Some(buffer);
        Ok(())
    }

    /// Write a run of words as one unit into the current buffer. Returns false when
    /// nothing was written.
    fn write_part(&mut self, ms: &Microslice, words: Range<usize>) -> Result<bool, AssemblerError> {
        if words.is_empty() {
            return Ok(false);
        }
        self.ensure_buffer()?;
        let size = ms.unit_size(words.clone());
        let buffer = match self.current.as_mut() {
            Some(b) => b,
            None => return Ok(false),
        };
        if size > buffer.remaining() {
            log::error!(
                "Microslice {} ({} bytes) overflows the millislice buffer ({} bytes free); dropping it",
                ms.header.sequence_id,
                size,
                buffer.remaining()
            );
            self.stats.overflow_drops += 1;
            return Ok(false);
        }
        ms.write_unit(words.clone(), buffer.data_mut())?;
        self.counts.add(&PayloadCounts::from_words(&ms.words[words.clone()]));
        self.microslices += 1;
        if contains_timestamp(&ms.words[words]) {
            self.complete_microslices += 1;
        }
        Ok(true)
    }

    /// Stamp the current buffer and hand it to the filled queue
    fn finish_millislice(&mut self, window: &TimeWindow) -> Result<(), AssemblerError> {
        self.ensure_buffer()?;
        let mut buffer = match self.current.take() {
            Some(b) => b,
            None => return Ok(()),
        };
        let metadata = MillisliceMetadata {
            size: buffer.len(),
            sequence_id: self.sequence_id,
            end_timestamp: window.boundary,
            width_ticks: window.width(),
            overlap_ticks: window.overlap_width(),
            payload_counts: self.counts,
            microslice_count: self.microslices,
            complete_microslice_count: self.complete_microslices,
        };
        buffer.set_metadata(metadata);
        log::debug!(
            "Millislice {} complete with {} microslices ({} complete), {} payloads, total size {} bytes",
            metadata.sequence_id,
            metadata.microslice_count,
            metadata.complete_microslice_count,
            metadata.payload_count(),
            metadata.size
        );
        self.pool.commit_filled(buffer)?;

        self.sequence_id = self.sequence_id.wrapping_add(1);
        self.stats.millislices += 1;
        self.stats.bytes_emitted += metadata.size as u64;
        self.reset_slice_counters();
        self.pending_overlap = std::mem::take(&mut self.next_overlap);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PoolError;
    use crate::microslice::{decode_payload, encode_word, MicrosliceHeader, PayloadType};
    use crate::millislice::MillisliceReader;
    use crate::time_window::Tick;
    use std::time::Duration;

    /// Counter words at each tick, the last one replaced by a timestamp word
    fn microslice(sequence_id: u8, ticks: &[u32]) -> Microslice {
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
        Microslice {
            header: MicrosliceHeader::new(3, sequence_id, (4 + payload.len()) as u16),
            payload,
            words,
        }
    }

    fn pool(capacity: usize, size: usize) -> BufferPool {
        BufferPool::new(capacity, size, 1, Duration::from_millis(5))
    }

    #[test]
    fn test_overlap_and_remainder_seed_next_slice() {
        let pool = pool(4, 4096);
        let mut asm = MillisliceAssembler::new(pool.clone(), 40, 10);
        assert_eq!(asm.add_microslice(&microslice(0, &[0, 5])).unwrap(), 0);
        assert_eq!(asm.window().unwrap().boundary, Tick::new(40));
        assert_eq!(asm.add_microslice(&microslice(1, &[10, 20])).unwrap(), 0);
        assert_eq!(asm.add_microslice(&microslice(2, &[30, 35, 45, 50])).unwrap(), 1);

        let first = pool.retrieve_filled(Duration::from_millis(10)).unwrap();
        let meta = *first.metadata().unwrap();
        assert_eq!(meta.sequence_id, 0);
        assert_eq!(meta.end_timestamp, Tick::new(40));
        assert_eq!(meta.width_ticks, 40);
        assert_eq!(meta.overlap_ticks, 10);
        assert_eq!(meta.microslice_count, 3);
        assert_eq!(meta.complete_microslice_count, 2);
        assert_eq!(meta.payload_count(), 6);
        assert_eq!(meta.size, first.len());
        let units: Vec<_> = MillisliceReader::new(first.data())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(units.len(), 3);
        assert_eq!(units[2].header.sequence_id, 2);
        assert_eq!(units[2].words.len(), 2);

        // The next window closes at 80
        assert_eq!(asm.add_microslice(&microslice(3, &[90])).unwrap(), 1);
        let second = pool.retrieve_filled(Duration::from_millis(10)).unwrap();
        let meta = *second.metadata().unwrap();
        assert_eq!(meta.sequence_id, 1);
        assert_eq!(meta.end_timestamp, Tick::new(80));
        assert_eq!(meta.microslice_count, 2);
        assert_eq!(meta.complete_microslice_count, 1);
        let units: Vec<_> = MillisliceReader::new(second.data())
            .collect::<Result<_, _>>()
            .unwrap();
        // overlap copy first, then the remainder
        let ticks: Vec<u32> = units
            .iter()
            .flat_map(|u| u.words.iter().map(|w| w.raw_tick))
            .collect();
        assert_eq!(ticks, vec![30, 35, 45, 50]);
        assert_eq!(&units[0].payload[..], &first.data()[first.len() - 32..]);
    }

    #[test]
    fn test_microslice_spanning_several_windows() {
        let pool = pool(4, 4096);
        let mut asm = MillisliceAssembler::new(pool.clone(), 10, 0);
        assert_eq!(asm.add_microslice(&microslice(0, &[0, 25])).unwrap(), 2);
        assert_eq!(pool.filled_available(), 2);
        let first = pool.retrieve_filled(Duration::from_millis(10)).unwrap();
        let second = pool.retrieve_filled(Duration::from_millis(10)).unwrap();
        assert_eq!(first.metadata().unwrap().microslice_count, 1);
        // Nothing fell in [10, 20)
        assert!(second.is_empty());
        assert_eq!(second.metadata().unwrap().end_timestamp, Tick::new(20));
        assert_eq!(asm.window().unwrap().boundary, Tick::new(30));
    }

    #[test]
    fn test_boundary_wraparound() {
        let pool = pool(4, 4096);
        let mut asm = MillisliceAssembler::new(pool.clone(), 100, 0);
        let start = (1 << 28) - 150;
        asm.add_microslice(&microslice(0, &[start])).unwrap();
        assert_eq!(asm.window().unwrap().boundary, Tick::new((1 << 28) - 50));
        // 20 ticks after rollover is later than the boundary, one before the boundary is not
        assert_eq!(asm.add_microslice(&microslice(1, &[(1 << 28) - 51])).unwrap(), 0);
        assert_eq!(asm.add_microslice(&microslice(2, &[20])).unwrap(), 1);
        assert_eq!(asm.window().unwrap().boundary, Tick::new(50));
    }

    #[test]
    fn test_discard_returns_buffer() {
        let pool = pool(2, 4096);
        let mut asm = MillisliceAssembler::new(pool.clone(), 100, 10);
        asm.add_microslice(&microslice(0, &[1, 2])).unwrap();
        assert!(asm.is_filling());
        assert_eq!(pool.empty_available(), 1);
        asm.discard_in_flight();
        assert!(!asm.is_filling());
        assert!(asm.window().is_none());
        assert_eq!(pool.empty_available(), 2);
        assert_eq!(pool.filled_available(), 0);
        assert_eq!(asm.stats().discarded_millislices, 1);
    }

    #[test]
    fn test_overflowing_unit_is_dropped() {
        let pool = pool(2, 24);
        let mut asm = MillisliceAssembler::new(pool.clone(), 100, 0);
        // one 16 byte unit fits, a second does not
        asm.add_microslice(&microslice(0, &[1])).unwrap();
        asm.add_microslice(&microslice(1, &[2])).unwrap();
        assert_eq!(asm.stats().overflow_drops, 1);
        asm.add_microslice(&microslice(2, &[200])).unwrap();
        let buffer = pool.retrieve_filled(Duration::from_millis(10)).unwrap();
        assert_eq!(buffer.metadata().unwrap().microslice_count, 1);
    }

    #[test]
    fn test_dropped_unit_is_not_carried_as_overlap() {
        let pool = pool(3, 24);
        let mut asm = MillisliceAssembler::new(pool.clone(), 100, 50);
        asm.add_microslice(&microslice(0, &[1])).unwrap();
        // lands in the overlap region of a full buffer
        asm.add_microslice(&microslice(1, &[60])).unwrap();
        assert_eq!(asm.stats().overflow_drops, 1);
        assert_eq!(asm.add_microslice(&microslice(2, &[120])).unwrap(), 1);
        assert_eq!(asm.add_microslice(&microslice(3, &[300])).unwrap(), 1);

        let first = pool.retrieve_filled(Duration::from_millis(10)).unwrap();
        assert_eq!(first.metadata().unwrap().microslice_count, 1);
        let second = pool.retrieve_filled(Duration::from_millis(10)).unwrap();
        let meta = *second.metadata().unwrap();
        assert_eq!(meta.microslice_count, 1);
        let ids: Vec<u8> = MillisliceReader::new(second.data())
            .map(|u| u.unwrap().header.sequence_id)
            .collect();
        assert_eq!(ids, vec![2]);
        assert_eq!(asm.stats().overflow_drops, 1);
    }

    #[test]
    fn test_long_silence_resyncs_window() {
        let pool = pool(4, 4096);
        let mut asm = MillisliceAssembler::new(pool.clone(), 100, 20);
        asm.add_microslice(&microslice(0, &[0])).unwrap();
        asm.add_microslice(&microslice(1, &[90])).unwrap();
        // more than half the rollover later, which reads as earlier than the window
        let late = (1 << 27) + 60;
        assert!(Tick::new(late).distance_from(Tick::new(0)) < 0);
        assert_eq!(asm.add_microslice(&microslice(2, &[late])).unwrap(), 1);
        assert_eq!(asm.stats().window_resyncs, 1);
        assert_eq!(asm.window().unwrap().boundary, Tick::new(late + 100));

        let closed = pool.retrieve_filled(Duration::from_millis(10)).unwrap();
        let meta = *closed.metadata().unwrap();
        assert_eq!(meta.end_timestamp, Tick::new(100));
        assert_eq!(meta.microslice_count, 2);

        // The new window carries no overlap from the old one
        asm.add_microslice(&microslice(3, &[late + 150])).unwrap();
        let next = pool.retrieve_filled(Duration::from_millis(10)).unwrap();
        let ids: Vec<u8> = MillisliceReader::new(next.data())
            .map(|u| u.unwrap().header.sequence_id)
            .collect();
        assert_eq!(ids, vec![2]);
        assert_eq!(next.metadata().unwrap().sequence_id, 1);
    }

    #[test]
    fn test_pool_exhaustion_is_fatal() {
        let pool = pool(1, 4096);
        let mut asm = MillisliceAssembler::new(pool.clone(), 10, 0);
        asm.add_microslice(&microslice(0, &[0])).unwrap();
        match asm.add_microslice(&microslice(1, &[15])) {
            Err(AssemblerError::Pool(PoolError::Exhausted(_))) => (),
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }
}
