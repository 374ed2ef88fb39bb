use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use super::assembler::AssemblerStats;
use super::parser::ParserStats;

/// Run statistics shared between the reactor thread and the host.
///
/// Parser and assembler tallies are published as absolute values by the reactor after
/// each read; connection level events are counted directly.
#[derive(Debug)]
pub struct ReceiverStats {
    microslices: AtomicU64,
    fragments: AtomicU64,
    version_errors: AtomicU64,
    version_changes: AtomicU64,
    sequence_mismatches: AtomicU64,
    checksum_mismatches: AtomicU64,
    missing_checksums: AtomicU64,
    dropped_microslices: AtomicU64,
    millislices: AtomicU64,
    bytes_emitted: AtomicU64,
    overflow_drops: AtomicU64,
    discarded_millislices: AtomicU64,
    window_resyncs: AtomicU64,
    connections: AtomicU64,
    framing_errors: AtomicU64,
    bytes_received: AtomicU64,
    empty_low_water: AtomicUsize,
}

impl Default for ReceiverStats {
    fn default() -> Self {
        Self {
            microslices: AtomicU64::new(0),
            fragments: AtomicU64::new(0),
            version_errors: AtomicU64::new(0),
            version_changes: AtomicU64::new(0),
            sequence_mismatches: AtomicU64::new(0),
            checksum_mismatches: AtomicU64::new(0),
            missing_checksums: AtomicU64::new(0),
            dropped_microslices: AtomicU64::new(0),
            millislices: AtomicU64::new(0),
            bytes_emitted: AtomicU64::new(0),
            overflow_drops: AtomicU64::new(0),
            discarded_millislices: AtomicU64::new(0),
            window_resyncs: AtomicU64::new(0),
            connections: AtomicU64::new(0),
            framing_errors: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            empty_low_water: AtomicUsize::new(usize::MAX),
        }
    }
}

/// Plain copy of the counters at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub microslices: u64,
    pub fragments: u64,
    pub version_errors: u64,
    pub version_changes: u64,
    pub sequence_mismatches: u64,
    pub checksum_mismatches: u64,
    /// Microslices that arrived without a checksum word
    pub missing_checksums: u64,
    pub dropped_microslices: u64,
    pub millislices: u64,
    pub bytes_emitted: u64,
    pub overflow_drops: u64,
    pub discarded_millislices: u64,
    /// Times the millislice window was re-anchored after a clock jump
    pub window_resyncs: u64,
    pub connections: u64,
    pub framing_errors: u64,
    pub bytes_received: u64,
    /// Fewest empty buffers seen by the consumer, None if never recorded
    pub empty_low_water: Option<usize>,
}

impl ReceiverStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn publish(&self, parser: &ParserStats, assembler: &AssemblerStats) {
        self.microslices.store(parser.microslices, Ordering::Relaxed);
        self.fragments.store(parser.fragments, Ordering::Relaxed);
        self.version_errors
            .store(parser.version_errors, Ordering::Relaxed);
        self.version_changes
            .store(parser.version_changes, Ordering::Relaxed);
        self.sequence_mismatches
            .store(parser.sequence_mismatches, Ordering::Relaxed);
        self.checksum_mismatches
            .store(parser.checksum_mismatches, Ordering::Relaxed);
        self.missing_checksums
            .store(parser.missing_checksums, Ordering::Relaxed);
        self.dropped_microslices
            .store(parser.dropped, Ordering::Relaxed);
        self.millislices
            .store(assembler.millislices, Ordering::Relaxed);
        self.bytes_emitted
            .store(assembler.bytes_emitted, Ordering::Relaxed);
        self.overflow_drops
            .store(assembler.overflow_drops, Ordering::Relaxed);
        self.discarded_millislices
            .store(assembler.discarded_millislices, Ordering::Relaxed);
        self.window_resyncs
            .store(assembler.window_resyncs, Ordering::Relaxed);
    }

    pub(crate) fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Track the minimum number of empty buffers the consumer has observed
    pub fn record_empty_level(&self, available: usize) {
        self.empty_low_water.fetch_min(available, Ordering::Relaxed);
    }

    /// Zero everything at the start of a run
    pub fn reset(&self) {
        self.publish(&ParserStats::default(), &AssemblerStats::default());
        self.connections.store(0, Ordering::Relaxed);
        self.framing_errors.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.empty_low_water.store(usize::MAX, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let low_water = self.empty_low_water.load(Ordering::Relaxed);
        StatsSnapshot {
            microslices: self.microslices.load(Ordering::Relaxed),
            fragments: self.fragments.load(Ordering::Relaxed),
            version_errors: self.version_errors.load(Ordering::Relaxed),
            version_changes: self.version_changes.load(Ordering::Relaxed),
            sequence_mismatches: self.sequence_mismatches.load(Ordering::Relaxed),
            checksum_mismatches: self.checksum_mismatches.load(Ordering::Relaxed),
            missing_checksums: self.missing_checksums.load(Ordering::Relaxed),
            dropped_microslices: self.dropped_microslices.load(Ordering::Relaxed),
            millislices: self.millislices.load(Ordering::Relaxed),
            bytes_emitted: self.bytes_emitted.load(Ordering::Relaxed),
            overflow_drops: self.overflow_drops.load(Ordering::Relaxed),
            discarded_millislices: self.discarded_millislices.load(Ordering::Relaxed),
            window_resyncs: self.window_resyncs.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            empty_low_water: (low_water != usize::MAX).then_some(low_water),
        }
    }
}

impl StatsSnapshot {
    /// Total protocol violations seen, all of which were logged and tolerated
    pub fn violations(&self) -> u64 {
        self.version_errors
            + self.sequence_mismatches
            + self.checksum_mismatches
            + self.dropped_microslices
            + self.framing_errors
    }

    /// Log the end of run summary with rates over `elapsed`
    pub fn log_summary(&self, elapsed: Duration) {
        let seconds = elapsed.as_secs_f64();
        let rate = |count: u64| {
            if seconds > 0.0 {
                count as f64 / seconds
            } else {
                0.0
            }
        };
        log::info!(
            "Received {} microslices ({} fragments) in {:.2} s, {:.1} Hz",
            self.microslices,
            self.fragments,
            seconds,
            rate(self.microslices)
        );
        log::info!(
            "Emitted {} millislices totalling {} ({}/s), {:.1} Hz",
            self.millislices,
            human_bytes::human_bytes(self.bytes_emitted as f64),
            human_bytes::human_bytes(rate(self.bytes_emitted)),
            rate(self.millislices)
        );
        if self.violations() > 0 || self.overflow_drops > 0 {
            log::warn!(
                "Protocol violations: {} version, {} sequence, {} checksum, {} dropped, {} framing; {} buffer overflows",
                self.version_errors,
                self.sequence_mismatches,
                self.checksum_mismatches,
                self.dropped_microslices,
                self.framing_errors,
                self.overflow_drops
            );
        }
        if self.missing_checksums > 0 {
            log::info!(
                "{} microslices arrived without a checksum word",
                self.missing_checksums
            );
        }
        if self.window_resyncs > 0 {
            log::warn!(
                "Millislice window re-anchored {} times after clock jumps",
                self.window_resyncs
            );
        }
        if let Some(low_water) = self.empty_low_water {
            log::info!("Empty buffer queue low water mark: {low_water}");
        }
    }
}
