use std::time::Duration;

use libpenn_receiver::assembler::MillisliceAssembler;
use libpenn_receiver::buffer_pool::{BufferPool, RawBuffer};
use libpenn_receiver::constants::{MAX_MICROSLICE_SIZE, MICROSLICE_FORMAT_VERSION, TICK_ROLLOVER};
use libpenn_receiver::emulator::build_microslice;
use libpenn_receiver::microslice::PayloadType;
use libpenn_receiver::millislice::{MillisliceMetadata, MillisliceReader};
use libpenn_receiver::parser::MicrosliceParser;
use libpenn_receiver::time_window::Tick;
use proptest::prelude::*;

const WIDTH: u32 = 64;
const OVERLAP: u32 = 16;

/// Ten 64 byte microslices, 16 ticks apart: counter, counter, self-test, timestamp and a
/// checksum word, with word ticks at +0, +4, +8 and +12.
fn scenario_stream(first_tick: u32) -> Vec<u8> {
    let mut stream = Vec::new();
    for i in 0..10u32 {
        let base = first_tick.wrapping_add(i * 16) % TICK_ROLLOVER;
        let tick = |k: u32| (base + k) % TICK_ROLLOVER;
        let words = vec![
            (PayloadType::Counter, tick(0), vec![i as u8; 12]),
            (PayloadType::Counter, tick(4), vec![0xA0 | i as u8; 12]),
            (PayloadType::SelfTest, tick(8), vec![0; 4]),
            (PayloadType::Timestamp, tick(12), (base as u64).to_be_bytes().to_vec()),
        ];
        let ms = build_microslice(MICROSLICE_FORMAT_VERSION, i as u8, &words, true).unwrap();
        assert_eq!(ms.len(), 64);
        stream.extend(ms);
    }
    stream
}

/// Run a stream through parser and assembler, delivering it in the given chunk sizes
fn assemble(stream: &[u8], chunks: &[usize]) -> (Vec<RawBuffer>, MicrosliceParser) {
    let pool = BufferPool::new(8, 4096, 1, Duration::from_millis(10));
    let mut parser = MicrosliceParser::new(MAX_MICROSLICE_SIZE);
    let mut assembler = MillisliceAssembler::new(pool.clone(), WIDTH, OVERLAP);
    let mut microslices = Vec::new();

    let mut offset = 0;
    let mut sizes = chunks.iter().cycle();
    while offset < stream.len() {
        let size = sizes.next().copied().unwrap_or(stream.len()).max(1);
        let end = (offset + size).min(stream.len());
        parser.feed(&stream[offset..end], &mut microslices).unwrap();
        for ms in microslices.drain(..) {
            assembler.add_microslice(&ms).unwrap();
        }
        offset = end;
    }

    let mut filled = Vec::new();
    while let Some(buffer) = pool.retrieve_filled(Duration::from_millis(1)) {
        filled.push(buffer);
    }
    (filled, parser)
}

fn metadata(buffer: &RawBuffer) -> MillisliceMetadata {
    *buffer.metadata().unwrap()
}

fn check_scenario(first_tick: u32) {
    let stream = scenario_stream(first_tick);
    let (filled, parser) = assemble(&stream, &[stream.len()]);
    assert_eq!(parser.stats().microslices, 10);
    assert_eq!(parser.stats().checksum_mismatches, 0);
    assert_eq!(parser.stats().sequence_mismatches, 0);

    // The last three microslices are still in the open millislice
    assert_eq!(filled.len(), 2);
    let t0 = Tick::new(first_tick);

    let first = metadata(&filled[0]);
    assert_eq!(first.sequence_id, 0);
    assert_eq!(first.end_timestamp, t0.wrapping_add(WIDTH));
    assert_eq!(first.width_ticks, WIDTH);
    assert_eq!(first.overlap_ticks, OVERLAP);
    assert_eq!(first.microslice_count, 4);
    assert_eq!(first.complete_microslice_count, 4);
    assert_eq!(first.payload_count(), 16);
    assert_eq!(first.payload_counts.counter, 8);
    assert_eq!(first.payload_counts.selftest, 4);
    assert_eq!(first.payload_counts.timestamp, 4);
    // Checksum words are stripped
    assert_eq!(first.size, 4 * 56);
    let ids: Vec<u8> = MillisliceReader::new(filled[0].data())
        .map(|u| u.unwrap().header.sequence_id)
        .collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);

    let second = metadata(&filled[1]);
    assert_eq!(second.sequence_id, 1);
    assert_eq!(second.end_timestamp, t0.wrapping_add(2 * WIDTH));
    assert_eq!(second.microslice_count, 5);
    assert_eq!(second.complete_microslice_count, 5);
    assert_eq!(second.size, 5 * 56);
    let ids: Vec<u8> = MillisliceReader::new(filled[1].data())
        .map(|u| u.unwrap().header.sequence_id)
        .collect();
    // Overlap copy of microslice 3 leads the next millislice
    assert_eq!(ids, vec![3, 4, 5, 6, 7]);
    assert_eq!(&filled[1].data()[..56], &filled[0].data()[3 * 56..]);
}

#[test]
fn test_ten_microslice_scenario() {
    check_scenario(1000);
}

#[test]
fn test_ten_microslice_scenario_across_rollover() {
    check_scenario(TICK_ROLLOVER - 70);
}

#[test]
fn test_single_byte_delivery_matches_bulk() {
    let stream = scenario_stream(5000);
    let (bulk, _) = assemble(&stream, &[stream.len()]);
    let (trickle, parser) = assemble(&stream, &[1]);
    assert_eq!(parser.stats().microslices, 10);
    assert_eq!(bulk.len(), trickle.len());
    for (a, b) in bulk.iter().zip(trickle.iter()) {
        assert_eq!(a.data(), b.data());
        assert_eq!(a.metadata(), b.metadata());
    }
}

proptest! {
    #[test]
    fn arbitrary_chunking_matches_bulk(chunks in prop::collection::vec(1usize..80, 1..20)) {
        let stream = scenario_stream(123_456);
        let (bulk, _) = assemble(&stream, &[stream.len()]);
        let (chunked, _) = assemble(&stream, &chunks);
        prop_assert_eq!(bulk.len(), chunked.len());
        for (a, b) in bulk.iter().zip(chunked.iter()) {
            prop_assert_eq!(a.data(), b.data());
            prop_assert_eq!(a.metadata(), b.metadata());
        }
    }
}
