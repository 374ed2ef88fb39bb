//! # penn_receiver
//!
//! penn_receiver is the trigger board data receiver, written in Rust. It listens for a
//! single TCP connection from the board, takes the continuous stream of microslices it
//! sends, validates them, and re-buckets their payload words into fixed width,
//! overlapping time windows called millislices. Millislices are handed to the host
//! through a pool of reusable buffers.
//!
//! ## Installation
//!
//! The only method of install is from source. If you have not used Rust before, see the
//! [Rust docs](https://www.rust-lang.org/tools/install) for installation instructions.
//! To build and install the CLI use `cargo install --path ./penn_receiver_cli` from the
//! top level repository.
//!
//! ## Usage
//!
//! ```no_run
//! use libpenn_receiver::config::ReceiverConfig;
//! use libpenn_receiver::millislice::MillisliceReader;
//! use libpenn_receiver::receiver::MillisliceReceiver;
//! use std::time::Duration;
//!
//! let mut receiver = MillisliceReceiver::new(ReceiverConfig::default()).unwrap();
//! receiver.start().unwrap();
//! while let Some(buffer) = receiver.retrieve_filled_buffer(Duration::from_secs(1)) {
//!     for unit in MillisliceReader::new(buffer.data()) {
//!         println!("{:?}", unit.unwrap().header);
//!     }
//!     receiver.commit_empty_buffer(buffer).unwrap();
//! }
//! receiver.stop().unwrap();
//! ```
//!
//! ## Data format
//!
//! All fields are big-endian. A microslice is a 4 byte header followed by payload words:
//!
//! ```text
//! header  | complement:4 version:4 | sequence_id:8 | block_size:16 |
//! word    | type:4 tick:28 | data |
//! ```
//!
//! | type | tag | data bytes |
//! |------|-----|------------|
//! | counter | 0x1 | 12 |
//! | trigger | 0x2 | 4 |
//! | self-test | 0x3 | 4 |
//! | checksum | 0x4 | 4 (low 16 bits) |
//! | timestamp | 0x8 | 8 |
//!
//! The tick is the low 28 bits of the 64 MHz board clock and rolls over roughly every
//! 4.2 seconds. A microslice with a timestamp word is complete; one without is a fragment
//! and the next microslice repeats its sequence id.
//!
//! Each millislice buffer holds the microslices (or the parts of them) that fall in its
//! window, each re-framed as a header whose block size covers exactly the bytes that
//! follow it. Checksum words are stripped. The last `millislice_overlap_ticks` of a
//! window are repeated at the start of the next millislice. A filled buffer carries
//! [`MillisliceMetadata`](millislice::MillisliceMetadata) describing its window and
//! contents.
//!
//! ## Configuration
//!
//! The receiver is configured with a YAML file:
//!
//! ```yml
//! receive_port: 8989
//! millislice_width_ticks: 320000
//! millislice_overlap_ticks: 0
//! tick_period_usecs: 10000
//! buffer_pool_capacity: 100
//! raw_buffer_size: 1000000
//! buffer_acquire_retries: 10
//! buffer_acquire_timeout_ms: 1000
//! stop_timeout_usecs: 5000000
//! max_microslice_size: 65535
//! debug_level: 0
//! reporting_interval_millislices: 200
//! ```
//!
//! The millislice width must be between 1 and 2^27 ticks and the overlap must be smaller
//! than the width. Missing fields take the values shown above.
pub mod assembler;
pub mod buffer_pool;
pub mod checksum;
pub mod config;
pub mod constants;
pub mod emulator;
pub mod error;
pub mod microslice;
pub mod millislice;
pub mod parser;
mod reactor;
pub mod receiver;
pub mod stats;
pub mod time_window;
