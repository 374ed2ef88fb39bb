use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use super::checksum;
use super::constants::{MAX_MICROSLICE_SIZE, MICROSLICE_FORMAT_VERSION, MICROSLICE_HEADER_SIZE, TICK_MASK};
use super::error::{EmulatorError, MicrosliceError};
use super::microslice::{encode_word, MicrosliceHeader, PayloadType};

/// Parameters of the emulated board stream
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Counter words per microslice, one per tick step
    pub ticks_per_microslice: u32,
    /// Board clock ticks between consecutive counter words
    pub tick_step: u32,
    /// Full 64 bit timestamp of the first word
    pub start_timestamp: u64,
    /// Add a trigger word after every n-th counter word. 0 disables triggers
    pub trigger_every: u32,
    /// Split each microslice into a fragment and a completing microslice after this many
    /// ticks. 0 disables fragmentation
    pub fragment_at_ticks: u32,
    pub first_sequence_id: u8,
    pub format_version: u8,
    pub include_checksum: bool,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            ticks_per_microslice: 10,
            tick_step: 64,
            start_timestamp: 0,
            trigger_every: 3,
            fragment_at_ticks: 0,
            first_sequence_id: 0,
            format_version: MICROSLICE_FORMAT_VERSION,
            include_checksum: true,
        }
    }
}

/// Assemble one wire microslice from a list of words, appending the checksum word if asked.
pub fn build_microslice(
    format_version: u8,
    sequence_id: u8,
    words: &[(PayloadType, u32, Vec<u8>)],
    include_checksum: bool,
) -> Result<Vec<u8>, MicrosliceError> {
    let mut payload = Vec::new();
    for (kind, tick, data) in words.iter() {
        encode_word(*kind, *tick, data, &mut payload);
    }
    let checksum_size = if include_checksum {
        PayloadType::Checksum.word_size()
    } else {
        0
    };
    let total = MICROSLICE_HEADER_SIZE + payload.len() + checksum_size;
    if total > MAX_MICROSLICE_SIZE {
        return Err(MicrosliceError::Oversized(total));
    }

    let mut bytes = Vec::with_capacity(total);
    bytes.extend_from_slice(&MicrosliceHeader::new(format_version, sequence_id, total as u16).to_bytes());
    bytes.extend_from_slice(&payload);
    if include_checksum {
        let sum = checksum::compute(&bytes) as u32;
        encode_word(PayloadType::Checksum, 0, &sum.to_be_bytes(), &mut bytes);
    }
    Ok(bytes)
}

/// MicrosliceEmulator produces the byte stream a trigger board would send.
///
/// Every microslice carries `ticks_per_microslice` counter words, optional trigger words,
/// and ends with a timestamp word followed by the checksum word. With fragmentation
/// enabled the words are split over two wire microslices sharing one sequence id, the
/// first of which has no timestamp word.
#[derive(Debug)]
pub struct MicrosliceEmulator {
    config: EmulatorConfig,
    timestamp: u64,
    sequence_id: u8,
    microslices_generated: u64,
}

impl MicrosliceEmulator {
    pub fn new(config: EmulatorConfig) -> Result<Self, EmulatorError> {
        if config.ticks_per_microslice == 0 {
            return Err(EmulatorError::NoTicks);
        }
        Ok(Self {
            timestamp: config.start_timestamp,
            sequence_id: config.first_sequence_id,
            config,
            microslices_generated: 0,
        })
    }

    /// Wire microslices produced so far, fragments included
    pub fn microslices_generated(&self) -> u64 {
        self.microslices_generated
    }

    pub fn current_timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Bytes of the next microslice (two concatenated wire microslices if fragmented)
    pub fn next_microslice(&mut self) -> Result<Vec<u8>, EmulatorError> {
        let mut words = Vec::new();
        let mut fragment_split = None;
        let mut last_tick = 0;
        for i in 0..self.config.ticks_per_microslice {
            if self.config.fragment_at_ticks > 0 && i == self.config.fragment_at_ticks {
                fragment_split = Some(words.len());
            }
            last_tick = (self.timestamp & TICK_MASK as u64) as u32;
            words.push((PayloadType::Counter, last_tick, counter_data(self.timestamp)));
            if self.config.trigger_every > 0 && (i + 1) % self.config.trigger_every == 0 {
                words.push((PayloadType::Trigger, last_tick, vec![0, 0, 0, 1]));
            }
            self.timestamp += self.config.tick_step as u64;
        }
        let last_timestamp = self.timestamp - self.config.tick_step as u64;
        words.push((
            PayloadType::Timestamp,
            last_tick,
            last_timestamp.to_be_bytes().to_vec(),
        ));

        let version = self.config.format_version;
        let checksum = self.config.include_checksum;
        let bytes = match fragment_split {
            Some(at) => {
                let mut bytes = build_microslice(version, self.sequence_id, &words[..at], checksum)?;
                bytes.extend(build_microslice(version, self.sequence_id, &words[at..], checksum)?);
                self.microslices_generated += 2;
                bytes
            }
            None => {
                self.microslices_generated += 1;
                build_microslice(version, self.sequence_id, &words, checksum)?
            }
        };
        self.sequence_id = self.sequence_id.wrapping_add(1);
        Ok(bytes)
    }

    /// Generate `count` microslices back to back
    pub fn generate(&mut self, count: u64) -> Result<Vec<u8>, EmulatorError> {
        let mut stream = Vec::new();
        for _ in 0..count {
            stream.extend(self.next_microslice()?);
        }
        Ok(stream)
    }

    /// Connect to a receiver and send `count` microslices at `rate_hz` (0 sends as fast as
    /// possible). `on_sent` is called with the number sent so far. Returns bytes sent.
    pub fn send_stream(
        &mut self,
        addr: SocketAddr,
        count: u64,
        rate_hz: f64,
        mut on_sent: impl FnMut(u64),
    ) -> Result<u64, EmulatorError> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        log::info!("Emulator connected to {addr}, sending {count} microslices at {rate_hz} Hz");

        let interval = if rate_hz > 0.0 {
            Some(Duration::from_secs_f64(1.0 / rate_hz))
        } else {
            None
        };
        let start = Instant::now();
        let mut bytes_sent = 0u64;
        for sent in 1..=count {
            let next_time = Instant::now() + interval.unwrap_or(Duration::ZERO);
            let bytes = self.next_microslice()?;
            stream.write_all(&bytes)?;
            bytes_sent += bytes.len() as u64;
            on_sent(sent);
            if interval.is_some() {
                let now = Instant::now();
                if next_time > now {
                    std::thread::sleep(next_time - now);
                }
            }
        }
        stream.flush()?;

        let elapsed = start.elapsed().as_secs_f64();
        log::info!(
            "Emulator sent {} microslices ({}) in {:.2} s",
            count,
            human_bytes::human_bytes(bytes_sent as f64),
            elapsed
        );
        Ok(bytes_sent)
    }
}

fn counter_data(timestamp: u64) -> Vec<u8> {
    let mut data = vec![0u8; 12];
    data[4..].copy_from_slice(&timestamp.to_be_bytes());
    data
}
