use super::checksum::ChecksumEngine;
use super::constants::MICROSLICE_HEADER_SIZE;
use super::error::ParserError;
use super::microslice::{
    checksum_word_value, decode_payload, Microslice, MicrosliceHeader, PayloadType, PayloadWord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    ReceiveHeader,
    ReceivePayload,
}

/// Protocol violation tallies. These are diagnostics only; none of them stop parsing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserStats {
    pub microslices: u64,
    pub fragments: u64,
    pub version_errors: u64,
    pub version_changes: u64,
    pub sequence_mismatches: u64,
    pub checksum_mismatches: u64,
    pub missing_checksums: u64,
    pub dropped: u64,
}

/// MicrosliceParser is a two state (header, payload) machine fed with whatever a socket
/// read delivered.
///
/// Bytes are accumulated until the current state has all it needs, so a microslice split
/// across any number of reads decodes exactly like one delivered in a single read. The
/// caller should never hand over more than [`MicrosliceParser::bytes_needed`] bytes at a
/// time; [`MicrosliceParser::consume`] reports how many it took if it does.
#[derive(Debug)]
pub struct MicrosliceParser {
    state: ReceiveState,
    state_size: usize,
    state_buffer: Vec<u8>,
    header: Option<MicrosliceHeader>,
    checksum: ChecksumEngine,
    max_microslice_size: usize,
    last_sequence_id: Option<u8>,
    last_was_fragment: bool,
    latched_version: Option<u8>,
    stats: ParserStats,
}

impl MicrosliceParser {
    pub fn new(max_microslice_size: usize) -> Self {
        Self {
            state: ReceiveState::ReceiveHeader,
            state_size: MICROSLICE_HEADER_SIZE,
            state_buffer: Vec::with_capacity(max_microslice_size),
            header: None,
            checksum: ChecksumEngine::new(),
            max_microslice_size,
            last_sequence_id: None,
            last_was_fragment: false,
            latched_version: None,
            stats: ParserStats::default(),
        }
    }

    pub fn state(&self) -> ReceiveState {
        self.state
    }

    /// Bytes still missing before the current state completes
    pub fn bytes_needed(&self) -> usize {
        self.state_size - self.state_buffer.len()
    }

    pub fn stats(&self) -> &ParserStats {
        &self.stats
    }

    /// True when no microslice is partially received
    pub fn is_idle(&self) -> bool {
        self.state == ReceiveState::ReceiveHeader && self.state_buffer.is_empty()
    }

    /// Throw away a partially received microslice. Sequence and version latches survive.
    pub fn discard_partial(&mut self) {
        if !self.is_idle() {
            log::debug!(
                "Discarding partially received microslice ({:?}, {} of {} bytes)",
                self.state,
                self.state_buffer.len(),
                self.state_size
            );
        }
        self.enter_header_state();
    }

    /// Start over on a new connection. Partial data and latches are dropped, tallies kept
    pub fn restart(&mut self) {
        self.enter_header_state();
        self.checksum.reset();
        self.last_sequence_id = None;
        self.last_was_fragment = false;
        self.latched_version = None;
    }

    /// Return to the state of a freshly constructed parser
    pub fn reset(&mut self) {
        self.restart();
        self.stats = ParserStats::default();
    }

    /// Consume at most [`bytes_needed`](Self::bytes_needed) bytes from `data`.
    ///
    /// Returns the number of bytes taken and, if this completed a microslice, the decoded
    /// microslice. A framing error means the stream can no longer be trusted; the parser is
    /// already back in the header state when it is returned.
    pub fn consume(&mut self, data: &[u8]) -> Result<(usize, Option<Microslice>), ParserError> {
        let n = data.len().min(self.bytes_needed());
        self.state_buffer.extend_from_slice(&data[..n]);
        if self.bytes_needed() > 0 {
            return Ok((n, None));
        }

        match self.state {
            ReceiveState::ReceiveHeader => {
                let payload_size = self.handle_header()?;
                if payload_size > 0 {
                    return Ok((n, None));
                }
                // Header only microslice, nothing further to wait for
                Ok((n, self.handle_payload()))
            }
            ReceiveState::ReceivePayload => Ok((n, self.handle_payload())),
        }
    }

    /// Feed an arbitrary chunk, collecting every microslice completed along the way
    pub fn feed(&mut self, mut data: &[u8], out: &mut Vec<Microslice>) -> Result<(), ParserError> {
        while !data.is_empty() {
            let (n, microslice) = self.consume(data)?;
            if let Some(ms) = microslice {
                out.push(ms);
            }
            data = &data[n..];
        }
        Ok(())
    }

    fn enter_header_state(&mut self) {
        self.state = ReceiveState::ReceiveHeader;
        self.state_size = MICROSLICE_HEADER_SIZE;
        self.state_buffer.clear();
        self.header = None;
    }

    /// Validate a complete header and switch to the payload state. Returns the payload size.
    fn handle_header(&mut self) -> Result<usize, ParserError> {
        let header = MicrosliceHeader::decode(&self.state_buffer)?;
        log::trace!(
            "Got header for microslice version {:#x} with size {} sequence ID {}",
            header.format_version,
            header.block_size,
            header.sequence_id
        );

        let block_size = header.block_size as usize;
        if block_size < MICROSLICE_HEADER_SIZE || block_size > self.max_microslice_size {
            self.enter_header_state();
            return Err(ParserError::BadBlockSize(
                header.block_size,
                self.max_microslice_size,
            ));
        }

        if !header.is_version_valid() {
            log::error!(
                "Microslice version and version complement do not match {:#x}, {:#x}",
                header.version(),
                header.version_complement()
            );
            self.stats.version_errors += 1;
        }
        match self.latched_version {
            Some(version) if version != header.format_version => {
                log::warn!(
                    "Microslice format version changed mid-run from {:#x} to {:#x}",
                    version,
                    header.format_version
                );
                self.stats.version_changes += 1;
                self.latched_version = Some(header.format_version);
            }
            Some(_) => (),
            None => self.latched_version = Some(header.format_version),
        }

        if let Some(last) = self.last_sequence_id {
            let expected = last.wrapping_add(1);
            let continues_fragment = self.last_was_fragment && header.sequence_id == last;
            if header.sequence_id != expected && !continues_fragment {
                log::warn!(
                    "Mismatch in microslice sequence IDs! Got {} expected {}",
                    header.sequence_id,
                    expected
                );
                self.stats.sequence_mismatches += 1;
            }
        }
        self.last_sequence_id = Some(header.sequence_id);

        self.checksum.reset();
        self.checksum.update(&self.state_buffer);

        let payload_size = block_size - MICROSLICE_HEADER_SIZE;
        self.header = Some(header);
        self.state = ReceiveState::ReceivePayload;
        self.state_size = payload_size;
        self.state_buffer.clear();
        Ok(payload_size)
    }

    /// Decode and validate a complete payload, stripping the checksum word
    fn handle_payload(&mut self) -> Option<Microslice> {
        let header = self.header?;
        let result = self.build_microslice(header);
        self.enter_header_state();
        result
    }

    fn build_microslice(&mut self, header: MicrosliceHeader) -> Option<Microslice> {
        let raw = &self.state_buffer;
        let raw_words = match decode_payload(raw) {
            Ok(words) => words,
            Err(e) => {
                log::error!(
                    "Dropping microslice with sequence ID {}: {}",
                    header.sequence_id,
                    e
                );
                self.stats.dropped += 1;
                self.last_was_fragment = false;
                return None;
            }
        };

        let mut payload = Vec::with_capacity(raw.len());
        let mut words = Vec::with_capacity(raw_words.len());
        let mut hardware_checksum = None;
        for word in raw_words.iter() {
            if word.kind == PayloadType::Checksum {
                hardware_checksum = Some(checksum_word_value(raw, word));
                continue;
            }
            self.checksum.update(&raw[word.byte_range()]);
            words.push(PayloadWord {
                offset: payload.len(),
                ..*word
            });
            payload.extend_from_slice(&raw[word.byte_range()]);
        }

        match hardware_checksum {
            Some(expected) if !self.checksum.matches(expected) => {
                log::error!(
                    "Checksum mismatch for microslice with sequence ID {}: computed {:#06x} hardware {:#06x}",
                    header.sequence_id,
                    self.checksum.value(),
                    expected
                );
                self.stats.checksum_mismatches += 1;
            }
            Some(_) => (),
            None => {
                log::debug!(
                    "Microslice with sequence ID {} carries no checksum word",
                    header.sequence_id
                );
                self.stats.missing_checksums += 1;
            }
        }

        let microslice = Microslice {
            header,
            payload,
            words,
        };
        self.stats.microslices += 1;
        self.last_was_fragment = !microslice.is_complete();
        if self.last_was_fragment {
            self.stats.fragments += 1;
        }
        Some(microslice)
    }
}
