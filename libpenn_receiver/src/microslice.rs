use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::ops::Range;

use super::constants::*;
use super::error::MicrosliceError;
use super::time_window::Tick;

/// The 4 byte header that opens every microslice on the wire.
///
/// Layout (big-endian): `[complement:4 | version:4] [sequence_id:8] [block_size:16]`. The
/// block size counts the header itself plus every payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MicrosliceHeader {
    pub format_version: u8,
    pub sequence_id: u8,
    pub block_size: u16,
}

impl MicrosliceHeader {
    /// Build a header with a correct version complement nibble
    pub fn new(version: u8, sequence_id: u8, block_size: u16) -> Self {
        let version = version & VERSION_MASK;
        let complement = !version & VERSION_MASK;
        Self {
            format_version: (complement << 4) | version,
            sequence_id,
            block_size,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MicrosliceError> {
        if bytes.len() < MICROSLICE_HEADER_SIZE {
            return Err(MicrosliceError::ShortHeader(bytes.len()));
        }
        Ok(Self {
            format_version: bytes[0],
            sequence_id: bytes[1],
            block_size: BigEndian::read_u16(&bytes[2..4]),
        })
    }

    pub fn to_bytes(&self) -> [u8; MICROSLICE_HEADER_SIZE] {
        let mut bytes = [0u8; MICROSLICE_HEADER_SIZE];
        bytes[0] = self.format_version;
        bytes[1] = self.sequence_id;
        BigEndian::write_u16(&mut bytes[2..4], self.block_size);
        bytes
    }

    pub fn version(&self) -> u8 {
        self.format_version & VERSION_MASK
    }

    pub fn version_complement(&self) -> u8 {
        (self.format_version >> 4) & VERSION_MASK
    }

    /// The version nibble XOR its complement must be all ones
    pub fn is_version_valid(&self) -> bool {
        (self.version() ^ self.version_complement()) == VERSION_CHECK_PATTERN
    }

    /// Number of payload bytes announced by the block size
    pub fn payload_size(&self) -> Result<usize, MicrosliceError> {
        (self.block_size as usize)
            .checked_sub(MICROSLICE_HEADER_SIZE)
            .ok_or(MicrosliceError::BlockSizeTooSmall(self.block_size))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadType {
    Counter,
    Trigger,
    SelfTest,
    Checksum,
    Timestamp,
}

impl PayloadType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            PAYLOAD_TYPE_COUNTER => Some(Self::Counter),
            PAYLOAD_TYPE_TRIGGER => Some(Self::Trigger),
            PAYLOAD_TYPE_SELFTEST => Some(Self::SelfTest),
            PAYLOAD_TYPE_CHECKSUM => Some(Self::Checksum),
            PAYLOAD_TYPE_TIMESTAMP => Some(Self::Timestamp),
            _ => None,
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            Self::Counter => PAYLOAD_TYPE_COUNTER,
            Self::Trigger => PAYLOAD_TYPE_TRIGGER,
            Self::SelfTest => PAYLOAD_TYPE_SELFTEST,
            Self::Checksum => PAYLOAD_TYPE_CHECKSUM,
            Self::Timestamp => PAYLOAD_TYPE_TIMESTAMP,
        }
    }

    /// Size of the data following the word header
    pub fn data_size(&self) -> usize {
        match self {
            Self::Counter => PAYLOAD_SIZE_COUNTER,
            Self::Trigger => PAYLOAD_SIZE_TRIGGER,
            Self::SelfTest => PAYLOAD_SIZE_SELFTEST,
            Self::Checksum => PAYLOAD_SIZE_CHECKSUM,
            Self::Timestamp => PAYLOAD_SIZE_TIMESTAMP,
        }
    }

    /// Size of the full word, header included
    pub fn word_size(&self) -> usize {
        PAYLOAD_WORD_HEADER_SIZE + self.data_size()
    }

    /// The checksum word reuses the tick field, everything else is stamped by the board clock
    pub fn carries_tick(&self) -> bool {
        !matches!(self, Self::Checksum)
    }
}

/// A single payload word located inside a microslice payload buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadWord {
    pub kind: PayloadType,
    pub raw_tick: u32,
    pub offset: usize,
}

impl PayloadWord {
    pub fn size(&self) -> usize {
        self.kind.word_size()
    }

    pub fn byte_range(&self) -> Range<usize> {
        self.offset..(self.offset + self.size())
    }

    /// The board tick, or None for words that do not carry one
    pub fn tick(&self) -> Option<Tick> {
        if self.kind.carries_tick() {
            Some(Tick::new(self.raw_tick))
        } else {
            None
        }
    }
}

/// Walk a payload buffer and locate every word, checking bounds as we go
pub fn decode_payload(payload: &[u8]) -> Result<Vec<PayloadWord>, MicrosliceError> {
    let mut words = Vec::new();
    let mut offset = 0;
    while offset < payload.len() {
        let remaining = payload.len() - offset;
        if remaining < PAYLOAD_WORD_HEADER_SIZE {
            return Err(MicrosliceError::TruncatedWord(
                0,
                offset,
                PAYLOAD_WORD_HEADER_SIZE,
                remaining,
            ));
        }
        let word_header = BigEndian::read_u32(&payload[offset..offset + PAYLOAD_WORD_HEADER_SIZE]);
        let tag = (word_header >> TICK_BITS) as u8;
        let kind = PayloadType::from_tag(tag)
            .ok_or(MicrosliceError::UnknownPayloadType(tag, offset))?;
        if remaining < kind.word_size() {
            return Err(MicrosliceError::TruncatedWord(
                tag,
                offset,
                kind.word_size(),
                remaining,
            ));
        }
        words.push(PayloadWord {
            kind,
            raw_tick: word_header & TICK_MASK,
            offset,
        });
        offset += kind.word_size();
    }
    Ok(words)
}

/// Append an encoded payload word. Data shorter than the word's data size is zero padded,
/// longer data is truncated.
pub fn encode_word(kind: PayloadType, raw_tick: u32, data: &[u8], out: &mut Vec<u8>) {
    let word_header = ((kind.tag() as u32) << TICK_BITS) | (raw_tick & TICK_MASK);
    // Writing into a Vec cannot fail
    let _ = out.write_u32::<BigEndian>(word_header);
    let n = data.len().min(kind.data_size());
    out.extend_from_slice(&data[..n]);
    out.resize(out.len() + kind.data_size() - n, 0);
}

/// Read the hardware checksum carried by a checksum word
pub fn checksum_word_value(payload: &[u8], word: &PayloadWord) -> u16 {
    let data_start = word.offset + PAYLOAD_WORD_HEADER_SIZE;
    BigEndian::read_u32(&payload[data_start..data_start + PAYLOAD_SIZE_CHECKSUM]) as u16
}

/// Tallies of payload words by type. Checksum words are never counted since they are
/// stripped before data is handed downstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadCounts {
    pub counter: u32,
    pub trigger: u32,
    pub selftest: u32,
    pub timestamp: u32,
}

impl PayloadCounts {
    pub fn record(&mut self, kind: PayloadType) {
        match kind {
            PayloadType::Counter => self.counter += 1,
            PayloadType::Trigger => self.trigger += 1,
            PayloadType::SelfTest => self.selftest += 1,
            PayloadType::Timestamp => self.timestamp += 1,
            PayloadType::Checksum => (),
        }
    }

    pub fn from_words(words: &[PayloadWord]) -> Self {
        let mut counts = Self::default();
        for word in words {
            counts.record(word.kind);
        }
        counts
    }

    pub fn add(&mut self, other: &PayloadCounts) {
        self.counter += other.counter;
        self.trigger += other.trigger;
        self.selftest += other.selftest;
        self.timestamp += other.timestamp;
    }

    pub fn total(&self) -> u32 {
        self.counter + self.trigger + self.selftest + self.timestamp
    }
}

/// A fully received microslice with the checksum word already stripped.
///
/// `header` is the header exactly as it arrived; `payload` holds only the data words and
/// `words` indexes into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Microslice {
    pub header: MicrosliceHeader,
    pub payload: Vec<u8>,
    pub words: Vec<PayloadWord>,
}

impl Microslice {
    /// A microslice is complete when the board closed it with a timestamp word. Anything
    /// else is a fragment whose continuation repeats the sequence id.
    pub fn is_complete(&self) -> bool {
        contains_timestamp(&self.words)
    }

    pub fn counts(&self) -> PayloadCounts {
        PayloadCounts::from_words(&self.words)
    }

    pub fn first_tick(&self) -> Option<Tick> {
        self.words.iter().find_map(|w| w.tick())
    }

    /// Byte range in the payload covered by a contiguous run of words
    pub fn byte_range(&self, words: Range<usize>) -> Range<usize> {
        if words.is_empty() {
            return 0..0;
        }
        let start = self.words[words.start].offset;
        let end = self.words[words.end - 1].byte_range().end;
        start..end
    }

    /// Length of a reframed unit holding the given words
    pub fn unit_size(&self, words: Range<usize>) -> usize {
        MICROSLICE_HEADER_SIZE + self.byte_range(words).len()
    }

    /// Write a contiguous run of words as a stand-alone microslice: the original header with
    /// its block size rewritten to match, followed by the words.
    pub fn write_unit(&self, words: Range<usize>, out: &mut Vec<u8>) -> Result<usize, MicrosliceError> {
        let range = self.byte_range(words);
        let size = MICROSLICE_HEADER_SIZE + range.len();
        let block_size = u16::try_from(size).map_err(|_| MicrosliceError::Oversized(size))?;
        let header = MicrosliceHeader {
            block_size,
            ..self.header
        };
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&self.payload[range]);
        Ok(size)
    }
}

pub fn contains_timestamp(words: &[PayloadWord]) -> bool {
    words.iter().any(|w| w.kind == PayloadType::Timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_version_complement() {
        let header = MicrosliceHeader::new(MICROSLICE_FORMAT_VERSION, 7, 64);
        assert_eq!(header.format_version, 0xC3);
        assert!(header.is_version_valid());
        assert_eq!(header.version(), 0x3);

        let bad = MicrosliceHeader {
            format_version: 0x33,
            ..header
        };
        assert!(!bad.is_version_valid());
    }

    #[test]
    fn test_header_wire_layout() {
        let bytes = [0xC3, 0xFE, 0x01, 0x02];
        let header = match MicrosliceHeader::decode(&bytes) {
            Ok(h) => h,
            Err(_) => panic!(),
        };
        assert_eq!(header.sequence_id, 0xFE);
        assert_eq!(header.block_size, 0x0102);
        assert_eq!(header.to_bytes(), bytes);
        assert_eq!(
            MicrosliceHeader::decode(&bytes[..3]),
            Err(MicrosliceError::ShortHeader(3))
        );
    }

    #[test]
    fn test_block_size_too_small() {
        let header = MicrosliceHeader::new(3, 0, 2);
        assert_eq!(
            header.payload_size(),
            Err(MicrosliceError::BlockSizeTooSmall(2))
        );
    }

    #[test]
    fn test_decode_payload() {
        let mut payload = Vec::new();
        encode_word(PayloadType::Counter, 100, &[0xAA; 12], &mut payload);
        encode_word(PayloadType::Trigger, 0x0FFF_FFFF, &[1, 2, 3, 4], &mut payload);
        encode_word(PayloadType::Timestamp, 102, &[0; 8], &mut payload);
        encode_word(PayloadType::Checksum, 0, &[0, 0, 0x12, 0x34], &mut payload);
        let words = match decode_payload(&payload) {
            Ok(w) => w,
            Err(e) => panic!("{e}"),
        };
        assert_eq!(words.len(), 4);
        assert_eq!(words[0].kind, PayloadType::Counter);
        assert_eq!(words[0].tick(), Some(Tick::new(100)));
        assert_eq!(words[1].offset, 16);
        assert_eq!(words[1].raw_tick, 0x0FFF_FFFF);
        assert_eq!(words[2].kind, PayloadType::Timestamp);
        assert_eq!(words[3].tick(), None);
        assert_eq!(checksum_word_value(&payload, &words[3]), 0x1234);
    }

    #[test]
    fn test_decode_payload_rejects_garbage() {
        let mut payload = Vec::new();
        encode_word(PayloadType::Counter, 1, &[], &mut payload);
        payload.extend_from_slice(&[0x70, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            decode_payload(&payload),
            Err(MicrosliceError::UnknownPayloadType(0x7, 16))
        );

        let mut payload = Vec::new();
        encode_word(PayloadType::Timestamp, 1, &[], &mut payload);
        payload.truncate(10);
        assert_eq!(
            decode_payload(&payload),
            Err(MicrosliceError::TruncatedWord(0x8, 0, 12, 10))
        );
    }

    #[test]
    fn test_write_unit_rewrites_block_size() {
        let mut payload = Vec::new();
        encode_word(PayloadType::Counter, 1, &[], &mut payload);
        encode_word(PayloadType::SelfTest, 2, &[], &mut payload);
        encode_word(PayloadType::Timestamp, 3, &[], &mut payload);
        let words = decode_payload(&payload).unwrap();
        let ms = Microslice {
            header: MicrosliceHeader::new(3, 9, 100),
            payload,
            words,
        };
        assert!(ms.is_complete());
        let mut out = Vec::new();
        let written = ms.write_unit(1..3, &mut out).unwrap();
        assert_eq!(written, 4 + 8 + 12);
        let header = MicrosliceHeader::decode(&out).unwrap();
        assert_eq!(header.block_size as usize, written);
        assert_eq!(header.sequence_id, 9);
        assert_eq!(&out[4..], &ms.payload[16..]);
    }
}
