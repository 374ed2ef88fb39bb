use super::constants::MICROSLICE_HEADER_SIZE;
use super::error::MicrosliceError;
use super::microslice::{
    contains_timestamp, decode_payload, MicrosliceHeader, PayloadCounts, PayloadWord,
};
use super::time_window::Tick;

/// Metadata stamped onto a buffer when the millislice it holds is complete
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MillisliceMetadata {
    pub size: usize,
    pub sequence_id: u16,
    pub end_timestamp: Tick,
    pub width_ticks: u32,
    pub overlap_ticks: u32,
    pub payload_counts: PayloadCounts,
    pub microslice_count: u32,
    pub complete_microslice_count: u32,
}

impl MillisliceMetadata {
    pub fn payload_count(&self) -> u32 {
        self.payload_counts.total()
    }

    /// Start of the window covered by this millislice, excluding the overlap prefix
    pub fn start_timestamp(&self) -> Tick {
        self.end_timestamp.wrapping_sub(self.width_ticks)
    }
}

/// One reframed microslice inside a millislice buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicrosliceUnit<'a> {
    pub header: MicrosliceHeader,
    pub payload: &'a [u8],
    pub words: Vec<PayloadWord>,
}

impl MicrosliceUnit<'_> {
    pub fn is_complete(&self) -> bool {
        contains_timestamp(&self.words)
    }

    pub fn counts(&self) -> PayloadCounts {
        PayloadCounts::from_words(&self.words)
    }
}

/// MillisliceReader walks the microslice units packed into a filled buffer.
///
/// Every unit written by the assembler is a header whose block size covers exactly the
/// bytes that follow it, so the buffer can be walked without any outside bookkeeping.
/// Everything is bounds checked; the first malformed unit ends iteration with an error.
#[derive(Debug)]
pub struct MillisliceReader<'a> {
    data: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> MillisliceReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            failed: false,
        }
    }

    fn read_unit(&mut self) -> Result<MicrosliceUnit<'a>, MicrosliceError> {
        let rest = &self.data[self.offset..];
        let header = MicrosliceHeader::decode(rest)?;
        let payload_size = header.payload_size()?;
        let end = MICROSLICE_HEADER_SIZE + payload_size;
        if rest.len() < end {
            return Err(MicrosliceError::TruncatedUnit(self.offset, end, rest.len()));
        }
        let payload = &rest[MICROSLICE_HEADER_SIZE..end];
        let words = decode_payload(payload)?;
        self.offset += end;
        Ok(MicrosliceUnit {
            header,
            payload,
            words,
        })
    }
}

impl<'a> Iterator for MillisliceReader<'a> {
    type Item = Result<MicrosliceUnit<'a>, MicrosliceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }
        let unit = self.read_unit();
        if unit.is_err() {
            self.failed = true;
        }
        Some(unit)
    }
}
