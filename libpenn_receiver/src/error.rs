use std::path::PathBuf;
use thiserror::Error;

use super::constants::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MicrosliceError {
    #[error("Microslice buffer of {0} bytes is too short for a header; expected {size}", size=MICROSLICE_HEADER_SIZE)]
    ShortHeader(usize),
    #[error("Microslice block size {0} is smaller than the header size {size}", size=MICROSLICE_HEADER_SIZE)]
    BlockSizeTooSmall(u16),
    #[error("Unknown payload type {0:#x} found at payload offset {1}")]
    UnknownPayloadType(u8, usize),
    #[error("Payload word of type {0:#x} at offset {1} is truncated; needed {2} bytes but {3} remain")]
    TruncatedWord(u8, usize, usize, usize),
    #[error("Microslice unit at offset {0} needs {1} bytes but only {2} remain in the buffer")]
    TruncatedUnit(usize, usize, usize),
    #[error("Microslice of {0} bytes does not fit in a u16 block size")]
    Oversized(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParserError {
    #[error("Microslice block size {0} is invalid; must be between {min} and {1}", min=MICROSLICE_HEADER_SIZE)]
    BadBlockSize(u16, usize),
    #[error("Parser could not decode a microslice header: {0}")]
    BadHeader(#[from] MicrosliceError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("BufferPool had no empty buffers available after {0} retries")]
    Exhausted(u32),
    #[error("BufferPool queue is full; more buffers committed than the pool capacity {0}")]
    Overfull(usize),
    #[error("Buffer from pool {0} was committed to pool {1}")]
    Foreign(u64, u64),
    #[error("BufferPool queue was disconnected")]
    Disconnected,
}

#[derive(Debug, Error)]
pub enum AssemblerError {
    #[error("MillisliceAssembler failed due to BufferPool error: {0}")]
    Pool(#[from] PoolError),
    #[error("MillisliceAssembler failed to reframe a microslice: {0}")]
    Reframe(#[from] MicrosliceError),
}

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("Stream framing lost: {0}")]
    Framing(#[from] ParserError),
    #[error("{0}")]
    Assembly(#[from] AssemblerError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Millislice width {0} ticks is invalid; must be between 1 and {max}", max=TICK_HALF_RANGE)]
    BadWidth(u32),
    #[error("Millislice overlap {0} ticks must be smaller than the width {1}")]
    BadOverlap(u32, u32),
    #[error("Tick period must be non-zero")]
    BadTickPeriod,
    #[error("Buffer pool capacity must be at least 1")]
    BadPoolCapacity,
    #[error("Raw buffer size {0} is smaller than the maximum microslice size {1}")]
    BadBufferSize(usize, usize),
    #[error("Maximum microslice size {0} is invalid; must be between {min} and {max}", min=MICROSLICE_HEADER_SIZE, max=MAX_MICROSLICE_SIZE)]
    BadMicrosliceSize(usize),
}

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("Receiver failed due to configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Receiver failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Receiver failed due to BufferPool error: {0}")]
    PoolError(#[from] PoolError),
    #[error("Receiver start() called while readout was not stopped")]
    NotStopped,
    #[error("Timed out after {0} us waiting for the receiver thread to suspend readout")]
    StopTimeout(u32),
    #[error("Receiver thread could not be spawned: {0}")]
    ThreadSpawn(std::io::Error),
}

#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("Emulator failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Emulator failed to encode a microslice: {0}")]
    EncodeError(#[from] MicrosliceError),
    #[error("Emulator requires at least one tick per microslice")]
    NoTicks,
}
