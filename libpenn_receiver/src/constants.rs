// Microslice wire format
pub const MICROSLICE_HEADER_SIZE: usize = 4; // version, sequence id, 16 bit block size
pub const PAYLOAD_WORD_HEADER_SIZE: usize = 4; // 4 bit type + 28 bit tick
pub const PAYLOAD_SIZE_COUNTER: usize = 12;
pub const PAYLOAD_SIZE_TRIGGER: usize = 4;
pub const PAYLOAD_SIZE_SELFTEST: usize = 4;
pub const PAYLOAD_SIZE_CHECKSUM: usize = 4;
pub const PAYLOAD_SIZE_TIMESTAMP: usize = 8;
pub const MAX_MICROSLICE_SIZE: usize = u16::MAX as usize; // block size is a u16

// Payload type tags (high nibble of the word header)
pub const PAYLOAD_TYPE_COUNTER: u8 = 0x1;
pub const PAYLOAD_TYPE_TRIGGER: u8 = 0x2;
pub const PAYLOAD_TYPE_SELFTEST: u8 = 0x3;
pub const PAYLOAD_TYPE_CHECKSUM: u8 = 0x4;
pub const PAYLOAD_TYPE_TIMESTAMP: u8 = 0x8;

// Header version byte
pub const VERSION_MASK: u8 = 0x0F;
pub const VERSION_CHECK_PATTERN: u8 = 0x0F; // version ^ complement
pub const MICROSLICE_FORMAT_VERSION: u8 = 0x3;

// Hardware clock
pub const TICK_BITS: u32 = 28;
pub const TICK_ROLLOVER: u32 = 1 << TICK_BITS;
pub const TICK_MASK: u32 = TICK_ROLLOVER - 1;
pub const TICK_HALF_RANGE: u32 = TICK_ROLLOVER / 2;
pub const TICKS_PER_SECOND: u64 = 64_000_000; // 64 MHz NOvA clock

// Receiver defaults
pub const DEFAULT_RECEIVE_PORT: u16 = 8989;
pub const DEFAULT_TICK_PERIOD_USECS: u32 = 10_000;
pub const DEFAULT_BUFFER_ACQUIRE_RETRIES: u32 = 10;
pub const DEFAULT_BUFFER_ACQUIRE_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_STOP_TIMEOUT_USECS: u32 = 5_000_000;
