/// ChecksumEngine is the 16-bit BSD-style rotate-and-add running checksum used by the
/// trigger board to protect each microslice.
///
/// For every byte the accumulator is rotated right by one bit and the byte is added
/// (mod 2^16). The accumulator is reset at the start of every microslice header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChecksumEngine {
    acc: u16,
}

impl ChecksumEngine {
    pub fn new() -> Self {
        Self { acc: 0 }
    }

    /// Clear the accumulator. Called when a new microslice header arrives
    pub fn reset(&mut self) {
        self.acc = 0;
    }

    /// Fold a range of bytes into the running checksum
    pub fn update(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.acc = self.acc.rotate_right(1).wrapping_add(*byte as u16);
        }
    }

    pub fn value(&self) -> u16 {
        self.acc
    }

    /// Compare the running value against the checksum word supplied by the hardware
    pub fn matches(&self, hardware_checksum: u16) -> bool {
        self.acc == hardware_checksum
    }
}

/// Compute the checksum of a complete byte range in one go
pub fn compute(bytes: &[u8]) -> u16 {
    let mut engine = ChecksumEngine::new();
    engine.update(bytes);
    engine.value()
}

/// Check a byte range against an expected checksum
pub fn validate(bytes: &[u8], expected: u16) -> bool {
    compute(bytes) == expected
}
