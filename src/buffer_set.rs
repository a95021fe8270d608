//! Buffer set for state machine operations.

/// Buffer set for state machine operations.
pub struct BufferSet {
    /// Payload of the last message read
    pub read_buffer: Vec<u8>,
    /// Outgoing messages waiting to be written
    pub write_buffer: Vec<u8>,
    /// Type byte of the last message read
    pub type_byte: u8,
}

impl BufferSet {
    /// Create a new buffer set.
    pub fn new() -> Self {
        Self {
            read_buffer: Vec::with_capacity(8192),
            write_buffer: Vec::with_capacity(8192),
            type_byte: 0,
        }
    }

    /// Replace the current message with `type_byte` and `payload`.
    pub fn load(&mut self, type_byte: u8, payload: &[u8]) {
        self.type_byte = type_byte;
        self.read_buffer.clear();
        self.read_buffer.extend_from_slice(payload);
    }
}

impl Default for BufferSet {
    fn default() -> Self {
        Self::new()
    }
}
