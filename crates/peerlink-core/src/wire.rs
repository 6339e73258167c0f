//! peerlink wire format.
//!
//! The discovery handshake is a single literal message, and the data stream
//! is bare decimal counter text with no length prefix or delimiter. A reader may see frames
//! split across reads or several frames merged into one read.

/// Message sent over the discovery channel to ask a publisher for a link.
pub const CONNECT_PAYLOAD: &[u8] = b"connect";

/// Size of the reactor's read buffer unless configured otherwise.
pub const DEFAULT_READ_BUFFER: usize = 8192;

/// The initiator's counter wraps at this value unless configured otherwise.
pub const DEFAULT_COUNTER_MODULUS: u32 = 11;

/// Is this discovery message a connect request?
pub fn is_connect_request(payload: &[u8]) -> bool {
    payload == CONNECT_PAYLOAD
}

/// Rotating counter written by the initiator side of a link.
///
/// Yields `0, 1, .., modulus - 1, 0, ..` as decimal text.
#[derive(Debug, Clone)]
pub struct CounterPayload {
    next: u32,
    modulus: u32,
}

impl CounterPayload {
    /// A modulus of zero is treated as one.
    pub fn new(modulus: u32) -> Self {
        Self {
            next: 0,
            modulus: modulus.max(1),
        }
    }

    /// Encode the current value and advance.
    pub fn next_frame(&mut self) -> Vec<u8> {
        let frame = self.next.to_string().into_bytes();
        self.next = (self.next + 1) % self.modulus;
        frame
    }
}

impl Default for CounterPayload {
    fn default() -> Self {
        Self::new(DEFAULT_COUNTER_MODULUS)
    }
}
