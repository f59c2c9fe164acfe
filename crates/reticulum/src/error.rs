use core::fmt;

/// Protocol error taxonomy. Crypto and parse failures are recovered locally
/// by dropping the offending frame; they never surface above the codec.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum RnsError {
    /// Header malformed for its declared type.
    MalformedPacket,
    /// Frame shorter than the minimum for its header type.
    Truncated,
    /// Fernet MAC failed or padding invalid.
    InvalidToken,
    /// Ratchet id not present in the destination's ring.
    UnknownRatchet,
    /// No route after a path-request timeout.
    UnknownDestination,
    /// A bounded pool had no free slot.
    PoolExhausted,
    /// Link handshake or keepalive expired.
    LinkTimeout,
    /// BLE identity handshake expired.
    HandshakeTimeout,
    /// BLE fragment session stalled.
    ReassemblyTimeout,
    /// Interface-level connectivity diagnostic.
    CarrierLost,
    /// Adapter reported an I/O error.
    InterfaceWriteFailure,
    /// Persistence adapter failed.
    StorageUnavailable,
    IncorrectSignature,
    IncorrectHash,
    CryptoError,
    InvalidArgument,
    OutOfMemory,
}

impl fmt::Display for RnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RnsError::MalformedPacket => "malformed packet",
            RnsError::Truncated => "truncated frame",
            RnsError::InvalidToken => "invalid token",
            RnsError::UnknownRatchet => "unknown ratchet",
            RnsError::UnknownDestination => "unknown destination",
            RnsError::PoolExhausted => "pool exhausted",
            RnsError::LinkTimeout => "link timeout",
            RnsError::HandshakeTimeout => "handshake timeout",
            RnsError::ReassemblyTimeout => "reassembly timeout",
            RnsError::CarrierLost => "carrier lost",
            RnsError::InterfaceWriteFailure => "interface write failure",
            RnsError::StorageUnavailable => "storage unavailable",
            RnsError::IncorrectSignature => "incorrect signature",
            RnsError::IncorrectHash => "incorrect hash",
            RnsError::CryptoError => "crypto error",
            RnsError::InvalidArgument => "invalid argument",
            RnsError::OutOfMemory => "out of memory",
        };
        write!(f, "{}", text)
    }
}

impl std::error::Error for RnsError {}
