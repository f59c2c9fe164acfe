use core::fmt;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum LxmfError {
    /// Message container malformed or truncated.
    Decode(String),
    Encode(String),
    /// Ed25519 signature over the message did not verify.
    InvalidSignature,
    /// Source identity not known; the message cannot be verified.
    UnknownSource,
    /// A bounded queue or pool had no free slot.
    PoolExhausted,
    /// Message already seen; dropped by the dedup ring.
    Duplicate,
    Storage,
    Transport,
}

impl fmt::Display for LxmfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LxmfError::Decode(reason) => write!(f, "decode error: {}", reason),
            LxmfError::Encode(reason) => write!(f, "encode error: {}", reason),
            LxmfError::InvalidSignature => write!(f, "invalid message signature"),
            LxmfError::UnknownSource => write!(f, "unknown source identity"),
            LxmfError::PoolExhausted => write!(f, "pool exhausted"),
            LxmfError::Duplicate => write!(f, "duplicate message"),
            LxmfError::Storage => write!(f, "storage error"),
            LxmfError::Transport => write!(f, "transport error"),
        }
    }
}

impl std::error::Error for LxmfError {}
