use crate::sqn::Sqn;

/// Failure to strip bytes from a packet buffer.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkbError {
    #[error("consume of {requested} bytes would underflow payload of {len} bytes")]
    Underflow { requested: usize, len: usize },
}

/// Result of a non-blocking rate check that could not be admitted.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateError {
    #[error("rate limit reached")]
    WouldBlock,
}

/// Errors produced by an FEC codec.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FecError {
    /// Fewer than `k` packets of the group are present.
    #[error("transmission group {tg_sqn} incomplete: {present} of {required} packets")]
    Incomplete {
        tg_sqn: Sqn,
        present: usize,
        required: usize,
    },

    /// A source packet of the group is no longer held by the window.
    #[error("transmission group {tg_sqn} is missing source packet {sqn}")]
    MissingSource { tg_sqn: Sqn, sqn: Sqn },

    /// The parity index is outside `k..n`.
    #[error("parity index {0} out of range")]
    ParityIndex(usize),

    #[error("codec failure: {0}")]
    Codec(String),
}

/// Wire decoding failures.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet truncated")]
    Truncated,

    #[error("checksum mismatch")]
    Checksum,

    #[error("unknown packet type {0:#04x}")]
    UnknownType(u8),

    #[error("tsdu length {declared} does not match payload of {actual} bytes")]
    Length { declared: usize, actual: usize },
}

/// Errors returned by the send path.
#[derive(thiserror::Error, Debug)]
pub enum SendError {
    #[error("send would block")]
    WouldBlock,

    #[error("message of {len} bytes exceeds maximum of {max}")]
    MessageTooLarge { len: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RateError> for SendError {
    fn from(_: RateError) -> Self {
        Self::WouldBlock
    }
}

/// Errors returned while constructing a session or binding its socket. Malformed packets are
/// dropped on receipt and never surface here.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
