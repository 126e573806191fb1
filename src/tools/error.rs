use thiserror::Error;

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, FluteError>;

/// Error conditions raised while decoding packets and reconstructing objects.
///
/// All protocol-level variants are local and recoverable: the affected packet
/// or object is dropped and the session keeps running. None of them should be
/// treated as fatal by the caller.
#[derive(Debug, Error)]
pub enum FluteError {
    /// The LCT header is structurally inconsistent, the packet is discarded.
    #[error("malformed LCT header: {0}")]
    MalformedHeader(String),

    /// A known extension header has an invalid internal layout.
    #[error("extension HET {het} has invalid layout (length {len})")]
    UnsupportedExtension { het: u8, len: usize },

    /// A symbol was re-delivered with different content. First-seen bytes win.
    #[error("TOI {toi} symbol {esi} re-delivered with different content")]
    InconsistentSymbol { toi: u128, esi: u64 },

    /// The per-TOI pending-symbol queue overflowed, the oldest symbol was dropped.
    #[error("pending symbol queue full for TOI {toi}, oldest symbol dropped")]
    PendingOverflow { toi: u128 },

    /// Opening a new object would exceed the session memory budget.
    #[error("session cache full: {requested} bytes requested, {available} available")]
    ResourceExhausted { requested: u64, available: u64 },

    /// A partial object exceeded the inactivity bound and was evicted.
    #[error("TOI {toi} evicted after inactivity timeout")]
    Timeout { toi: u128 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Message(String),
}

impl FluteError {
    /// Wrap any printable value into a generic error.
    pub fn new<T: ToString>(msg: T) -> Self {
        FluteError::Message(msg.to_string())
    }
}
