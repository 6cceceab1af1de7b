use crate::codec::ExchangeKind;

/// Errors that can occur during exchange message encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// The kind byte does not name a known exchange message.
    #[error("unknown exchange kind byte 0x{0:02x}")]
    UnknownKind(u8),

    /// The buffer ends before the exchange header is complete.
    #[error("message of {got} bytes is too short for the exchange header")]
    Truncated { got: usize },

    /// The received byte count does not match the fixed size for the kind.
    #[error("{kind:?} message must be {expected} bytes, got {got}")]
    LengthMismatch {
        kind: ExchangeKind,
        expected: usize,
        got: usize,
    },

    /// A reply carried a different kind than the request.
    #[error("expected {expected:?} reply, got {got:?}")]
    UnexpectedKind {
        expected: ExchangeKind,
        got: ExchangeKind,
    },

    /// The state byte does not name a known endpoint state.
    #[error("unknown endpoint state byte 0x{0:02x}")]
    UnknownState(u8),
}

pub type Result<T> = std::result::Result<T, ExchangeError>;
