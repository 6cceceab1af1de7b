//! Fixed binary exchange codec for the CPC client.
//!
//! Both the control socket and every endpoint socket carry the same
//! wire unit: a 2-byte header (message kind, endpoint id) followed by
//! a payload whose length is fixed per kind, never length-prefixed.
//! The transport delivers whole messages, so decoding validates that
//! the received byte count exactly matches the expected size; any
//! other count is a protocol failure, not a short read to retry.

pub mod codec;
pub mod error;

pub use codec::{
    decode_open_ack, encode_open_ack, EndpointState, ExchangeKind, ExchangeMessage, HEADER_SIZE,
    MAX_MESSAGE_SIZE,
};
pub use error::{ExchangeError, Result};
