//! `SOCK_SEQPACKET` Unix domain socket transport.
//!
//! The CPC daemon speaks over sequenced-packet sockets: connection
//! oriented like a stream, but every `send` is delivered whole or not
//! at all. std's `UnixStream` only covers `SOCK_STREAM`, so this crate
//! owns the raw descriptors and exposes the handful of socket
//! operations the client runtime needs.
//!
//! This is the lowest layer of cpcc. Everything else builds on top of
//! the [`SeqPacketSocket`] type provided here.

pub mod error;

#[cfg(unix)]
pub mod seqpacket;

pub use error::{Result, TransportError};

#[cfg(unix)]
pub use seqpacket::{SeqPacketListener, SeqPacketSocket};
