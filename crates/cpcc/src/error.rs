use std::path::PathBuf;

/// Errors that can occur in CPC client operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The daemon's control socket path does not exist.
    #[error(
        "control socket {path} not found: the daemon is not started, \
         the reset sequence is not done, or the secondary is not responsive"
    )]
    NotFound { path: PathBuf },

    /// Transport-level error (connect refused, bind, raw I/O).
    #[error("transport error: {0}")]
    Transport(#[from] cpcc_transport::TransportError),

    /// Malformed or unexpected exchange message.
    #[error("exchange error: {0}")]
    Exchange(#[from] cpcc_exchange::ExchangeError),

    /// The peer violated the exchange protocol.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// The daemon closed the connection mid-exchange.
    #[error("connection reset by daemon")]
    ConnectionReset,

    /// Library and daemon protocol versions differ.
    #[error("library protocol version {ours} does not match daemon version {theirs}")]
    VersionMismatch { ours: u8, theirs: u8 },

    /// The security endpoint cannot be opened by a client.
    #[error("permission denied: the security endpoint is reserved for the daemon")]
    PermissionDenied,

    /// The endpoint is not opened on the secondary yet.
    #[error("endpoint {id} is not opened on the secondary")]
    NotReady { id: u8 },

    /// A caller-supplied value is out of contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The session or endpoint was invalidated (reset or teardown).
    #[error("session or endpoint is no longer usable")]
    InvalidState,

    /// A non-blocking attempt found no data or no buffer space.
    #[error("operation would block")]
    WouldBlock,

    /// An I/O error occurred on a socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
