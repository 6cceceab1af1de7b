//! Client-side runtime for the Co-Processor Communication Protocol (CPC).
//!
//! A CPC daemon multiplexes logical channels ("endpoints") between host
//! processes and a secondary processor. This crate is the host-process
//! side: a passive, thread-safe library that negotiates a session over
//! one `SOCK_SEQPACKET` control socket and moves data over one
//! independent socket per open endpoint.
//!
//! Typical flow:
//!
//! ```no_run
//! use cpcc::{IoMode, Session, SessionConfig};
//!
//! let session = Session::initialize(SessionConfig::default())?;
//! let endpoint = session.open_endpoint(5)?;
//! endpoint.write(b"ping", IoMode::Blocking)?;
//! let mut buf = vec![0u8; cpcc::READ_MINIMUM_SIZE];
//! let n = endpoint.read(&mut buf, IoMode::Blocking)?;
//! endpoint.close()?;
//! # let _ = n;
//! # Ok::<(), cpcc::Error>(())
//! ```
//!
//! When the daemon resets (secondary processor rebooted), the client is
//! notified through the callback registered in [`SessionConfig`]; the
//! application then calls [`Session::restart`] to reconnect.

pub mod control;
pub mod endpoint;
pub mod error;
pub mod options;
pub mod paths;
mod reset;
pub mod session;

pub use control::ControlChannel;
pub use endpoint::{Endpoint, IoMode};
pub use error::{Error, Result};
pub use options::{OptionName, OptionValue};
pub use session::{ResetCallback, Session, SessionConfig};

pub use cpcc_exchange::EndpointState;

/// Instance name used when the configuration does not name one.
pub const DEFAULT_INSTANCE_NAME: &str = "cpcd_0";

/// Runtime directory the daemon creates its sockets under.
pub const DEFAULT_SOCKET_DIR: &str = "/dev/shm";

/// Compiled-in protocol version; the daemon's must match exactly.
pub const PROTOCOL_VERSION: u8 = 2;

/// Endpoint id reserved for the daemon's own security traffic.
/// A client is never permitted to open it.
pub const SECURITY_ENDPOINT_ID: u8 = 255;

/// Minimum capacity a read buffer must provide.
///
/// The daemon may deliver a message up to one full endpoint buffer in
/// size; smaller buffers would silently truncate a packet.
pub const READ_MINIMUM_SIZE: usize = 4087;

/// `SO_SNDBUF` applied to a freshly opened endpoint socket.
pub const DEFAULT_ENDPOINT_SOCKET_SIZE: usize = 4087;

/// Receive timeout applied to the control socket.
pub(crate) const CTRL_SOCKET_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Number of reconnection attempts [`Session::restart`] makes.
pub const RESTART_ATTEMPTS: u32 = 5;
