//! Control channel: the per-session request/reply socket.
//!
//! One seqpacket connection to the daemon's control socket carries the
//! session handshake and all endpoint lifecycle requests. A single
//! mutex serializes callers onto a strict one-in-flight-exchange model:
//! the guard is held for the full send+receive pair, so a second
//! thread blocks until the first thread's reply has been consumed.

use std::path::Path;
use std::sync::Mutex;

use cpcc_exchange::{EndpointState, ExchangeKind, ExchangeMessage, MAX_MESSAGE_SIZE};
use cpcc_transport::SeqPacketSocket;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::{paths, CTRL_SOCKET_TIMEOUT, PROTOCOL_VERSION};

/// The session's connection to the daemon's control socket.
///
/// Created by [`connect`](Self::connect) and usable once
/// [`handshake`](Self::handshake) has completed. Dropping the channel
/// closes the socket.
pub struct ControlChannel {
    socket: Mutex<SeqPacketSocket>,
    max_write_size: usize,
}

impl ControlChannel {
    /// Connect to the per-instance control socket.
    ///
    /// An absent path means the daemon is not running (or the secondary
    /// has not come up) and is reported as [`Error::NotFound`];
    /// a refused connection surfaces as a transport error.
    pub fn connect(socket_dir: &Path, instance_name: &str) -> Result<Self> {
        let path = paths::control_socket(socket_dir, instance_name);
        if !path.exists() {
            return Err(Error::NotFound { path });
        }

        let socket = SeqPacketSocket::connect(&path)?;
        socket.set_read_timeout(Some(CTRL_SOCKET_TIMEOUT))?;

        debug!(?path, "control channel connected");
        Ok(Self {
            socket: Mutex::new(socket),
            max_write_size: 0,
        })
    }

    /// Perform the session handshake: register the process id (no
    /// reply), query the negotiated max write size, then exchange
    /// protocol versions. Any socket error here is fatal to channel
    /// construction.
    pub fn handshake(&mut self) -> Result<()> {
        self.send_only(&ExchangeMessage::set_pid(std::process::id()))?;

        let reply = self.exchange(&ExchangeMessage::max_write_size_query())?;
        self.max_write_size = reply.max_write_size()? as usize;
        trace!(max_write_size = self.max_write_size, "negotiated max write size");

        let reply = self.exchange(&ExchangeMessage::version_query(PROTOCOL_VERSION))?;
        let theirs = reply.version()?;
        if theirs != PROTOCOL_VERSION {
            return Err(Error::VersionMismatch {
                ours: PROTOCOL_VERSION,
                theirs,
            });
        }

        debug!(version = PROTOCOL_VERSION, "handshake complete");
        Ok(())
    }

    /// Negotiated maximum write size. Cached at handshake; no I/O.
    pub fn max_write_size(&self) -> usize {
        self.max_write_size
    }

    /// Ask the daemon for permission to open endpoint `id`.
    ///
    /// `false` means the daemon refused (endpoint not opened on the
    /// secondary, or a reserved endpoint) rather than a transport failure.
    pub fn request_open_endpoint(&self, id: u8) -> Result<bool> {
        validate_endpoint_id(id)?;
        trace!(id, "requesting endpoint open");
        let reply = self.exchange(&ExchangeMessage::open_request(id))?;
        Ok(reply.can_open()?)
    }

    /// Inform the daemon that endpoint `id` was closed.
    ///
    /// The only success condition is an exact echo of the fixed-size
    /// close message.
    pub fn request_close_endpoint(&self, id: u8) -> Result<()> {
        validate_endpoint_id(id)?;
        trace!(id, "requesting endpoint close");
        let reply = self.exchange(&ExchangeMessage::close_request(id))?;
        if reply.kind != ExchangeKind::CloseEndpoint {
            return Err(Error::Protocol("close reply carried an unexpected kind"));
        }
        Ok(())
    }

    /// Query the daemon-side state of endpoint `id`.
    pub fn query_endpoint_state(&self, id: u8) -> Result<EndpointState> {
        validate_endpoint_id(id)?;
        let reply = self.exchange(&ExchangeMessage::status_query(id))?;
        Ok(reply.endpoint_state()?)
    }

    /// One atomic control exchange: lock, send, receive, unlock.
    ///
    /// The guard spans the whole round trip and is released on every
    /// path when it goes out of scope, error paths included.
    fn exchange(&self, request: &ExchangeMessage) -> Result<ExchangeMessage> {
        let wire = request.to_bytes();
        let mut reply = [0u8; MAX_MESSAGE_SIZE];

        // Exchange messages are self-contained, so a poisoned lock
        // (some thread panicked between exchanges) leaves the socket
        // coherent; recover rather than propagate the poison.
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let sent = socket.send(&wire)?;
        if sent != wire.len() {
            return Err(Error::Protocol("seqpacket transport performed a partial send"));
        }

        let received = socket.recv(&mut reply)?;
        drop(socket);

        if received == 0 {
            return Err(Error::ConnectionReset);
        }
        Ok(ExchangeMessage::decode(&reply[..received])?)
    }

    /// Fire-and-forget message; the daemon sends no reply.
    fn send_only(&self, request: &ExchangeMessage) -> Result<()> {
        let wire = request.to_bytes();
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let sent = socket.send(&wire)?;
        if sent != wire.len() {
            return Err(Error::Protocol("seqpacket transport performed a partial send"));
        }
        Ok(())
    }
}

/// Endpoint id 0 addresses the control plane itself; no endpoint
/// operation may name it.
fn validate_endpoint_id(id: u8) -> Result<()> {
    if id == 0 {
        return Err(Error::InvalidArgument(
            "endpoint id 0 is reserved for the control plane",
        ));
    }
    Ok(())
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("max_write_size", &self.max_write_size)
            .finish_non_exhaustive()
    }
}
