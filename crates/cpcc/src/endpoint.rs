//! Endpoint channel: one open logical data channel.
//!
//! Opening is a two-phase handshake. The control channel first asks the
//! daemon for permission; only on a positive answer does the client
//! connect a fresh seqpacket socket to the per-endpoint path and block
//! for the daemon's acknowledgment on that new socket. Because the ack
//! arrives on the data socket rather than the control socket, the
//! daemon is known to have wired this specific connection before any
//! data flows, and a stale or not-yet-listening path cannot be mistaken
//! for an open endpoint.

use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use cpcc_exchange::{decode_open_ack, MAX_MESSAGE_SIZE};
use cpcc_transport::SeqPacketSocket;
use tracing::{debug, trace, warn};

use crate::control::ControlChannel;
use crate::error::{Error, Result};
use crate::{paths, DEFAULT_ENDPOINT_SOCKET_SIZE, READ_MINIMUM_SIZE, SECURITY_ENDPOINT_ID};

/// Blocking behavior of a single read or write call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoMode {
    /// Block until data (or buffer space) is available.
    #[default]
    Blocking,
    /// Attempt once; report [`Error::WouldBlock`] instead of waiting.
    NonBlocking,
}

/// An open endpoint channel.
///
/// Holds its own data socket, independent of the control socket, and a
/// weak reference to the owning [`ControlChannel`] used only to look up
/// the shared max write size and to run the close handshake, never to
/// keep the channel alive. All methods take `&self`; reads and writes
/// may proceed concurrently, the kernel preserves message atomicity.
pub struct Endpoint {
    id: u8,
    socket: SeqPacketSocket,
    /// Serializes option read-modify-write sequences on the socket.
    pub(crate) lock: Mutex<()>,
    channel: Weak<ControlChannel>,
}

impl Endpoint {
    /// Run the open handshake for endpoint `id`.
    ///
    /// Any failure past the data-socket connect drops the socket on the
    /// way out; no descriptor or lock outlives an error return.
    pub(crate) fn open(
        channel: &Arc<ControlChannel>,
        socket_dir: &Path,
        instance_name: &str,
        id: u8,
    ) -> Result<Self> {
        debug!(id, "opening endpoint");

        if !channel.request_open_endpoint(id)? {
            return Err(if id == SECURITY_ENDPOINT_ID {
                warn!(id, "cannot open the security endpoint as a client");
                Error::PermissionDenied
            } else {
                debug!(id, "endpoint not opened on the secondary");
                Error::NotReady { id }
            });
        }

        let path = paths::endpoint_socket(socket_dir, instance_name, id);
        let socket = SeqPacketSocket::connect(&path)?;

        trace!(id, "connected, waiting for daemon ack");
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        let received = socket.recv(&mut buf)?;
        if received == 0 {
            return Err(Error::ConnectionReset);
        }
        decode_open_ack(&buf[..received])?;

        socket.set_send_buffer_size(DEFAULT_ENDPOINT_SOCKET_SIZE)?;

        debug!(id, "endpoint open");
        Ok(Self {
            id,
            socket,
            lock: Mutex::new(()),
            channel: Arc::downgrade(channel),
        })
    }

    /// This endpoint's id.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Negotiated maximum write size shared with the control channel.
    pub fn max_write_size(&self) -> Result<usize> {
        Ok(self.channel()?.max_write_size())
    }

    /// Receive one message into `buf`.
    ///
    /// `buf` must provide at least [`READ_MINIMUM_SIZE`] bytes so a
    /// full daemon message is never truncated. Zero bytes from the
    /// transport means the peer closed and is reported as
    /// [`Error::ConnectionReset`], never as an empty success. A
    /// would-block condition (non-blocking mode, or a configured
    /// receive timeout elapsing) is [`Error::WouldBlock`].
    pub fn read(&self, buf: &mut [u8], mode: IoMode) -> Result<usize> {
        if buf.len() < READ_MINIMUM_SIZE {
            return Err(Error::InvalidArgument(
                "read buffer must provide READ_MINIMUM_SIZE bytes",
            ));
        }

        let result = match mode {
            IoMode::Blocking => self.socket.recv(buf),
            IoMode::NonBlocking => self.socket.recv_nonblocking(buf),
        };
        match result {
            Ok(0) => {
                warn!(id = self.id, "connection closed by daemon");
                Err(Error::ConnectionReset)
            }
            Ok(n) => {
                trace!(id = self.id, bytes = n, "read");
                Ok(n)
            }
            Err(err) if would_block(&err) => Err(Error::WouldBlock),
            Err(err) => {
                warn!(id = self.id, error = %err, "read failed");
                Err(Error::Io(err))
            }
        }
    }

    /// Send one message.
    ///
    /// Data larger than the negotiated max write size is rejected
    /// before any socket I/O. The transport preserves message
    /// boundaries, so a successful send always transfers the full
    /// buffer; a partial count would be a broken transport and is
    /// surfaced as a protocol violation.
    pub fn write(&self, data: &[u8], mode: IoMode) -> Result<usize> {
        if data.is_empty() {
            return Err(Error::InvalidArgument("cannot write an empty message"));
        }
        if data.len() > self.max_write_size()? {
            return Err(Error::InvalidArgument(
                "payload exceeds the negotiated max write size",
            ));
        }

        let result = match mode {
            IoMode::Blocking => self.socket.send(data),
            IoMode::NonBlocking => self.socket.send_nonblocking(data),
        };
        match result {
            Ok(n) if n == data.len() => {
                trace!(id = self.id, bytes = n, "wrote");
                Ok(n)
            }
            Ok(_) => Err(Error::Protocol("seqpacket transport performed a partial send")),
            Err(err) if would_block(&err) => Err(Error::WouldBlock),
            Err(err) => {
                warn!(id = self.id, error = %err, "write failed");
                Err(Error::Io(err))
            }
        }
    }

    /// Close the endpoint.
    ///
    /// Consumes the channel: the local data socket closes first,
    /// unconditionally, then the daemon is informed through the
    /// control-channel close handshake. Fails [`Error::InvalidState`]
    /// if the session was already torn down.
    pub fn close(self) -> Result<()> {
        debug!(id = self.id, "closing endpoint");
        let Self {
            id,
            socket,
            channel,
            ..
        } = self;
        drop(socket);
        let channel = channel.upgrade().ok_or(Error::InvalidState)?;
        channel.request_close_endpoint(id)
    }

    pub(crate) fn socket(&self) -> &SeqPacketSocket {
        &self.socket
    }

    fn channel(&self) -> Result<Arc<ControlChannel>> {
        self.channel.upgrade().ok_or(Error::InvalidState)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

pub(crate) fn would_block(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
