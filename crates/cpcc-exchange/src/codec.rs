use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ExchangeError, Result};

/// Exchange header: kind (1) + endpoint id (1) = 2 bytes.
pub const HEADER_SIZE: usize = 2;

/// Largest possible exchange message on the wire (header + 4-byte payload).
pub const MAX_MESSAGE_SIZE: usize = HEADER_SIZE + 4;

/// Kind of an exchange message.
///
/// Each kind has a fixed payload size; both sides must agree on the
/// exact byte count per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExchangeKind {
    /// Query the daemon-side state of an endpoint. Payload: state enum (1 byte).
    EndpointStatusQuery = 0,
    /// Query the negotiated maximum write size. Payload: u32 LE (4 bytes).
    MaxWriteSizeQuery = 1,
    /// Exchange the protocol version. Payload: u8 version (1 byte).
    VersionQuery = 2,
    /// Request permission to open an endpoint. Payload: bool can-open (1 byte).
    OpenEndpoint = 3,
    /// Inform the daemon an endpoint was closed. No payload.
    CloseEndpoint = 4,
    /// Register the client's process id. Payload: u32 LE pid (4 bytes).
    SetPid = 5,
}

impl ExchangeKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::EndpointStatusQuery),
            1 => Some(Self::MaxWriteSizeQuery),
            2 => Some(Self::VersionQuery),
            3 => Some(Self::OpenEndpoint),
            4 => Some(Self::CloseEndpoint),
            5 => Some(Self::SetPid),
            _ => None,
        }
    }

    /// Fixed payload size for this kind.
    pub fn payload_len(self) -> usize {
        match self {
            Self::EndpointStatusQuery => 1,
            Self::MaxWriteSizeQuery => 4,
            Self::VersionQuery => 1,
            Self::OpenEndpoint => 1,
            Self::CloseEndpoint => 0,
            Self::SetPid => 4,
        }
    }

    /// Total wire size of a message of this kind.
    pub fn message_len(self) -> usize {
        HEADER_SIZE + self.payload_len()
    }
}

/// Daemon-side state of an endpoint, as carried in an
/// `EndpointStatusQuery` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndpointState {
    Open = 0,
    Closed = 1,
    Closing = 2,
    ErrorDestinationUnreachable = 3,
    ErrorSecurityIncident = 4,
    ErrorFault = 5,
}

impl EndpointState {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Open),
            1 => Some(Self::Closed),
            2 => Some(Self::Closing),
            3 => Some(Self::ErrorDestinationUnreachable),
            4 => Some(Self::ErrorSecurityIncident),
            5 => Some(Self::ErrorFault),
            _ => None,
        }
    }

    /// Whether this state reports a daemon-side fault.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::ErrorDestinationUnreachable | Self::ErrorSecurityIncident | Self::ErrorFault
        )
    }
}

/// One exchange message: the request/reply unit on both the control
/// socket and endpoint sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeMessage {
    pub kind: ExchangeKind,
    pub endpoint_id: u8,
    pub payload: Bytes,
}

impl ExchangeMessage {
    /// Create a message.
    ///
    /// The payload length must match the kind's fixed size; anything
    /// else is a programmer error (callers size buffers per kind).
    pub fn new(kind: ExchangeKind, endpoint_id: u8, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        assert_eq!(
            payload.len(),
            kind.payload_len(),
            "{kind:?} payload must be exactly {} bytes",
            kind.payload_len()
        );
        Self {
            kind,
            endpoint_id,
            payload,
        }
    }

    /// Version exchange carrying the library's compiled-in version.
    pub fn version_query(version: u8) -> Self {
        Self::new(ExchangeKind::VersionQuery, 0, vec![version])
    }

    /// Max-write-size query; the 4-byte payload is zeroed in the request.
    pub fn max_write_size_query() -> Self {
        Self::new(ExchangeKind::MaxWriteSizeQuery, 0, vec![0u8; 4])
    }

    /// Max-write-size reply carrying the negotiated size.
    pub fn max_write_size_reply(size: u32) -> Self {
        Self::new(ExchangeKind::MaxWriteSizeQuery, 0, size.to_le_bytes().to_vec())
    }

    /// Process-id registration. Send-only; the daemon does not reply.
    pub fn set_pid(pid: u32) -> Self {
        Self::new(ExchangeKind::SetPid, 0, pid.to_le_bytes().to_vec())
    }

    /// Open-permission request for endpoint `id`; the bool is zeroed.
    pub fn open_request(id: u8) -> Self {
        Self::new(ExchangeKind::OpenEndpoint, id, vec![0u8])
    }

    /// Open-permission reply.
    pub fn open_reply(id: u8, can_open: bool) -> Self {
        Self::new(ExchangeKind::OpenEndpoint, id, vec![u8::from(can_open)])
    }

    /// Close notification for endpoint `id`. The reply is an exact echo.
    pub fn close_request(id: u8) -> Self {
        Self::new(ExchangeKind::CloseEndpoint, id, Bytes::new())
    }

    /// State query for endpoint `id`; the state byte is zeroed.
    pub fn status_query(id: u8) -> Self {
        Self::new(ExchangeKind::EndpointStatusQuery, id, vec![0u8])
    }

    /// State reply for endpoint `id`.
    pub fn status_reply(id: u8, state: EndpointState) -> Self {
        Self::new(ExchangeKind::EndpointStatusQuery, id, vec![state as u8])
    }

    /// Total wire size of this message.
    pub fn wire_size(&self) -> usize {
        self.kind.message_len()
    }

    /// Encode into the wire format.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.wire_size());
        dst.put_u8(self.kind as u8);
        dst.put_u8(self.endpoint_id);
        dst.put_slice(&self.payload);
    }

    /// Encode into a freshly allocated buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_size());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode one received message.
    ///
    /// `buf` must hold exactly the fixed wire size for the message's
    /// kind; the transport never delivers partial messages, so any
    /// other count is a protocol failure.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let kind_byte = *buf
            .first()
            .ok_or(ExchangeError::Truncated { got: buf.len() })?;
        let kind = ExchangeKind::from_u8(kind_byte).ok_or(ExchangeError::UnknownKind(kind_byte))?;
        if buf.len() != kind.message_len() {
            return Err(ExchangeError::LengthMismatch {
                kind,
                expected: kind.message_len(),
                got: buf.len(),
            });
        }
        Ok(Self {
            kind,
            endpoint_id: buf[1],
            payload: Bytes::copy_from_slice(&buf[HEADER_SIZE..]),
        })
    }

    fn expect_kind(&self, expected: ExchangeKind) -> Result<()> {
        if self.kind != expected {
            return Err(ExchangeError::UnexpectedKind {
                expected,
                got: self.kind,
            });
        }
        Ok(())
    }

    /// Version carried by a `VersionQuery` reply.
    pub fn version(&self) -> Result<u8> {
        self.expect_kind(ExchangeKind::VersionQuery)?;
        Ok(self.payload[0])
    }

    /// Size carried by a `MaxWriteSizeQuery` reply.
    pub fn max_write_size(&self) -> Result<u32> {
        self.expect_kind(ExchangeKind::MaxWriteSizeQuery)?;
        let raw: [u8; 4] = self.payload[..4]
            .try_into()
            .map_err(|_| ExchangeError::LengthMismatch {
                kind: self.kind,
                expected: self.kind.message_len(),
                got: HEADER_SIZE + self.payload.len(),
            })?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Permission bit carried by an `OpenEndpoint` reply.
    pub fn can_open(&self) -> Result<bool> {
        self.expect_kind(ExchangeKind::OpenEndpoint)?;
        Ok(self.payload[0] != 0)
    }

    /// State carried by an `EndpointStatusQuery` reply.
    pub fn endpoint_state(&self) -> Result<EndpointState> {
        self.expect_kind(ExchangeKind::EndpointStatusQuery)?;
        EndpointState::from_u8(self.payload[0]).ok_or(ExchangeError::UnknownState(self.payload[0]))
    }
}

/// Decode the header-only `OpenEndpoint` acknowledgment the daemon
/// sends on a freshly connected endpoint socket. Returns the endpoint
/// id echoed in the header.
pub fn decode_open_ack(buf: &[u8]) -> Result<u8> {
    if buf.len() != HEADER_SIZE {
        return Err(ExchangeError::LengthMismatch {
            kind: ExchangeKind::OpenEndpoint,
            expected: HEADER_SIZE,
            got: buf.len(),
        });
    }
    let kind = ExchangeKind::from_u8(buf[0]).ok_or(ExchangeError::UnknownKind(buf[0]))?;
    if kind != ExchangeKind::OpenEndpoint {
        return Err(ExchangeError::UnexpectedKind {
            expected: ExchangeKind::OpenEndpoint,
            got: kind,
        });
    }
    Ok(buf[1])
}

/// Encode the header-only `OpenEndpoint` acknowledgment (daemon side).
pub fn encode_open_ack(id: u8, dst: &mut BytesMut) {
    dst.reserve(HEADER_SIZE);
    dst.put_u8(ExchangeKind::OpenEndpoint as u8);
    dst.put_u8(id);
}
