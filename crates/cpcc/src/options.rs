//! Per-endpoint option configuration.
//!
//! Options form a closed, typed variant set with an explicit value
//! contract per variant; out-of-range values fail `InvalidArgument`
//! before any socket state is touched. Each variant maps to the
//! transport's own semantics: timeouts to `SO_RCVTIMEO`/`SO_SNDTIMEO`,
//! blocking mode to `O_NONBLOCK`, buffer sizing to `SO_SNDBUF`. The
//! max write size is negotiated at handshake and read-only.

use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};

/// An option together with its value, for [`Endpoint::set_option`] and
/// as returned by [`Endpoint::option`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionValue {
    /// Receive timeout; `None` blocks forever.
    ReceiveTimeout(Option<Duration>),
    /// Send timeout; `None` blocks forever.
    SendTimeout(Option<Duration>),
    /// Whether reads and writes block by default.
    Blocking(bool),
    /// Kernel send buffer size for the endpoint socket.
    SendBufferSize(usize),
    /// Negotiated maximum write size. Read-only.
    MaxWriteSize(usize),
}

/// Names the option to fetch with [`Endpoint::option`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionName {
    ReceiveTimeout,
    SendTimeout,
    Blocking,
    SendBufferSize,
    MaxWriteSize,
}

impl Endpoint {
    /// Apply one option to this endpoint.
    pub fn set_option(&self, value: OptionValue) -> Result<()> {
        match value {
            OptionValue::ReceiveTimeout(timeout) => {
                validate_timeout(timeout)?;
                self.socket().set_read_timeout(timeout)?;
            }
            OptionValue::SendTimeout(timeout) => {
                validate_timeout(timeout)?;
                self.socket().set_write_timeout(timeout)?;
            }
            OptionValue::Blocking(blocking) => {
                // The fcntl get/set pair must not interleave with
                // another option call on the same socket.
                let _guard = self
                    .lock
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                self.socket().set_nonblocking(!blocking)?;
            }
            OptionValue::SendBufferSize(size) => {
                if size == 0 || size > i32::MAX as usize {
                    return Err(Error::InvalidArgument(
                        "send buffer size must fit the kernel's int range",
                    ));
                }
                self.socket().set_send_buffer_size(size)?;
            }
            OptionValue::MaxWriteSize(_) => {
                return Err(Error::InvalidArgument(
                    "max write size is negotiated at handshake and read-only",
                ));
            }
        }
        Ok(())
    }

    /// Fetch the current value of one option.
    pub fn option(&self, name: OptionName) -> Result<OptionValue> {
        match name {
            OptionName::ReceiveTimeout => {
                Ok(OptionValue::ReceiveTimeout(self.socket().read_timeout()?))
            }
            OptionName::SendTimeout => {
                Ok(OptionValue::SendTimeout(self.socket().write_timeout()?))
            }
            OptionName::Blocking => Ok(OptionValue::Blocking(!self.socket().is_nonblocking()?)),
            OptionName::SendBufferSize => {
                Ok(OptionValue::SendBufferSize(self.socket().send_buffer_size()?))
            }
            OptionName::MaxWriteSize => Ok(OptionValue::MaxWriteSize(self.max_write_size()?)),
        }
    }
}

fn validate_timeout(timeout: Option<Duration>) -> Result<()> {
    if let Some(duration) = timeout {
        if duration.is_zero() {
            return Err(Error::InvalidArgument(
                "a zero timeout is ambiguous; use None to block forever",
            ));
        }
        if duration.as_secs() > i64::MAX as u64 {
            return Err(Error::InvalidArgument(
                "timeout seconds must fit the kernel's time_t range",
            ));
        }
    }
    Ok(())
}
