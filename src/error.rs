//! Error taxonomy for the transport layer
//!
//! Errors split into two worlds that must never mix:
//!
//! - **Setup and usage errors** (`NetError`) are returned to the caller as an
//!   explicit `Result`, who decides how fatal they are. A server that cannot
//!   bind its listener usually treats that as fatal; a client that cannot
//!   connect usually does not.
//! - **Transport failures** (`DisconnectReason`) are always recovered locally:
//!   they surface as a single `on_disconnect` callback during the synchronize
//!   pass and the socket is torn down. They never cross the reactor/application
//!   thread boundary as an error value.

use std::fmt;
use std::io;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NetError>;

/// Errors reported directly to the caller.
#[derive(Debug, Error)]
pub enum NetError {
    /// Address resolution, bind, listen or connect failed.
    #[error("socket setup failed: {source}")]
    Setup {
        #[source]
        source: io::Error,
    },

    /// A host name resolved to no usable address.
    #[error("could not resolve {host}:{port}")]
    Resolve { host: String, port: u16 },

    /// A framing violation on the sender side (payload exceeds the limit).
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// A bounded resource (broadcast pool, socket table) ran out of capacity.
    ///
    /// This is a designed, observable condition rather than silent growth;
    /// callers may retry next tick or raise their configured limits.
    #[error("{what} exhausted (capacity {capacity})")]
    Exhausted { what: &'static str, capacity: usize },

    /// The operation referenced a socket that is not live.
    ///
    /// Covers stale generation-checked handles as well as sockets that were
    /// never connected or have already been scheduled for closing.
    #[error("socket is not connected or already closed")]
    Closed,
}

/// A violation of the length-prefix wire format.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The length prefix exceeds the configured maximum frame size.
    ///
    /// Treated as a protocol error, not an allocation request: no payload
    /// buffer is allocated for an oversized prefix.
    #[error("frame length {len} exceeds maximum {max}")]
    Oversized { len: usize, max: usize },
}

/// Why a connection went away.
///
/// Delivered exactly once per failed socket through
/// [`SocketEvents::on_disconnect`](crate::events::SocketEvents::on_disconnect).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer shut the connection down in an orderly fashion.
    GracefulEof,
    /// The connection was reset or aborted by the peer or the network.
    Reset,
    /// The socket never reached the connected state.
    NotConnected,
    /// The peer violated the wire format (oversized or malformed frame).
    ProtocolViolation,
    /// Any transport failure that does not fit the categories above.
    Unknown,
}

impl DisconnectReason {
    /// Classifies an OS error from a failed transfer.
    pub(crate) fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => DisconnectReason::Reset,
            io::ErrorKind::UnexpectedEof => DisconnectReason::GracefulEof,
            io::ErrorKind::NotConnected | io::ErrorKind::ConnectionRefused => {
                DisconnectReason::NotConnected
            }
            _ => DisconnectReason::Unknown,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::GracefulEof => "peer disconnected gracefully",
            DisconnectReason::Reset => "connection reset",
            DisconnectReason::NotConnected => "not connected",
            DisconnectReason::ProtocolViolation => "protocol violation",
            DisconnectReason::Unknown => "unknown transport failure",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(DisconnectReason::from_io(&reset), DisconnectReason::Reset);

        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(
            DisconnectReason::from_io(&refused),
            DisconnectReason::NotConnected
        );

        let other = io::Error::from(io::ErrorKind::OutOfMemory);
        assert_eq!(DisconnectReason::from_io(&other), DisconnectReason::Unknown);
    }

    #[test]
    fn test_setup_carries_io_source() {
        // OS-level failures reach the caller as Setup, with the original
        // error preserved as the source.
        let err = NetError::Setup {
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().starts_with("socket setup failed"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_frame_error_display() {
        let err = FrameError::Oversized { len: 5000, max: 1024 };
        assert_eq!(err.to_string(), "frame length 5000 exceeds maximum 1024");
    }
}
