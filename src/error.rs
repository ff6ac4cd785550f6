//! Error type for the transport.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Error type for the transport.
#[derive(Clone, Debug)]
pub enum Error {
    /// The request context was cancelled by the caller.
    Cancelled,

    /// Connection was already closed.
    ConnectionClosed,

    /// The request context's deadline expired.
    DeadlineExceeded,

    /// Dialing the upstream gave an error.
    Dial(Arc<std::io::Error>),

    /// Dialing the upstream took too long.
    DialTimeout,

    /// A pipeline connection was retired after exhausting its query id
    /// budget.
    EndOfLife,

    /// A stream was closed because it sat idle for too long.
    StreamIdleTimeout,

    /// Reading from a stream gave an error.
    StreamReadError(Arc<std::io::Error>),

    /// Reading from a stream took too long.
    StreamReadTimeout,

    /// Error receiving a reply from a background worker.
    StreamReceiveError,

    /// Writing to a stream gave an error.
    StreamWriteError(Arc<std::io::Error>),

    /// Writing to a stream took too long.
    StreamWriteTimeout,

    /// Operation attempted on a closed transport, or serviced by a
    /// connection that was closed as part of transport closure.
    TransportClosed,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Error::Cancelled => write!(f, "request cancelled"),
            Error::ConnectionClosed => write!(f, "connection closed"),
            Error::DeadlineExceeded => write!(f, "deadline exceeded"),
            Error::Dial(_) => write!(f, "error dialing upstream"),
            Error::DialTimeout => write!(f, "timeout dialing upstream"),
            Error::EndOfLife => write!(f, "connection end of life"),
            Error::StreamIdleTimeout => {
                write!(f, "stream was idle for too long")
            }
            Error::StreamReadError(_) => {
                write!(f, "error reading from stream")
            }
            Error::StreamReadTimeout => {
                write!(f, "timeout reading from stream")
            }
            Error::StreamReceiveError => write!(f, "error receiving a reply"),
            Error::StreamWriteError(_) => {
                write!(f, "error writing to stream")
            }
            Error::StreamWriteTimeout => {
                write!(f, "timeout writing to stream")
            }
            Error::TransportClosed => {
                write!(f, "transport has been closed")
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Cancelled => None,
            Error::ConnectionClosed => None,
            Error::DeadlineExceeded => None,
            Error::Dial(e) => Some(e),
            Error::DialTimeout => None,
            Error::EndOfLife => None,
            Error::StreamIdleTimeout => None,
            Error::StreamReadError(e) => Some(e),
            Error::StreamReadTimeout => None,
            Error::StreamReceiveError => None,
            Error::StreamWriteError(e) => Some(e),
            Error::StreamWriteTimeout => None,
            Error::TransportClosed => None,
        }
    }
}
