//! Error types for the RTP tools library.

use std::fmt;

use crate::codec::DecodeError;

/// Errors that can occur in the RTP tools library.
///
/// Variants map to the failure classes of the tool suite:
///
/// - **Malformed packet**: [`Decode`](Self::Decode), never fatal; the caller
///   drops or reports the packet.
/// - **Resource exhaustion**: [`TooManyDescriptors`](Self::TooManyDescriptors).
/// - **Configuration**: [`InvalidEndpoint`](Self::InvalidEndpoint),
///   [`InvalidCaptureHeader`](Self::InvalidCaptureHeader),
///   [`InvalidProfile`](Self::InvalidProfile).
/// - **Transient I/O**: [`Io`](Self::Io).
/// - **Reactor lifecycle**: [`ReactorStopped`](Self::ReactorStopped).
#[derive(Debug, thiserror::Error)]
pub enum RtpError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A packet or capture record could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A `host/port[/ttl]` string could not be parsed or resolved.
    #[error("invalid endpoint {input:?}: {kind}")]
    InvalidEndpoint {
        input: String,
        kind: EndpointErrorKind,
    },

    /// The capture file does not start with a valid `#!rtpplay1.0` preamble.
    #[error("invalid capture header: {0}")]
    InvalidCaptureHeader(String),

    /// A payload-rate profile line could not be parsed.
    #[error("invalid profile line {line}: {reason}")]
    InvalidProfile { line: usize, reason: String },

    /// The reactor's descriptor table is full.
    #[error("descriptor table full ({0} registrations)")]
    TooManyDescriptors(usize),

    /// [`Reactor::run`](crate::reactor::Reactor::run) was called on a reactor
    /// that has already stopped and was not reset.
    #[error("reactor already stopped")]
    ReactorStopped,
}

/// Specific kind of endpoint parse failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointErrorKind {
    /// No `/` separating host and port.
    MissingPort,
    /// Port is not a number in `0..=65535`.
    InvalidPort,
    /// Port is odd where an even RTP port is required.
    OddPort,
    /// TTL is not a number in `0..=255`.
    InvalidTtl,
    /// Host name did not resolve to an IPv4 address.
    UnresolvedHost,
}

impl fmt::Display for EndpointErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPort => write!(f, "missing /port"),
            Self::InvalidPort => write!(f, "invalid port"),
            Self::OddPort => write!(f, "port must be even"),
            Self::InvalidTtl => write!(f, "invalid ttl"),
            Self::UnresolvedHost => write!(f, "host does not resolve to IPv4"),
        }
    }
}

/// Convenience alias for `Result<T, RtpError>`.
pub type Result<T> = std::result::Result<T, RtpError>;
