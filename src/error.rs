//! Error types for udrpc.

use std::fmt;

/// Error type for udrpc operations.
#[derive(Debug)]
pub enum Error {
    /// IO error from the underlying socket or allocator.
    Io(std::io::Error),
    /// Session handle is out of range or refers to a buried session.
    InvalidSessionHandle(i32),
    /// Session exists but is not in a state that permits the operation.
    InvalidSessionState(u16),
    /// Session is not connected.
    SessionNotConnected(u16),
    /// No free session slot in the endpoint's session table.
    TooManySessions,
    /// All request slots on the session are in use.
    NoAvailableSlots,
    /// Session credits exhausted.
    NoCredits,
    /// The request type has no registered handlers.
    UnknownReqType(u8),
    /// Handlers for this request type are already registered.
    AlreadyRegistered(u8),
    /// Handler registration attempted after an endpoint was created.
    OpsFrozen,
    /// An endpoint with this app TID already exists on the Nexus.
    DuplicateAppTid(u32),
    /// Message size is zero or exceeds the maximum.
    InvalidMsgSize { size: usize, max: usize },
    /// The MsgBuffer failed its validity check.
    InvalidMsgBuffer,
    /// Buffer too small for the requested operation.
    BufferTooSmall { required: usize, available: usize },
    /// Invalid magic in a packet header.
    InvalidMagic { expected: u8, got: u8 },
    /// Invalid packet type byte on the wire.
    InvalidPacketType(u8),
    /// Invalid management packet type byte on the wire.
    InvalidSmPacketType(u8),
    /// Routing info could not be resolved into a transport address.
    RoutingResolution(String),
    /// Invalid configuration.
    InvalidConfig(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::InvalidSessionHandle(h) => write!(f, "Invalid session handle {}", h),
            Error::InvalidSessionState(n) => {
                write!(f, "Session {} is in the wrong state for this operation", n)
            }
            Error::SessionNotConnected(n) => write!(f, "Session {} is not connected", n),
            Error::TooManySessions => write!(f, "No free session slots in the session table"),
            Error::NoAvailableSlots => write!(f, "No available request slots on the session"),
            Error::NoCredits => write!(f, "Session credits exhausted"),
            Error::UnknownReqType(t) => write!(f, "No handlers registered for request type {}", t),
            Error::AlreadyRegistered(t) => {
                write!(f, "Handlers for request type {} already registered", t)
            }
            Error::OpsFrozen => {
                write!(f, "Handler registration is closed once an endpoint exists")
            }
            Error::DuplicateAppTid(tid) => {
                write!(f, "An endpoint with app TID {} already exists", tid)
            }
            Error::InvalidMsgSize { size, max } => {
                write!(f, "Invalid message size: {} bytes, max {} bytes", size, max)
            }
            Error::InvalidMsgBuffer => write!(f, "Invalid message buffer"),
            Error::BufferTooSmall { required, available } => {
                write!(
                    f,
                    "Buffer too small: required {} bytes, available {} bytes",
                    required, available
                )
            }
            Error::InvalidMagic { expected, got } => {
                write!(f, "Invalid magic: expected {:#x}, got {:#x}", expected, got)
            }
            Error::InvalidPacketType(t) => write!(f, "Invalid packet type: {}", t),
            Error::InvalidSmPacketType(t) => {
                write!(f, "Invalid management packet type: {}", t)
            }
            Error::RoutingResolution(msg) => write!(f, "Routing resolution failed: {}", msg),
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for udrpc operations.
pub type Result<T> = std::result::Result<T, Error>;
