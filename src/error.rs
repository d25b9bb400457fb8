//! Error types for udrpc.

use std::fmt;

/// Error type for udrpc operations.
///
/// Datapath methods return these synchronously; they never panic on peer
/// misbehavior. Only `Rpc::new` failures are unrecoverable.
#[derive(Debug)]
pub enum Error {
    /// Huge-page region reservation failed at construction.
    HugeAllocFailed(std::io::Error),
    /// Invalid configuration.
    InvalidConfig(String),
    /// An endpoint with this RPC ID is already registered at the Nexus.
    DuplicateRpcId(u8),
    /// The remote host is not reachable over the session-management channel.
    NoSuchRemote(String),
    /// Session number is out of range or refers to a buried session.
    InvalidSessionNum(u16),
    /// Session exists but is not connected.
    SessionNotConnected(u16),
    /// Operation requires the opposite session role.
    InvalidSessionRole(u16),
    /// Session still has in-flight requests.
    SessionBusy(u16),
    /// The session table is full.
    NoFreeSessions,
    /// All request slots of the session are in flight.
    NoFreeSlots(u16),
    /// The message buffer is invalid (null, bad magic, or not dynamic).
    InvalidMsgBuffer,
    /// Message exceeds the maximum message size.
    MessageTooLarge { size: usize, max: usize },
    /// Called from a thread other than the endpoint's creator.
    WrongThread,
    /// Routing info could not be resolved.
    RoutingResolution,
    /// The Nexus has no background threads.
    NoBgThreads,
    /// Invalid packet type discriminator.
    InvalidPacketType(u8),
    /// Invalid magic in a packet header.
    InvalidMagic { expected: u8, got: u8 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::HugeAllocFailed(e) => write!(f, "huge-page reservation failed: {}", e),
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Error::DuplicateRpcId(id) => write!(f, "RPC ID {} already registered", id),
            Error::NoSuchRemote(host) => write!(f, "no route to remote host {}", host),
            Error::InvalidSessionNum(n) => write!(f, "invalid session number {}", n),
            Error::SessionNotConnected(n) => write!(f, "session {} is not connected", n),
            Error::InvalidSessionRole(n) => write!(f, "wrong role for session {}", n),
            Error::SessionBusy(n) => write!(f, "session {} has in-flight requests", n),
            Error::NoFreeSessions => write!(f, "session table is full"),
            Error::NoFreeSlots(n) => write!(f, "no free request slots on session {}", n),
            Error::InvalidMsgBuffer => write!(f, "invalid message buffer"),
            Error::MessageTooLarge { size, max } => {
                write!(f, "message too large: {} bytes, max {} bytes", size, max)
            }
            Error::WrongThread => write!(f, "called from a non-creator thread"),
            Error::RoutingResolution => write!(f, "routing info resolution failed"),
            Error::NoBgThreads => write!(f, "the Nexus has no background threads"),
            Error::InvalidPacketType(t) => write!(f, "invalid packet type: {}", t),
            Error::InvalidMagic { expected, got } => {
                write!(f, "invalid magic: expected {:#x}, got {:#x}", expected, got)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::HugeAllocFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for udrpc operations.
pub type Result<T> = std::result::Result<T, Error>;
