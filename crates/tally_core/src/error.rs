//! Runtime and protocol error types.

use std::time::Duration;

use crate::frame::Tag;

/// Violations of the wire protocol. Any of these is fatal to the connection
/// on which it was observed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// A frame header declared a payload larger than the configured limit.
    #[error("Payload of {len} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge { len: u64, max: u32 },

    /// A second payload arrived for a tag that was already delivered.
    #[error("Duplicate delivery for tag {0}")]
    DuplicateTag(Tag),

    /// The handshake preamble named a party that is not in the party list.
    #[error("Handshake from unknown party {0}")]
    UnknownPeer(u8),

    /// The handshake preamble named a party that must not dial us, or whose
    /// slot is already taken.
    #[error("Unexpected handshake from party {0}")]
    UnexpectedPeer(u8),
}

/// Errors surfaced by the runtime to its caller.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// A wire protocol violation.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An I/O error on a socket or listener.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Value (de)serialization failed.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_cbor::Error),

    /// `feed` was given a node that does not belong to this runtime.
    #[error("Variable {0} does not exist")]
    UnknownVariable(String),

    /// `feed` was given an operator node instead of a variable.
    #[error("Node {0} is not a variable")]
    NotAVariable(String),

    /// A node was sent before it had been resolved.
    #[error("Variable {0} has to be fed first")]
    Unresolved(String),

    /// `feed` was called a second time in the same session, or was given a
    /// variable that is already resolved.
    #[error("Inputs were already fed: {0}")]
    AlreadyFed(String),

    /// A receive was requested twice for the same tag on one connection.
    #[error("Tag {0} was already requested")]
    AlreadyRequested(Tag),

    /// An operation that needs the session barrier ran before `connect`.
    #[error("Runtime is not connected")]
    NotConnected,

    /// `connect` was called while another `connect` is still running.
    #[error("Connect already in progress")]
    ConnectInProgress,

    /// The session was shut down; a runtime hosts a single session.
    #[error("Session already shut down")]
    SessionClosed,

    /// The connection to the peer is already closed.
    #[error("Connection to party {0} closed")]
    ConnectionClosed(u8),

    /// A node's sequence tag does not fit the 16-bit wire field.
    #[error("Sequence tag {0} does not fit in 16 bits")]
    TagOverflow(u32),

    /// Operand shapes cannot be broadcast together.
    #[error("Shape error: {0}")]
    Shape(String),

    /// The session barrier was not reached in time.
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// A node did not resolve in time.
    #[error("Node {label} (tag {tag}) unresolved after {after:?}")]
    ResolveTimeout {
        tag: u32,
        label: String,
        after: Duration,
    },

    /// The party list or local identity is invalid.
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;
