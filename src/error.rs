//! Error types for the topic registry and bus.
//!
//! `BusError` is the single error type returned by every public operation on
//! [`PubSub`](crate::pubsub::PubSub), the [`Relay`](crate::relay::Relay) and
//! the configuration loader. It is built with `thiserror` so that lower-level
//! failures convert with `?`.
//!
//! ## Error Categories
//!
//! - **`Registration`**: A `register` call was rejected (duplicate unique id,
//!   handler bound to an undeclared setting, invalid declaration). Nothing from
//!   the failed call is left behind.
//! - **`Validation`**: A value failed its topic's metadata contract. The
//!   retained value and subscribers are untouched.
//! - **`TopicNotFound`**: The path does not exist, or a query found no retained
//!   value and no default was supplied.
//! - **`CapabilityOperationOnUnknown`**: A capability append/remove named an
//!   identity that is not registered. Device teardown races make this routine,
//!   so the bus logs it and carries on; the variant exists for callers that
//!   ask explicitly.
//! - **`RelayTimeout`**: A blocking relay request was not serviced in time.
//!   The event stays queued and will still be dispatched.
//! - **`UndoFailed`**: One or more inverses of an undo group failed. The rest
//!   of the group was still applied.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the bus error type.
pub type BusResult<T> = std::result::Result<T, BusError>;

/// A value rejected by a [`Metadata`](crate::metadata::Metadata) contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    /// Build a validation error from any displayable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Primary error type for the bus.
#[derive(Error, Debug)]
pub enum BusError {
    /// Registration was rejected; no partial state was retained.
    #[error("Registration error: {0}")]
    Registration(String),

    /// A published or default value failed validation.
    #[error("Validation error on '{topic}': {source}")]
    Validation {
        /// Topic the value was destined for.
        topic: String,
        /// Underlying metadata failure.
        #[source]
        source: ValidationError,
    },

    /// The topic does not exist, or holds no retained value.
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// A value was published to a `node` topic.
    #[error("Topic '{0}' is a node and cannot hold a value")]
    NodeNotPublishable(String),

    /// A topic already exists with different metadata, or a leaf sits where a
    /// node is required.
    #[error("Topic conflict at '{path}': {reason}")]
    TopicConflict {
        /// Conflicting path.
        path: String,
        /// What collided.
        reason: String,
    },

    /// The path is empty or contains empty segments.
    #[error("Invalid topic path '{0}'")]
    InvalidPath(String),

    /// The topic is flagged read-only and the caller is not its owner.
    #[error("Topic '{0}' is read-only")]
    ReadOnly(String),

    /// A metadata declaration is malformed.
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    /// No object is registered under this unique id.
    #[error("No object registered as '{0}'")]
    NotRegistered(String),

    /// Capability append/remove targeted an unregistered identity.
    #[error("Capability operation on unknown object '{0}'")]
    CapabilityOperationOnUnknown(String),

    /// A setting, action or callback handler reported a failure.
    #[error("Handler for '{topic}' failed: {message}")]
    Handler {
        /// Topic being dispatched.
        topic: String,
        /// Handler-provided reason.
        message: String,
    },

    /// A blocking relay request was not serviced before its deadline.
    #[error("Relay request for '{topic}' timed out after {timeout:?}")]
    RelayTimeout {
        /// Topic of the request.
        topic: String,
        /// Deadline that expired.
        timeout: Duration,
    },

    /// The dispatch context dropped the relay or the completion signal.
    #[error("Relay closed")]
    RelayClosed,

    /// Some inverses of an undo (or forwards of a redo) group failed.
    #[error("Undo group partially failed: {} error(s)", .0.len())]
    UndoFailed(Vec<BusError>),

    /// Configuration values parsed but are semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration could not be extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl From<figment::Error> for BusError {
    fn from(value: figment::Error) -> Self {
        BusError::Config(Box::new(value))
    }
}

impl BusError {
    /// Shorthand for a handler failure.
    pub fn handler(topic: impl Into<String>, message: impl Into<String>) -> Self {
        BusError::Handler {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Attach a topic to a validation failure.
    pub fn validation(topic: impl Into<String>, source: ValidationError) -> Self {
        BusError::Validation {
            topic: topic.into(),
            source,
        }
    }
}
