//! Error types for topology, emitter and consumer operations.
//!
//! Each operation family gets its own enum so callers can tell a failed
//! setup (fatal) from a failed publish (retryable at the caller's discretion)
//! or a consumer loop that was cancelled.

use thiserror::Error;

use crate::consumer::ConsumerState;
use crate::topology::MAX_KEY_LENGTH;

/// Malformed routing key or binding pattern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("key is {0} bytes long, the limit is {max}", max = MAX_KEY_LENGTH)]
    TooLong(usize),

    #[error("segment `{segment}` mixes a wildcard with literal characters")]
    MixedWildcard { segment: String },
}

/// Failure reported by a broker capability (connection or channel).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("channel or connection is closed")]
    Closed,

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("resource locked: {0}")]
    ResourceLocked(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("broker did not confirm the publish")]
    Nacked,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Exchange or queue declaration failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeclareError {
    #[error("`{name}` already exists with different attributes: {reason}")]
    Conflict { name: String, reason: String },

    #[error("queue `{name}` is exclusive to another connection")]
    Locked { name: String },

    #[error(transparent)]
    Broker(BrokerError),
}

impl DeclareError {
    /// Classify a broker-side declaration failure for the entity `name`.
    pub fn from_broker(name: &str, err: BrokerError) -> Self {
        match err {
            BrokerError::PreconditionFailed(reason) => DeclareError::Conflict {
                name: name.to_string(),
                reason,
            },
            BrokerError::ResourceLocked(_) => DeclareError::Locked {
                name: name.to_string(),
            },
            other => DeclareError::Broker(other),
        }
    }
}

impl From<DeclareError> for BrokerError {
    fn from(err: DeclareError) -> Self {
        match err {
            DeclareError::Conflict { name, reason } => {
                BrokerError::PreconditionFailed(format!("{name}: {reason}"))
            }
            DeclareError::Locked { name } => BrokerError::ResourceLocked(name),
            DeclareError::Broker(inner) => inner,
        }
    }
}

/// Failure while acquiring a channel or declaring the topology an emitter
/// or consumer needs before it can run.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to open channel")]
    Channel(#[source] BrokerError),

    #[error("failed to configure channel")]
    Configure(#[source] BrokerError),

    #[error("failed to declare {entity} `{name}`")]
    Declare {
        entity: &'static str,
        name: String,
        #[source]
        source: DeclareError,
    },
}

/// Per-message publish failure. The emitter never retries.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("invalid routing key")]
    InvalidRoutingKey(#[from] PatternError),

    #[error("failed to serialize message body")]
    Serialize(#[from] serde_json::Error),

    #[error("broker rejected message for `{exchange}` with routing key `{routing_key}`")]
    Nacked {
        exchange: String,
        routing_key: String,
    },

    #[error("failed to publish")]
    Broker(#[source] BrokerError),
}

/// An operation was attempted in a consumer state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {operation} while consumer is {state:?}")]
pub struct StateError {
    pub operation: &'static str,
    pub state: ConsumerState,
}

/// Binding a queue to an exchange failed.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("invalid binding pattern")]
    InvalidPattern(#[from] PatternError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("broker rejected binding")]
    Broker(#[source] BrokerError),
}

impl From<BrokerError> for BindError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::NotFound(what) => BindError::NotFound(what),
            other => BindError::Broker(other),
        }
    }
}

/// Terminal outcome of a consumer's receive loop.
#[derive(Debug, Error)]
pub enum ListenError {
    #[error("failed to bind queue")]
    Bind(#[from] BindError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("consumer cancelled: channel or connection closed")]
    Cancelled,

    #[error("delivery failed")]
    Broker(#[source] BrokerError),

    #[error("handler failed for delivery {delivery_tag}")]
    Handler {
        delivery_tag: u64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("failed to acknowledge delivery {delivery_tag}")]
    Ack {
        delivery_tag: u64,
        #[source]
        source: BrokerError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declare_error_from_precondition() {
        let err = DeclareError::from_broker(
            "logs_topic",
            BrokerError::PreconditionFailed("durable mismatch".to_string()),
        );
        assert_eq!(
            err,
            DeclareError::Conflict {
                name: "logs_topic".to_string(),
                reason: "durable mismatch".to_string(),
            }
        );
    }

    #[test]
    fn test_declare_error_passes_other_failures_through() {
        let err = DeclareError::from_broker("logs_topic", BrokerError::Closed);
        assert_eq!(err, DeclareError::Broker(BrokerError::Closed));
    }

    #[test]
    fn test_bind_error_maps_not_found() {
        let err = BindError::from(BrokerError::NotFound("queue q".to_string()));
        assert!(matches!(err, BindError::NotFound(ref what) if what == "queue q"));
    }
}
