//! Event Relay - topic-exchange publish/consume core.
//!
//! Producers publish envelopes to a named topic exchange with a dotted
//! routing key; consumers bind queues to that exchange with wildcard
//! patterns and receive every envelope whose key matches.
//!
//! - `relay-emit`: publishes numbered test messages under a severity key
//! - `relay-listen`: binds patterns and logs what arrives
//!
//! ## Architecture
//!
//! ```text
//! Emitter → exchange ─(routing key ∼ binding pattern)→ queue → Consumer → Handler
//! ```
//!
//! The broker sits behind the [`broker::Connection`] and [`broker::Channel`]
//! traits: [`broker::amqp`] talks to RabbitMQ, [`broker::memory`] routes in
//! process with the same semantics.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod emitter;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod logging;
pub mod shutdown;
pub mod topology;

// Re-export commonly used types
pub use config::{Config, LogFormat};
pub use consumer::{Consumer, ConsumerSettings, ConsumerState, Deliveries};
pub use emitter::{Emitter, EmitterSettings};
pub use envelope::{Delivery, Envelope};
pub use error::{
    BindError, BrokerError, DeclareError, ListenError, PatternError, PublishError, SetupError,
    StateError,
};
pub use handler::{Handler, LogHandler};
pub use topology::{matches, BindingPattern, ExchangeKind, ExchangeSpec, QueueSpec, Topology};
