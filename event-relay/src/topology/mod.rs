//! Exchange topology: what exists on the broker and how messages route.
//!
//! ```text
//! Emitter ─publish(key)─▶ Exchange ─route(key)─▶ Queue(s) ─▶ Consumer
//!                            │
//!                      Binding patterns
//! ```

pub mod exchange;
pub mod pattern;
pub mod queue;
pub mod table;

pub use exchange::{ExchangeKind, ExchangeSpec};
pub use pattern::{
    matches, validate_routing_key, BindingPattern, Segment, MAX_KEY_LENGTH, WILDCARD_MANY,
    WILDCARD_ONE,
};
pub use queue::{QueueSpec, GENERATED_QUEUE_PREFIX};
pub use table::{Binding, OwnerId, Topology};
