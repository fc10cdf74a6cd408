//! The routing table: declared exchanges, queues and the bindings between
//! them.
//!
//! `Topology` is plain data with no I/O. The in-process broker keeps one
//! behind its lock and asks it where each published envelope should go.

use std::collections::HashMap;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

use super::exchange::{ExchangeKind, ExchangeSpec};
use super::pattern::BindingPattern;
use super::queue::{QueueSpec, GENERATED_QUEUE_PREFIX};
use crate::error::{BindError, DeclareError};

/// Identifies the connection that declared an exclusive queue.
pub type OwnerId = u64;

/// A queue's subscription to an exchange through one pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub pattern: BindingPattern,
}

#[derive(Debug, Clone)]
struct DeclaredQueue {
    spec: QueueSpec,
    owner: Option<OwnerId>,
}

/// Exchanges, queues and bindings known to a broker.
#[derive(Debug, Default)]
pub struct Topology {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, DeclaredQueue>,
    bindings: Vec<Binding>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an exchange. Re-declaring with identical attributes is a no-op.
    pub fn declare_exchange(&mut self, spec: &ExchangeSpec) -> Result<(), DeclareError> {
        if let Some(existing) = self.exchanges.get(&spec.name) {
            return match existing.conflict_with(spec) {
                Some(reason) => Err(DeclareError::Conflict {
                    name: spec.name.clone(),
                    reason,
                }),
                None => Ok(()),
            };
        }

        debug!(exchange = %spec.name, kind = %spec.kind, durable = spec.durable, "exchange_created");
        self.exchanges.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    pub fn exchange(&self, name: &str) -> Option<&ExchangeSpec> {
        self.exchanges.get(name)
    }

    /// Declare a queue on behalf of connection `owner` and return its name.
    ///
    /// Anonymous specs always create a fresh queue with a generated name.
    pub fn declare_queue(
        &mut self,
        spec: &QueueSpec,
        owner: OwnerId,
    ) -> Result<String, DeclareError> {
        let name = match spec.name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.generate_queue_name(),
        };

        if let Some(existing) = self.queues.get(&name) {
            if existing.owner.is_some_and(|o| o != owner) {
                return Err(DeclareError::Locked { name });
            }
            return match existing.spec.conflict_with(spec) {
                Some(reason) => Err(DeclareError::Conflict { name, reason }),
                None => Ok(name),
            };
        }

        let mut declared = spec.clone();
        declared.name = Some(name.clone());
        debug!(queue = %name, durable = spec.durable, exclusive = spec.exclusive, "queue_created");
        self.queues.insert(
            name.clone(),
            DeclaredQueue {
                spec: declared,
                owner: spec.exclusive.then_some(owner),
            },
        );
        Ok(name)
    }

    pub fn queue(&self, name: &str) -> Option<&QueueSpec> {
        self.queues.get(name).map(|q| &q.spec)
    }

    /// The connection a queue is exclusive to, if any.
    pub fn queue_owner(&self, name: &str) -> Option<OwnerId> {
        self.queues.get(name).and_then(|q| q.owner)
    }

    /// Queues that are exclusive to connection `owner`.
    pub fn queues_owned_by(&self, owner: OwnerId) -> Vec<String> {
        self.queues
            .iter()
            .filter(|(_, q)| q.owner == Some(owner))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Remove a queue and every binding that targets it.
    pub fn delete_queue(&mut self, name: &str) -> bool {
        let removed = self.queues.remove(name).is_some();
        if removed {
            self.bindings.retain(|b| b.queue != name);
            debug!(queue = %name, "queue_deleted");
        }
        removed
    }

    /// Bind `queue` to `exchange` with `pattern`. Re-binding the same triple
    /// is a no-op.
    pub fn bind(
        &mut self,
        queue: &str,
        exchange: &str,
        pattern: BindingPattern,
    ) -> Result<(), BindError> {
        if !self.exchanges.contains_key(exchange) {
            return Err(BindError::NotFound(format!("exchange `{exchange}`")));
        }
        if !self.queues.contains_key(queue) {
            return Err(BindError::NotFound(format!("queue `{queue}`")));
        }

        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            pattern,
        };
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        Ok(())
    }

    /// Remove a binding. Returns whether it existed.
    pub fn unbind(&mut self, queue: &str, exchange: &str, pattern: &BindingPattern) -> bool {
        let before = self.bindings.len();
        self.bindings
            .retain(|b| !(b.queue == queue && b.exchange == exchange && &b.pattern == pattern));
        self.bindings.len() != before
    }

    pub fn bindings_for<'a>(&'a self, queue: &'a str) -> impl Iterator<Item = &'a Binding> + 'a {
        self.bindings.iter().filter(move |b| b.queue == queue)
    }

    /// Queues that receive a copy of a message published to `exchange` with
    /// `routing_key`.
    ///
    /// A queue is selected when any of its bindings match and appears once no
    /// matter how many of them do. Queues come back in the order their first
    /// matching binding was made.
    pub fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        let Some(spec) = self.exchanges.get(exchange) else {
            return Vec::new();
        };

        let mut selected: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let hit = match spec.kind {
                ExchangeKind::Topic => binding.pattern.matches(routing_key),
                ExchangeKind::Direct => binding.pattern.as_str() == routing_key,
                ExchangeKind::Fanout => true,
            };
            if hit && !selected.contains(&binding.queue) {
                selected.push(binding.queue.clone());
            }
        }
        selected
    }

    fn generate_queue_name(&self) -> String {
        loop {
            let suffix: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(22)
                .map(char::from)
                .collect();
            let name = format!("{GENERATED_QUEUE_PREFIX}{suffix}");
            if !self.queues.contains_key(&name) {
                return name;
            }
        }
    }
}
