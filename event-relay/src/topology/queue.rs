//! Queue declarations.
//!
//! A consumer either shares a named queue with other consumers (and keeps
//! its backlog across restarts when durable) or gets a private anonymous
//! queue that lives only as long as its connection.

/// Prefix of broker-generated queue names.
pub const GENERATED_QUEUE_PREFIX: &str = "amq.gen-";

/// Parameters of a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// `None` asks the broker to generate a name.
    pub name: Option<String>,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    /// A durable queue shared by every consumer that declares the same name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// A server-named, non-durable queue exclusive to the declaring connection.
    pub fn anonymous() -> Self {
        Self {
            name: None,
            durable: false,
            exclusive: true,
            auto_delete: false,
        }
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn is_anonymous(&self) -> bool {
        self.name.as_deref().map_or(true, str::is_empty)
    }

    /// The name to send on the wire; empty for anonymous queues.
    pub fn wire_name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    pub(crate) fn conflict_with(&self, other: &QueueSpec) -> Option<String> {
        if self.durable != other.durable {
            return Some(format!(
                "durable is {}, requested {}",
                self.durable, other.durable
            ));
        }
        if self.exclusive != other.exclusive {
            return Some(format!(
                "exclusive is {}, requested {}",
                self.exclusive, other.exclusive
            ));
        }
        if self.auto_delete != other.auto_delete {
            return Some(format!(
                "auto_delete is {}, requested {}",
                self.auto_delete, other.auto_delete
            ));
        }
        None
    }
}
