//! Exchange declarations.

use std::fmt;

/// Routing algorithm of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Wildcard matching on dot-separated routing keys.
    Topic,
    /// Exact routing key equality.
    Direct,
    /// Every bound queue, routing key ignored.
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of an exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    /// A durable topic exchange.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
            auto_delete: false,
        }
    }

    pub fn with_kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Describe why `other` cannot be declared over `self`, if it cannot.
    pub(crate) fn conflict_with(&self, other: &ExchangeSpec) -> Option<String> {
        if self.kind != other.kind {
            return Some(format!(
                "kind is {}, requested {}",
                self.kind, other.kind
            ));
        }
        if self.durable != other.durable {
            return Some(format!(
                "durable is {}, requested {}",
                self.durable, other.durable
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
