//! Topic pattern parsing and matching.
//!
//! Routing keys and binding patterns are dot-separated words. In a pattern,
//! `*` stands for exactly one word and `#` for zero or more words; every
//! other segment must match its word verbatim.

use std::fmt;
use std::str::FromStr;

use crate::error::PatternError;

/// Separator between routing key segments.
pub const SEGMENT_SEPARATOR: char = '.';

/// Wildcard matching exactly one segment.
pub const WILDCARD_ONE: &str = "*";

/// Wildcard matching zero or more segments.
pub const WILDCARD_MANY: &str = "#";

/// Routing keys and patterns travel as AMQP short strings.
pub const MAX_KEY_LENGTH: usize = 255;

/// One parsed segment of a binding pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Literal(String),
    One,
    Many,
}

/// A validated binding pattern such as `kern.*` or `*.critical.#`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl BindingPattern {
    /// Parse and validate a binding pattern.
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        validate_routing_key(raw)?;

        let mut segments = raw
            .split(SEGMENT_SEPARATOR)
            .map(|segment| match segment {
                WILDCARD_ONE => Ok(Segment::One),
                WILDCARD_MANY => Ok(Segment::Many),
                s if s.contains(['*', '#']) => Err(PatternError::MixedWildcard {
                    segment: s.to_string(),
                }),
                s => Ok(Segment::Literal(s.to_string())),
            })
            .collect::<Result<Vec<Segment>, _>>()?;

        // `#.#` matches exactly what `#` matches.
        segments.dedup_by(|next, prev| *next == Segment::Many && *prev == Segment::Many);

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The `#` pattern, which matches every routing key.
    pub fn catch_all() -> Self {
        Self {
            raw: WILDCARD_MANY.to_string(),
            segments: vec![Segment::Many],
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Whether `routing_key` is selected by this pattern.
    pub fn matches(&self, routing_key: &str) -> bool {
        let words: Vec<&str> = routing_key.split(SEGMENT_SEPARATOR).collect();
        match_segments(&self.segments, &words)
    }
}

impl FromStr for BindingPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BindingPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Check that a routing key fits in an AMQP short string.
///
/// Wildcard characters carry no meaning in a routing key and are accepted
/// as plain characters, the same way the broker treats them.
pub fn validate_routing_key(key: &str) -> Result<(), PatternError> {
    if key.len() > MAX_KEY_LENGTH {
        return Err(PatternError::TooLong(key.len()));
    }
    Ok(())
}

/// Match `routing_key` against the textual `pattern`.
///
/// A malformed pattern never matches anything.
pub fn matches(routing_key: &str, pattern: &str) -> bool {
    BindingPattern::parse(pattern)
        .map(|p| p.matches(routing_key))
        .unwrap_or(false)
}

/// Walks the pattern once, tracking which word counts each prefix of it can
/// consume. Runs in `O(segments × words)`.
fn match_segments(pattern: &[Segment], words: &[&str]) -> bool {
    let mut reachable = vec![false; words.len() + 1];
    reachable[0] = true;

    for segment in pattern {
        let mut next = vec![false; words.len() + 1];
        match segment {
            Segment::Many => {
                let mut open = false;
                for (j, slot) in next.iter_mut().enumerate() {
                    open |= reachable[j];
                    *slot = open;
                }
            }
            Segment::One => {
                for j in 1..=words.len() {
                    next[j] = reachable[j - 1];
                }
            }
            Segment::Literal(literal) => {
                for j in 1..=words.len() {
                    next[j] = reachable[j - 1] && words[j - 1] == literal.as_str();
                }
            }
        }

        if !next.contains(&true) {
            return false;
        }
        reachable = next;
    }

    reachable[words.len()]
}
