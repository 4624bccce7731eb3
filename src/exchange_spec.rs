//! Exchange declaration mini-language.
//!
//! A spec string names the exchange kind and a list of modifiers joined by
//! `+`, optionally followed by a queue section after `>`:
//!
//! ```text
//! <kind>[+<xmod>]*[>[<queue-name>][+<qmod>]*]
//! ```
//!
//! - `kind` is one of `fanout`, `direct`, `topic`, `headers` (case-sensitive)
//! - exchange modifiers: `ad` (auto-delete), `du` (durable), `!du` (not durable)
//! - queue modifiers: `ad`, `!ad`, `du`, `!du`, `ex`, `!ex`
//!
//! Modifiers apply left to right, so later tokens override earlier ones.
//!
//! ```
//! use warren::{ExchangeKind, ExchangeSpec};
//!
//! let spec = ExchangeSpec::parse("events", "fanout+ad").unwrap();
//! assert_eq!(spec.kind, ExchangeKind::Fanout);
//! assert!(spec.auto_delete);
//! assert!(!spec.durable);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Fanout,
    Direct,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fanout" => Ok(ExchangeKind::Fanout),
            "direct" => Ok(ExchangeKind::Direct),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            "" => Err(ParseError::new(ParseErrorKind::Empty, s)),
            other => Err(ParseError::new(ParseErrorKind::UnknownKind, other)),
        }
    }
}

/// What went wrong while parsing a spec string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    Empty,
    UnknownKind,
    UnknownModifier,
}

/// Malformed exchange spec string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {token:?}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub token: String,
}

impl ParseError {
    fn new(kind: ParseErrorKind, token: impl Into<String>) -> Self {
        Self {
            kind,
            token: token.into(),
        }
    }
}

/// Immutable exchange declaration.
///
/// Built once by [`ExchangeSpec::parse`] and never mutated afterwards; Writers,
/// Readers and the admin only ever hand out clones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
}

impl ExchangeSpec {
    /// Parse the exchange section of `spec` for the exchange `name`.
    ///
    /// A trailing queue section is validated but otherwise ignored; use
    /// [`RouteSpec::parse`] to keep it.
    pub fn parse(name: impl Into<String>, spec: &str) -> Result<Self, ParseError> {
        RouteSpec::parse(name, spec).map(|route| route.exchange)
    }

    /// Flags as a short human readable string, used in conflict reports.
    pub fn describe(&self) -> String {
        format!(
            "{} durable={} auto_delete={} internal={}",
            self.kind, self.durable, self.auto_delete, self.internal
        )
    }

    /// True when both declarations would be accepted by the broker as the same exchange.
    pub fn is_compatible(&self, other: &ExchangeSpec) -> bool {
        self.kind == other.kind
            && self.durable == other.durable
            && self.auto_delete == other.auto_delete
            && self.internal == other.internal
    }
}

/// Queue declaration used by a Reader.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueSpec {
    /// `None` lets the broker generate a name.
    pub name: Option<String>,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

impl Default for QueueSpec {
    fn default() -> Self {
        Self {
            name: None,
            durable: false,
            auto_delete: true,
            exclusive: false,
        }
    }
}

/// Exchange plus queue declaration parsed from one spec string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub exchange: ExchangeSpec,
    pub queue: QueueSpec,
}

impl RouteSpec {
    pub fn parse(name: impl Into<String>, spec: &str) -> Result<Self, ParseError> {
        // ---
        let (exchange_part, queue_part) = match spec.split_once('>') {
            Some((x, q)) => (x, Some(q)),
            None => (spec, None),
        };

        let mut tokens = exchange_part.split('+');
        let kind: ExchangeKind = tokens.next().unwrap_or_default().parse()?;

        let mut exchange = ExchangeSpec {
            name: name.into(),
            kind,
            durable: false,
            auto_delete: false,
            internal: false,
        };

        for token in tokens {
            match token {
                "ad" => exchange.auto_delete = true,
                "du" => exchange.durable = true,
                "!du" => exchange.durable = false,
                other => return Err(ParseError::new(ParseErrorKind::UnknownModifier, other)),
            }
        }

        let queue = match queue_part {
            Some(q) => parse_queue(q)?,
            None => QueueSpec::default(),
        };

        Ok(Self { exchange, queue })
    }
}

fn parse_queue(section: &str) -> Result<QueueSpec, ParseError> {
    // ---
    let mut tokens = section.split('+');
    let mut queue = QueueSpec::default();

    if let Some(name) = tokens.next().filter(|n| !n.is_empty()) {
        queue.name = Some(name.to_string());
    }

    for token in tokens {
        match token {
            "ad" => queue.auto_delete = true,
            "!ad" => queue.auto_delete = false,
            "du" => queue.durable = true,
            "!du" => queue.durable = false,
            "ex" => queue.exclusive = true,
            "!ex" => queue.exclusive = false,
            other => return Err(ParseError::new(ParseErrorKind::UnknownModifier, other)),
        }
    }

    Ok(queue)
}
