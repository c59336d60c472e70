//! Equality-based selectors over attribute sets, plus the (key, label, field)
//! triple watchers filter with.

use serde::{Deserialize, Serialize};

use crate::AttrSet;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("invalid selector {expr:?}: {reason}")]
pub struct ParseError {
    pub expr: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Op {
    Eq,
    NotEq,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Requirement {
    key: String,
    op: Op,
    value: String,
}

impl Requirement {
    fn matches(&self, attrs: &AttrSet) -> bool {
        match self.op {
            Op::Eq => attrs.get(&self.key) == Some(self.value.as_str()),
            // A missing key satisfies a != requirement
            Op::NotEq => attrs.get(&self.key) != Some(self.value.as_str()),
        }
    }
}

/// A conjunction of equality requirements. An empty selector matches every
/// attribute set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// The selector that matches everything.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Build a selector requiring equality on every given pair.
    pub fn from_set<K: Into<String>, V: Into<String>>(
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        let requirements = pairs
            .into_iter()
            .map(|(k, v)| Requirement { key: k.into(), op: Op::Eq, value: v.into() })
            .collect();
        Self { requirements }
    }

    /// Parse an expression like `app=nginx,env!=prod`. `==` is accepted as
    /// `=`; an empty expression selects everything.
    pub fn parse(expr: &str) -> Result<Self, ParseError> {
        let err = |reason: &str| ParseError { expr: expr.to_string(), reason: reason.to_string() };
        let mut requirements = Vec::new();
        for term in expr.split(',') {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            let (key, op, value) = if let Some((k, v)) = term.split_once("!=") {
                (k, Op::NotEq, v)
            } else if let Some((k, v)) = term.split_once("==") {
                (k, Op::Eq, v)
            } else if let Some((k, v)) = term.split_once('=') {
                (k, Op::Eq, v)
            } else {
                return Err(err("expected key=value, key==value or key!=value"));
            };
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() {
                return Err(err("empty key"));
            }
            if value.contains('=') {
                return Err(err("unexpected '=' in value"));
            }
            requirements.push(Requirement { key: key.to_string(), op, value: value.to_string() });
        }
        Ok(Self { requirements })
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, attrs: &AttrSet) -> bool {
        self.requirements.iter().all(|r| r.matches(attrs))
    }
}

/// Per-watcher filter: optional exact key plus label and field selectors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selectors {
    pub key: Option<String>,
    pub label: Selector,
    pub field: Selector,
}

impl Selectors {
    pub fn new(key: Option<String>, label: Selector, field: Selector) -> Self {
        Self { key, label, field }
    }

    /// Matches every (key, labels, fields) triple.
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn matches(&self, key: &str, labels: &AttrSet, fields: &AttrSet) -> bool {
        if let Some(want) = self.key.as_deref() {
            if want != key {
                return false;
            }
        }
        self.label.matches(labels) && self.field.matches(fields)
    }
}
