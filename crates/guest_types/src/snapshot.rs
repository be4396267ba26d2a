//! Argument snapshots
//!
//! An `ArgSnapshot` is the argument vector of a deferred call, copied by value
//! when the call was scheduled.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::GuestValue;

/// Why a guest value could not be copied out of the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("value nested deeper than {limit} levels (cyclic structure?)")]
    TooDeep { limit: usize },

    #[error("{kind} values cannot be copied")]
    Unsupported { kind: String },

    #[error("failed to read guest value: {0}")]
    Read(String),
}

/// Ordered, owned copy of a call's arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArgSnapshot(Vec<GuestValue>);

impl ArgSnapshot {
    pub fn new(values: Vec<GuestValue>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&GuestValue> {
        self.0.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, GuestValue> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[GuestValue] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<GuestValue> {
        self.0
    }
}

impl From<Vec<GuestValue>> for ArgSnapshot {
    fn from(values: Vec<GuestValue>) -> Self {
        Self(values)
    }
}

impl FromIterator<GuestValue> for ArgSnapshot {
    fn from_iter<I: IntoIterator<Item = GuestValue>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a ArgSnapshot {
    type Item = &'a GuestValue;
    type IntoIter = std::slice::Iter<'a, GuestValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for ArgSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }
        f.write_str(")")
    }
}
