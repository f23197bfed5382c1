//! Peer identity — validated device identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;

/// A unique identifier for a device participating in the exchange.
///
/// Ids are restricted to letters and digits and must be non-empty. The
/// lexicographic order of ids is load-bearing: it decides which of two
/// peers initiates a connection and which side tears it down, so
/// [`PeerId`] implements a total order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer id, validating the format.
    pub fn new(id: impl Into<String>) -> Result<Self, ExchangeError> {
        let id = id.into();
        if id.is_empty() || !id.chars().all(char::is_alphanumeric) {
            return Err(ExchangeError::InvalidPeerId(id));
        }
        Ok(Self(id))
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for PeerId {
    type Error = ExchangeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
