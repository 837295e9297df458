// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Engine error types
//!
//! Two families live here:
//! - [`GraphError`]: integrity failures surfaced to the caller (the store is
//!   left untouched when one is returned).
//! - [`LlmError`]: backend failures. These never leave the engine; every
//!   caller recovers them through its deterministic path and reports the
//!   recovery as [`FallbackUsed`].

use thiserror::Error;

/// Result type for graph store operations
pub type GraphResult<T> = Result<T, GraphError>;

/// Errors raised by the graph store
#[derive(Debug, Error)]
pub enum GraphError {
    /// A relationship endpoint does not exist in the workspace
    #[error("Unknown entity {entity} in workspace {workspace_id}")]
    UnknownEntity { workspace_id: String, entity: String },

    /// Workspace has never been written to
    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    /// Entity failed validation (e.g. empty name)
    #[error("Invalid entity: {0}")]
    InvalidEntity(String),
}

/// Errors raised while talking to a model backend
#[derive(Debug, Error)]
pub enum LlmError {
    /// No backend configured, or the configured id is unknown
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    /// The call exceeded the configured timeout
    #[error("LLM call timed out after {0} ms")]
    Timeout(u64),

    /// Transport, quota or auth failure reported by the provider
    #[error("LLM backend error: {0}")]
    Backend(String),

    /// The reply did not match the expected schema
    #[error("Malformed LLM response: {0}")]
    MalformedResponse(String),
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        LlmError::MalformedResponse(e.to_string())
    }
}

/// The deterministic path produced the value instead of the model backend.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackUsed<T> {
    /// Value computed by the fallback
    pub value: T,
    /// Why the primary path was skipped
    pub reason: String,
}

impl<T> FallbackUsed<T> {
    pub fn new(value: T, reason: impl Into<String>) -> Self {
        Self {
            value,
            reason: reason.into(),
        }
    }
}

/// Outcome of a best-effort call: `Ok` from the backend, `Err` from the fallback.
pub type Outcome<T> = Result<T, FallbackUsed<T>>;

/// Helpers for consuming an [`Outcome`] without caring which branch ran.
pub trait OutcomeExt<T> {
    /// The value, whichever branch produced it
    fn into_value(self) -> T;
    /// Whether the fallback branch produced the value
    fn used_fallback(&self) -> bool;
    /// Borrow the value
    fn value(&self) -> &T;
}

impl<T> OutcomeExt<T> for Outcome<T> {
    fn into_value(self) -> T {
        match self {
            Ok(value) => value,
            Err(fallback) => fallback.value,
        }
    }

    fn used_fallback(&self) -> bool {
        self.is_err()
    }

    fn value(&self) -> &T {
        match self {
            Ok(value) => value,
            Err(fallback) => &fallback.value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_ext() {
        let primary: Outcome<u32> = Ok(3);
        assert!(!primary.used_fallback());
        assert_eq!(primary.into_value(), 3);

        let fallback: Outcome<u32> = Err(FallbackUsed::new(7, "backend down"));
        assert!(fallback.used_fallback());
        assert_eq!(*fallback.value(), 7);
        assert_eq!(fallback.into_value(), 7);
    }

    #[test]
    fn test_unknown_entity_message() {
        let err = GraphError::UnknownEntity {
            workspace_id: "ws1".to_string(),
            entity: "42".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown entity 42 in workspace ws1");
    }
}
