//! Error taxonomy shared by the operation log and the history engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::operation::OperationId;

/// Errors raised by operation validation and the operation store.
///
/// Serializable so the sync server can return them inside RPC responses
/// without flattening them to strings.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationError {
    #[error("Invalid parameters: {message}")]
    InvalidParameters { message: String },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Forbidden: {reason}")]
    Forbidden { reason: String },

    /// Delete blocked by live operations that still depend on the target.
    #[error("Operation {operation_id} has {} dependent operation(s): {blocking:?}", .blocking.len())]
    DependencyConflict {
        operation_id: OperationId,
        blocking: Vec<OperationId>,
    },

    #[error("Not implemented: {feature}")]
    NotImplemented { feature: String },

    #[error("Storage error: {message}")]
    Storage { message: String },
}

impl OperationError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParameters { message: message.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden { reason: reason.into() }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Number of operations blocking a delete (0 for other variants).
    pub fn blocking_count(&self) -> usize {
        match self {
            Self::DependencyConflict { blocking, .. } => blocking.len(),
            _ => 0,
        }
    }
}

/// Errors raised by history navigation and checkpoint persistence.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HistoryError {
    #[error("Checkpoint not found for version {version}")]
    NotFound { version: u64 },

    /// The requested version lies below the trimmed floor of the log.
    #[error("Version {requested} is not reachable (history starts at {floor})")]
    ReplayGap { requested: u64, floor: u64 },

    /// Subtype not valid for the action type, e.g. `sketch/extrude`.
    #[error("Subtype {subtype} is not valid for {action_type} actions")]
    InvalidAction { action_type: String, subtype: String },

    #[error("History storage error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_conflict_reports_blockers() {
        let err = OperationError::DependencyConflict {
            operation_id: OperationId::from("rect"),
            blocking: vec![OperationId::from("extrude-1"), OperationId::from("extrude-2")],
        };
        assert_eq!(err.blocking_count(), 2);
        let text = err.to_string();
        assert!(text.contains("rect"));
        assert!(text.contains("2 dependent"));
    }

    #[test]
    fn test_operation_error_json_shape() {
        let err = OperationError::invalid("depth: must be positive");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "invalid_parameters");
        assert_eq!(json["message"], "depth: must be positive");

        let back: OperationError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_replay_gap_display() {
        let err = HistoryError::ReplayGap { requested: 3, floor: 40 };
        assert_eq!(err.to_string(), "Version 3 is not reachable (history starts at 40)");
    }
}
