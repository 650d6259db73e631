//! Error taxonomy of the planner and the execution layer.
//!
//! Planning-time errors are fatal and reported before any node is opened. Execution-time
//! errors abort the request after cancelling the rest of the node tree.

use thiserror::Error;

use crate::capability::SourceId;

pub type OptResult<T> = anyhow::Result<T>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum OptimizerError {
    /// A required operation has no source able to execute it and the engine cannot evaluate
    /// it either.
    #[error("capability unsupported: {0}")]
    CapabilityUnsupported(String),

    /// A source requires bound columns that nothing in the plan can bind.
    #[error("unsatisfiable access pattern: {0}")]
    UnsatisfiableAccessPattern(String),

    /// The rule pipeline did not reach a fixpoint within the configured number of rule
    /// applications. This always indicates a rule cycle.
    #[error("planning exhausted after {applications} rule applications, last rules: {rule_trail:?}")]
    PlanningExhausted {
        applications: usize,
        rule_trail: Vec<String>,
    },

    /// No cardinality could be derived. Never surfaced to callers.
    #[error("cost estimate unavailable: {0}")]
    CostEstimateUnavailable(String),

    #[error("connector execution failed on source {source_id}: {message}")]
    ConnectorExecution { source_id: SourceId, message: String },

    /// In-process evaluation failure.
    #[error("execution error: {0}")]
    Execution(String),

    #[error("request cancelled")]
    Cancelled,

    /// Planner defect.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OptimizerError {
    /// Extracts the typed error carried by an `anyhow::Error`, if any.
    pub fn of(err: &anyhow::Error) -> Option<&OptimizerError> {
        err.downcast_ref::<OptimizerError>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = OptimizerError::UnsatisfiableAccessPattern("b.k".into()).into();
        assert_eq!(
            OptimizerError::of(&err),
            Some(&OptimizerError::UnsatisfiableAccessPattern("b.k".into()))
        );
        assert!(err.to_string().contains("b.k"));
    }

    #[test]
    fn test_exhausted_message_lists_rules() {
        let err = OptimizerError::PlanningExhausted {
            applications: 3,
            rule_trail: vec!["AssignAccess".into(), "LimitSortPushdown".into()],
        };
        assert!(err.to_string().contains("LimitSortPushdown"));
    }
}
