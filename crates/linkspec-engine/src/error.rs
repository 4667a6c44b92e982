use std::time::Duration;

use linkspec_dsl::SpecError;
use thiserror::Error;

use crate::planner::NodeId;

pub type Result<T, E = LinkError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error("unknown measure `{measure}` in `{expression}`")]
    UnknownMeasure { measure: String, expression: String },

    #[error("no registered implementation of `{measure}` can evaluate `{expression}`")]
    NoImplementation { measure: String, expression: String },

    #[error("evaluation of node {node} (`{expression}`) failed: {message}")]
    Evaluation {
        node: NodeId,
        expression: String,
        message: String,
    },

    #[error("evaluation cancelled before node {node}")]
    Cancelled { node: NodeId },

    #[error("time budget of {budget:?} exceeded after {elapsed:?} (before node {node})")]
    TimeBudgetExceeded {
        node: NodeId,
        budget: Duration,
        elapsed: Duration,
    },

    #[error("invalid cache data: {0}")]
    Cache(#[from] serde_json::Error),
}

impl LinkError {
    /// Whether the error was raised before any mapper ran.
    pub fn is_planning_error(&self) -> bool {
        matches!(
            self,
            LinkError::Spec(_) | LinkError::UnknownMeasure { .. } | LinkError::NoImplementation { .. }
        )
    }
}
