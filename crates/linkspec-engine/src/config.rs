//! Engine configuration.
//!
//! ```json
//! { "planner": "cost-based", "parallel": true, "min_parallel_sources": 256, "time_budget_ms": 60000 }
//! ```
//!
//! Every field is optional; missing fields take the [`Default`] values.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::measures::EvalOptions;
use crate::planner::PlannerKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub planner: PlannerKind,
    /// Evaluate sibling subtrees and source partitions on the rayon pool.
    pub parallel: bool,
    /// Leaves with fewer source entities stay sequential.
    pub min_parallel_sources: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_budget_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            planner: PlannerKind::CostBased,
            parallel: true,
            min_parallel_sources: 256,
            time_budget_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn eval_options(&self) -> EvalOptions {
        EvalOptions {
            parallel: self.parallel,
            min_parallel_sources: self.min_parallel_sources,
        }
    }

    pub fn time_budget(&self) -> Option<Duration> {
        self.time_budget_ms.map(Duration::from_millis)
    }

    /// Single-threaded evaluation, handy for deterministic debugging.
    pub fn sequential() -> Self {
        Self {
            parallel: false,
            ..Self::default()
        }
    }
}
