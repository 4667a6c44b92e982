//! Run configuration files.
//!
//! ```json
//! {
//!   "source": "people_a.json",
//!   "target": "people_b.json",
//!   "spec": "AND(levenshtein(x.name, y.name)|0.8, exactmatch(x.born, y.born)|1)",
//!   "acceptance": 0.9,
//!   "engine": { "planner": "cost-based", "time_budget_ms": 60000 }
//! }
//! ```
//!
//! Relative cache paths are resolved against the directory of the file.
//! Command-line flags override file values.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use linkspec_dsl::ParseOptions;
use linkspec_engine::EngineConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub source: Option<PathBuf>,
    pub target: Option<PathBuf>,
    /// Link specification text.
    pub spec: Option<String>,
    pub source_var: Option<String>,
    pub target_var: Option<String>,
    pub acceptance: Option<f64>,
    pub verification: Option<f64>,
    pub engine: EngineConfig,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config: RunConfig = serde_json::from_str(&text)
            .with_context(|| format!("invalid run config {}", path.display()))?;
        if let Some(dir) = path.parent() {
            config.source = config.source.map(|p| resolve(dir, p));
            config.target = config.target.map(|p| resolve(dir, p));
        }
        Ok(config)
    }

    pub fn parse_options(&self) -> ParseOptions {
        let defaults = ParseOptions::default();
        ParseOptions::new(
            self.source_var.as_deref().unwrap_or(&defaults.source_var),
            self.target_var.as_deref().unwrap_or(&defaults.target_var),
        )
    }
}

fn resolve(dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        dir.join(path)
    }
}
