//! Rendering of run results.

use std::io::Write;

use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;

use linkspec_engine::{Execution, LinkSplit, Mapping, ReviewPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// `source<TAB>target<TAB>score` lines
    Tsv,
    /// One JSON document with accepted and review links
    Json,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub accepted: Mapping,
    pub review: Mapping,
    pub elapsed_ms: u128,
    pub skipped_values: u64,
}

#[derive(Serialize)]
struct LinkRow<'a> {
    source: &'a str,
    target: &'a str,
    score: f64,
}

#[derive(Serialize)]
struct JsonOutput<'a> {
    accepted: Vec<LinkRow<'a>>,
    review: Vec<LinkRow<'a>>,
    elapsed_ms: u128,
    skipped_values: u64,
}

impl RunOutput {
    /// Without a policy every discovered link counts as accepted.
    pub fn new(execution: &Execution, policy: Option<&ReviewPolicy>) -> Self {
        let LinkSplit { accepted, review } = match policy {
            Some(policy) => policy.split(&execution.mapping),
            None => LinkSplit {
                accepted: execution.mapping.clone(),
                review: Mapping::new(),
            },
        };
        Self {
            accepted,
            review,
            elapsed_ms: execution.elapsed.as_millis(),
            skipped_values: execution.skipped_values(),
        }
    }

    pub fn write(&self, format: OutputFormat, out: &mut impl Write) -> Result<()> {
        match format {
            OutputFormat::Tsv => write_tsv(&self.accepted, out),
            OutputFormat::Json => {
                let doc = JsonOutput {
                    accepted: rows(&self.accepted),
                    review: rows(&self.review),
                    elapsed_ms: self.elapsed_ms,
                    skipped_values: self.skipped_values,
                };
                serde_json::to_writer_pretty(&mut *out, &doc)?;
                writeln!(out)?;
                Ok(())
            }
        }
    }
}

fn rows(mapping: &Mapping) -> Vec<LinkRow<'_>> {
    mapping
        .iter()
        .map(|(source, target, score)| LinkRow {
            source,
            target,
            score,
        })
        .collect()
}

pub fn write_tsv(mapping: &Mapping, out: &mut impl Write) -> Result<()> {
    for (source, target, score) in mapping.iter() {
        writeln!(out, "{source}\t{target}\t{score}")?;
    }
    Ok(())
}
