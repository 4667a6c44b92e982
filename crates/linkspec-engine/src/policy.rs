//! Acceptance / review split of a final mapping.
//!
//! Links scoring at least the acceptance threshold are accepted; links between
//! the verification threshold and the acceptance threshold are set aside for
//! manual review; everything below is dropped.

use serde::Serialize;

use linkspec_dsl::SpecError;

use crate::error::Result;
use crate::mapping::Mapping;

/// Used when the derived verification threshold is not a valid threshold.
pub const FALLBACK_VERIFICATION_THRESHOLD: f64 = 0.8;

/// Default verification threshold for an acceptance threshold:
/// `acceptance - 0.1`, rounded to four decimals.
pub fn verification_threshold(acceptance: f64) -> f64 {
    let guess = ((acceptance - 0.1) * 10_000.0).round() / 10_000.0;
    if guess.is_finite() && (0.0..=1.0).contains(&guess) {
        guess
    } else {
        FALLBACK_VERIFICATION_THRESHOLD
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReviewPolicy {
    pub acceptance: f64,
    pub verification: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LinkSplit {
    pub accepted: Mapping,
    pub review: Mapping,
}

impl ReviewPolicy {
    /// Verification defaults to [`verification_threshold`] and never exceeds
    /// the acceptance threshold.
    pub fn new(acceptance: f64, verification: Option<f64>) -> Result<Self> {
        check("acceptance", acceptance)?;
        let verification = match verification {
            Some(v) => {
                check("verification", v)?;
                v
            }
            None => verification_threshold(acceptance),
        };
        Ok(Self {
            acceptance,
            verification: verification.min(acceptance),
        })
    }

    pub fn split(&self, mapping: &Mapping) -> LinkSplit {
        let mut out = LinkSplit::default();
        for (s, t, score) in mapping.iter() {
            if score >= self.acceptance {
                out.accepted.add(s, t, score);
            } else if score >= self.verification {
                out.review.add(s, t, score);
            }
        }
        tracing::debug!(
            accepted = out.accepted.size(),
            review = out.review.size(),
            "mapping split"
        );
        out
    }
}

fn check(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(SpecError::ThresholdOutOfRange {
            node: name.to_string(),
            value,
        }
        .into())
    }
}
