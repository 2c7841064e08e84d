//! Quality gate: extraction plus a minimum quality score.
//!
//! A rejected frame has no side effect. The gate itself is synchronous; the
//! capture pipeline runs it on its own worker thread so a slow extraction
//! never stalls acquisition.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capability::MinutiaeExtractor;
use crate::frame::Frame;

/// A candidate probe template that passed the gate.
#[derive(Clone, Debug)]
pub struct ProbeTemplate {
    pub payload: Vec<u8>,
    pub quality_score: i32,
}

#[derive(Debug)]
pub enum GateOutcome {
    Accepted(ProbeTemplate),
    LowQuality { score: i32 },
    ExtractionFailed(String),
}

impl GateOutcome {
    /// Short operator-facing reason for a rejection.
    pub fn rejection_reason(&self) -> Option<String> {
        match self {
            GateOutcome::Accepted(_) => None,
            GateOutcome::LowQuality { score } => Some(format!("low quality ({})", score)),
            GateOutcome::ExtractionFailed(err) => Some(format!("extraction failed: {}", err)),
        }
    }
}

pub struct QualityGate {
    extractor: Arc<dyn MinutiaeExtractor>,
    min_quality: i32,
    deadline: Duration,
}

impl QualityGate {
    pub fn new(extractor: Arc<dyn MinutiaeExtractor>, min_quality: i32, deadline: Duration) -> Self {
        Self {
            extractor,
            min_quality,
            deadline,
        }
    }

    pub fn min_quality(&self) -> i32 {
        self.min_quality
    }

    pub fn evaluate(&self, frame: &Frame) -> GateOutcome {
        let started = Instant::now();
        let extraction = match self.extractor.extract(frame, self.deadline) {
            Ok(extraction) => extraction,
            Err(err) => {
                log::debug!("extraction failed ({}): {:#}", self.extractor.name(), err);
                return GateOutcome::ExtractionFailed(err.to_string());
            }
        };
        // Backends are expected to honor the deadline; a late answer is discarded.
        let elapsed = started.elapsed();
        if elapsed > self.deadline {
            log::warn!(
                "extraction by {} exceeded deadline ({:?} > {:?})",
                self.extractor.name(),
                elapsed,
                self.deadline
            );
            return GateOutcome::ExtractionFailed("deadline exceeded".to_string());
        }
        if extraction.quality_score < self.min_quality {
            log::info!(
                "low quality capture: {} < {}",
                extraction.quality_score,
                self.min_quality
            );
            return GateOutcome::LowQuality {
                score: extraction.quality_score,
            };
        }
        GateOutcome::Accepted(ProbeTemplate {
            payload: extraction.template,
            quality_score: extraction.quality_score,
        })
    }
}
