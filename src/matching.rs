//! 1:N identification against the enrolled gallery.
//!
//! Each employee's templates are scored against the probe and reduced to one
//! aggregate (best template by default, optionally the mean). The top
//! aggregate is accepted only if it reaches the threshold and clears the
//! runner-up by at least the ambiguity margin.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::capability::TemplateScorer;
use crate::quality::ProbeTemplate;
use crate::EnrolledEmployee;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aggregation {
    /// Highest score over the employee's templates.
    Best,
    /// Integer mean over the templates that scored successfully.
    Mean,
}

impl Aggregation {
    fn reduce(self, scores: &[i32]) -> Option<i32> {
        if scores.is_empty() {
            return None;
        }
        match self {
            Aggregation::Best => scores.iter().copied().max(),
            Aggregation::Mean => {
                let sum: i64 = scores.iter().map(|&s| s as i64).sum();
                Some((sum / scores.len() as i64) as i32)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub employee_id: i64,
    pub employee_code: String,
    pub name: String,
    pub score: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatchOutcome {
    Identified(Candidate),
    /// Top two aggregates too close to call. Treated as no match.
    Ambiguous { best: Candidate, second: Candidate },
    NoMatch { best_score: Option<i32> },
}

pub struct MatchEngine {
    scorer: Arc<dyn TemplateScorer>,
    threshold: i32,
    ambiguity_margin: i32,
    aggregation: Aggregation,
    deadline: Duration,
}

impl MatchEngine {
    pub fn new(
        scorer: Arc<dyn TemplateScorer>,
        threshold: i32,
        ambiguity_margin: i32,
        aggregation: Aggregation,
        deadline: Duration,
    ) -> Self {
        Self {
            scorer,
            threshold,
            ambiguity_margin,
            aggregation,
            deadline,
        }
    }

    pub fn identify(&self, probe: &ProbeTemplate, gallery: &[EnrolledEmployee]) -> MatchOutcome {
        let mut ranked: Vec<Candidate> = gallery
            .iter()
            .filter_map(|employee| {
                let scores = self.score_templates(probe, employee);
                self.aggregation
                    .reduce(&scores)
                    .map(|score| Candidate {
                        employee_id: employee.employee_id,
                        employee_code: employee.employee_code.clone(),
                        name: employee.name.clone(),
                        score,
                    })
            })
            .collect();
        ranked.sort_by(|a, b| match b.score.cmp(&a.score) {
            Ordering::Equal => a.employee_id.cmp(&b.employee_id),
            other => other,
        });

        let mut ranked = ranked.into_iter();
        let best = match ranked.next() {
            Some(best) => best,
            None => return MatchOutcome::NoMatch { best_score: None },
        };
        if best.score < self.threshold {
            log::info!(
                "no match: best score {} below threshold {}",
                best.score,
                self.threshold
            );
            return MatchOutcome::NoMatch {
                best_score: Some(best.score),
            };
        }
        if let Some(second) = ranked.next() {
            if best.score - second.score < self.ambiguity_margin {
                log::warn!(
                    "ambiguous match: {} ({}) vs {} ({})",
                    best.employee_code,
                    best.score,
                    second.employee_code,
                    second.score
                );
                return MatchOutcome::Ambiguous { best, second };
            }
        }
        log::info!("match found: {} (score={})", best.employee_code, best.score);
        MatchOutcome::Identified(best)
    }

    fn score_templates(&self, probe: &ProbeTemplate, employee: &EnrolledEmployee) -> Vec<i32> {
        let mut scores = Vec::with_capacity(employee.templates.len());
        for template in &employee.templates {
            let started = Instant::now();
            match self
                .scorer
                .score(&probe.payload, &template.payload, self.deadline)
            {
                Ok(_) if started.elapsed() > self.deadline => {
                    log::warn!(
                        "scoring template {} of {} exceeded deadline; skipped",
                        template.capture_index,
                        employee.employee_code
                    );
                }
                Ok(score) => scores.push(score),
                Err(err) => {
                    log::warn!(
                        "scoring template {} of {} failed: {:#}",
                        template.capture_index,
                        employee.employee_code,
                        err
                    );
                }
            }
        }
        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FingerprintTemplate;
    use anyhow::{anyhow, Result};

    /// Gallery payload byte 0 is the score; an empty payload fails.
    struct PayloadScorer;

    impl TemplateScorer for PayloadScorer {
        fn name(&self) -> &'static str {
            "payload"
        }

        fn score(&self, _probe: &[u8], gallery: &[u8], _timeout: Duration) -> Result<i32> {
            gallery
                .first()
                .map(|&s| s as i32)
                .ok_or_else(|| anyhow!("bozorth3 timed out"))
        }
    }

    fn employee(id: i64, code: &str, scores: &[&[u8]]) -> EnrolledEmployee {
        EnrolledEmployee {
            employee_id: id,
            employee_code: code.to_string(),
            name: format!("Employee {}", code),
            templates: scores
                .iter()
                .enumerate()
                .map(|(i, payload)| FingerprintTemplate {
                    id: id * 10 + i as i64,
                    employee_id: id,
                    payload: payload.to_vec(),
                    quality_score: 40,
                    capture_index: i as u32,
                })
                .collect(),
        }
    }

    fn engine(aggregation: Aggregation) -> MatchEngine {
        MatchEngine::new(
            Arc::new(PayloadScorer),
            40,
            5,
            aggregation,
            Duration::from_secs(1),
        )
    }

    fn probe() -> ProbeTemplate {
        ProbeTemplate {
            payload: vec![0],
            quality_score: 30,
        }
    }

    #[test]
    fn score_equal_to_threshold_matches() {
        let gallery = [employee(1, "EMP001", &[&[10], &[40], &[12]])];
        match engine(Aggregation::Best).identify(&probe(), &gallery) {
            MatchOutcome::Identified(c) => {
                assert_eq!(c.employee_code, "EMP001");
                assert_eq!(c.score, 40);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn score_below_threshold_is_no_match() {
        let gallery = [employee(1, "EMP001", &[&[39], &[38], &[12]])];
        assert_eq!(
            engine(Aggregation::Best).identify(&probe(), &gallery),
            MatchOutcome::NoMatch {
                best_score: Some(39)
            }
        );
    }

    #[test]
    fn close_runner_up_is_ambiguous() {
        let gallery = [
            employee(1, "EMP001", &[&[50], &[20], &[20]]),
            employee(2, "EMP002", &[&[46], &[20], &[20]]),
        ];
        assert!(matches!(
            engine(Aggregation::Best).identify(&probe(), &gallery),
            MatchOutcome::Ambiguous { .. }
        ));
    }

    #[test]
    fn runner_up_below_threshold_still_counts_for_ambiguity() {
        let engine = MatchEngine::new(
            Arc::new(PayloadScorer),
            48,
            5,
            Aggregation::Best,
            Duration::from_secs(1),
        );
        let gallery = [
            employee(1, "EMP001", &[&[50]]),
            employee(2, "EMP002", &[&[47]]),
        ];
        assert!(matches!(
            engine.identify(&probe(), &gallery),
            MatchOutcome::Ambiguous { .. }
        ));
    }

    #[test]
    fn margin_exactly_met_is_identified() {
        let gallery = [
            employee(1, "EMP001", &[&[50]]),
            employee(2, "EMP002", &[&[45]]),
        ];
        assert!(matches!(
            engine(Aggregation::Best).identify(&probe(), &gallery),
            MatchOutcome::Identified(Candidate { employee_id: 1, .. })
        ));
    }

    #[test]
    fn mean_aggregation_averages_templates() {
        // (60 + 30 + 29) / 3 = 39
        let gallery = [employee(1, "EMP001", &[&[60], &[30], &[29]])];
        assert_eq!(
            engine(Aggregation::Mean).identify(&probe(), &gallery),
            MatchOutcome::NoMatch {
                best_score: Some(39)
            }
        );
        assert!(matches!(
            engine(Aggregation::Best).identify(&probe(), &gallery),
            MatchOutcome::Identified(_)
        ));
    }

    #[test]
    fn scoring_failures_skip_the_template() {
        let gallery = [
            employee(1, "EMP001", &[&[], &[55], &[]]),
            employee(2, "EMP002", &[&[], &[], &[]]),
        ];
        match engine(Aggregation::Best).identify(&probe(), &gallery) {
            MatchOutcome::Identified(c) => assert_eq!(c.score, 55),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn empty_gallery_is_no_match() {
        assert_eq!(
            engine(Aggregation::Best).identify(&probe(), &[]),
            MatchOutcome::NoMatch { best_score: None }
        );
    }
}
