//! Deterministic stand-in toolkit.
//!
//! Templates are coarse point samples of the frame: each grid cell stores a
//! quantized intensity, or `BACKGROUND` where the platen is empty. Identical
//! placements score high and unrelated ridge patterns score near zero, which
//! is enough to exercise the pipeline without NBIS installed.

use anyhow::{anyhow, Result};
use std::time::Duration;

use super::{Extraction, MinutiaeExtractor, TemplateScorer};
use crate::frame::Frame;

const MAGIC: &[u8; 4] = b"STB1";
const GRID: u32 = 24;
const BACKGROUND: u8 = 0xFF;
const BACKGROUND_LEVEL: u8 = 250;
const LEVEL_WIDTH: u8 = 32;
/// Subtracted from the agreement percentage so chance agreement scores ~0.
const CHANCE_OFFSET: i32 = 25;

#[derive(Default)]
pub struct StubExtractor;

impl StubExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl MinutiaeExtractor for StubExtractor {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn extract(&self, frame: &Frame, _timeout: Duration) -> Result<Extraction> {
        if frame.width == 0 || frame.height == 0 {
            return Err(anyhow!("empty frame"));
        }
        let gw = GRID.min(frame.width);
        let gh = GRID.min(frame.height);
        let pixels = frame.pixels();
        let mut template = Vec::with_capacity(MAGIC.len() + 2 + (gw * gh) as usize);
        template.extend_from_slice(MAGIC);
        template.push(gw as u8);
        template.push(gh as u8);
        let mut foreground = 0i32;
        for gy in 0..gh {
            let y = (2 * gy + 1) * frame.height / (2 * gh);
            for gx in 0..gw {
                let x = (2 * gx + 1) * frame.width / (2 * gw);
                let p = pixels[(y * frame.width + x) as usize];
                if p >= BACKGROUND_LEVEL {
                    template.push(BACKGROUND);
                } else {
                    template.push(p / LEVEL_WIDTH);
                    foreground += 1;
                }
            }
        }
        Ok(Extraction {
            template,
            quality_score: foreground / 10,
        })
    }
}

#[derive(Default)]
pub struct StubScorer;

impl StubScorer {
    pub fn new() -> Self {
        Self
    }
}

fn cells(template: &[u8]) -> Result<(u8, u8, &[u8])> {
    if template.len() < MAGIC.len() + 2 || &template[..MAGIC.len()] != MAGIC {
        return Err(anyhow!("not a stub template"));
    }
    let gw = template[MAGIC.len()];
    let gh = template[MAGIC.len() + 1];
    let body = &template[MAGIC.len() + 2..];
    if body.len() != gw as usize * gh as usize {
        return Err(anyhow!("truncated stub template"));
    }
    Ok((gw, gh, body))
}

impl TemplateScorer for StubScorer {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn score(&self, probe: &[u8], gallery: &[u8], _timeout: Duration) -> Result<i32> {
        let (pw, ph, probe) = cells(probe)?;
        let (gw, gh, gallery) = cells(gallery)?;
        if (pw, ph) != (gw, gh) {
            return Err(anyhow!(
                "template grids differ: {}x{} vs {}x{}",
                pw,
                ph,
                gw,
                gh
            ));
        }
        let mut union = 0i32;
        let mut agree = 0i32;
        for (&a, &b) in probe.iter().zip(gallery) {
            if a == BACKGROUND && b == BACKGROUND {
                continue;
            }
            union += 1;
            if a == b {
                agree += 1;
            }
        }
        if union == 0 {
            return Ok(0);
        }
        Ok((agree * 100 / union - CHANCE_OFFSET).max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::synthetic::synthetic_fingerprint;
    use std::time::Instant;

    const W: u32 = 96;
    const H: u32 = 96;
    const T: Duration = Duration::from_secs(1);

    fn template(seed: u8) -> Result<Extraction> {
        let frame = Frame::new(synthetic_fingerprint(W, H, seed), W, H, Instant::now());
        StubExtractor::new().extract(&frame, T)
    }

    #[test]
    fn same_finger_scores_above_default_threshold() -> Result<()> {
        let a = template(1)?;
        let b = template(1)?;
        let score = StubScorer::new().score(&a.template, &b.template, T)?;
        assert_eq!(score, 75);
        Ok(())
    }

    #[test]
    fn different_fingers_score_low() -> Result<()> {
        let scorer = StubScorer::new();
        let a = template(1)?;
        for seed in [2u8, 3] {
            let b = template(seed)?;
            assert!(scorer.score(&a.template, &b.template, T)? < 40);
        }
        Ok(())
    }

    #[test]
    fn blank_platen_has_no_quality() -> Result<()> {
        let frame = Frame::new(vec![255; (W * H) as usize], W, H, Instant::now());
        let extraction = StubExtractor::new().extract(&frame, T)?;
        assert_eq!(extraction.quality_score, 0);
        let finger = template(1)?;
        assert!(finger.quality_score >= 20);
        Ok(())
    }

    #[test]
    fn foreign_templates_are_rejected() {
        let scorer = StubScorer::new();
        assert!(scorer.score(b"10 20 30 40\n", b"10 20 30 40\n", T).is_err());
    }
}
