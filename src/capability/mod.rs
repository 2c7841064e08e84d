//! Fingerprint toolkit capabilities.
//!
//! The kiosk never interprets templates itself. It calls two black-box
//! capabilities:
//! - extraction: frame -> (template bytes, quality score)
//! - scoring: (probe, gallery) -> similarity (higher = more similar)
//!
//! Backends live behind `MinutiaeExtractor` / `TemplateScorer` so the
//! algorithm or vendor can be swapped without touching the pipeline.

mod nbis;
mod stub;

use anyhow::{anyhow, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{FingerprintSettings, ToolkitBackend};
use crate::frame::Frame;

pub use nbis::{NbisExtractor, NbisScorer};
pub use stub::{StubExtractor, StubScorer};

/// Output of a successful extraction.
pub struct Extraction {
    pub template: Vec<u8>,
    pub quality_score: i32,
}

/// Image -> minutiae template.
///
/// # Audit Boundary
///
/// Implementations receive raw fingerprint pixels. They MUST NOT retain them
/// beyond the call and MUST return (or fail) within `timeout`.
pub trait MinutiaeExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract(&self, frame: &Frame, timeout: Duration) -> Result<Extraction>;
}

/// Two templates -> integer similarity.
pub trait TemplateScorer: Send + Sync {
    fn name(&self) -> &'static str;

    fn score(&self, probe: &[u8], gallery: &[u8], timeout: Duration) -> Result<i32>;
}

/// The pair of capabilities the pipeline runs with.
#[derive(Clone)]
pub struct Toolkit {
    pub extractor: Arc<dyn MinutiaeExtractor>,
    pub scorer: Arc<dyn TemplateScorer>,
}

impl Toolkit {
    pub fn new(extractor: Arc<dyn MinutiaeExtractor>, scorer: Arc<dyn TemplateScorer>) -> Self {
        Self { extractor, scorer }
    }

    pub fn stub() -> Self {
        Self::new(Arc::new(StubExtractor::new()), Arc::new(StubScorer::new()))
    }

    /// Build the configured backend. Missing NBIS binaries are a startup error.
    pub fn from_settings(settings: &FingerprintSettings, temp_dir: &Path) -> Result<Self> {
        match settings.backend {
            ToolkitBackend::Stub => {
                log::warn!("using stub fingerprint toolkit; not for production enrollment");
                Ok(Self::stub())
            }
            ToolkitBackend::Nbis => {
                for tool in [&settings.mindtct, &settings.bozorth3] {
                    if !tool.exists() {
                        return Err(anyhow!(
                            "NBIS tool not found: {} (install NBIS and update config.toml)",
                            tool.display()
                        ));
                    }
                }
                std::fs::create_dir_all(temp_dir).map_err(|e| {
                    anyhow!("failed to create temp dir {}: {}", temp_dir.display(), e)
                })?;
                Ok(Self::new(
                    Arc::new(NbisExtractor::new(&settings.mindtct, temp_dir)),
                    Arc::new(NbisScorer::new(&settings.bozorth3, temp_dir)),
                ))
            }
        }
    }
}
