//! NIST Biometric Image Software backend: `mindtct` extracts, `bozorth3` scores.
//!
//! Both tools exchange files, so every call writes into the kiosk temp dir
//! and removes its files afterwards. Each subprocess is killed at its deadline.

use anyhow::{anyhow, Context, Result};
use image::GrayImage;
use rand::RngCore;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{Extraction, MinutiaeExtractor, TemplateScorer};
use crate::frame::Frame;

/// Every file mindtct may write next to its output root.
const MINDTCT_OUTPUTS: &[&str] = &["xyt", "min", "qm", "dm", "hcm", "lcm", "lfm", "brw"];
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct NbisExtractor {
    mindtct: PathBuf,
    temp_dir: PathBuf,
}

impl NbisExtractor {
    pub fn new(mindtct: &Path, temp_dir: &Path) -> Self {
        Self {
            mindtct: mindtct.to_path_buf(),
            temp_dir: temp_dir.to_path_buf(),
        }
    }
}

impl MinutiaeExtractor for NbisExtractor {
    fn name(&self) -> &'static str {
        "nbis-mindtct"
    }

    fn extract(&self, frame: &Frame, timeout: Duration) -> Result<Extraction> {
        let stem = self.temp_dir.join(format!("probe_{}", random_suffix()));
        let image_path = stem.with_extension("png");
        let mut scratch = ScratchFiles::default();
        scratch.push(image_path.clone());
        for ext in MINDTCT_OUTPUTS {
            scratch.push(stem.with_extension(ext));
        }

        let image = GrayImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", frame.width, frame.height))?;
        image
            .save(&image_path)
            .with_context(|| format!("write {}", image_path.display()))?;

        let mut cmd = Command::new(&self.mindtct);
        cmd.arg(&image_path).arg(&stem);
        let output = run_with_deadline(cmd, timeout).context("mindtct")?;
        if !output.success {
            return Err(anyhow!("mindtct failed: {}", output.stderr.trim()));
        }

        let xyt_path = stem.with_extension("xyt");
        let template = std::fs::read(&xyt_path)
            .with_context(|| format!("xyt file not created: {}", xyt_path.display()))?;
        let quality_score = minutiae_count(&template);
        log::debug!("features extracted (quality={})", quality_score);
        Ok(Extraction {
            template,
            quality_score,
        })
    }
}

pub struct NbisScorer {
    bozorth3: PathBuf,
    temp_dir: PathBuf,
}

impl NbisScorer {
    pub fn new(bozorth3: &Path, temp_dir: &Path) -> Self {
        Self {
            bozorth3: bozorth3.to_path_buf(),
            temp_dir: temp_dir.to_path_buf(),
        }
    }
}

impl TemplateScorer for NbisScorer {
    fn name(&self) -> &'static str {
        "nbis-bozorth3"
    }

    fn score(&self, probe: &[u8], gallery: &[u8], timeout: Duration) -> Result<i32> {
        let suffix = random_suffix();
        let probe_path = self.temp_dir.join(format!("match_{}_p.xyt", suffix));
        let gallery_path = self.temp_dir.join(format!("match_{}_g.xyt", suffix));
        let mut scratch = ScratchFiles::default();
        scratch.push(probe_path.clone());
        scratch.push(gallery_path.clone());
        std::fs::write(&probe_path, probe).context("write probe xyt")?;
        std::fs::write(&gallery_path, gallery).context("write gallery xyt")?;

        let mut cmd = Command::new(&self.bozorth3);
        cmd.arg(&probe_path).arg(&gallery_path);
        let output = run_with_deadline(cmd, timeout).context("bozorth3")?;
        if !output.success {
            return Err(anyhow!("bozorth3 failed: {}", output.stderr.trim()));
        }
        parse_bozorth_score(&output.stdout)
    }
}

/// Quality = number of minutiae lines in an xyt file.
pub(crate) fn minutiae_count(xyt: &[u8]) -> i32 {
    String::from_utf8_lossy(xyt)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .count() as i32
}

pub(crate) fn parse_bozorth_score(stdout: &str) -> Result<i32> {
    let first = stdout
        .split_whitespace()
        .next()
        .ok_or_else(|| anyhow!("empty bozorth3 output"))?;
    first
        .parse::<i32>()
        .map_err(|_| anyhow!("invalid bozorth3 output: {}", stdout.trim()))
}

struct ProcessOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Run `cmd`, killing it if it has not exited by `timeout`.
///
/// Both pipes are drained on their own threads while the child runs, so a
/// chatty tool cannot stall on a full pipe buffer and hit the deadline.
fn run_with_deadline(mut cmd: Command, timeout: Duration) -> Result<ProcessOutput> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawn")?;
    let stdout_reader = drain(child.stdout.take());
    let stderr_reader = drain(child.stderr.take());
    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err).context("wait");
            }
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(anyhow!("timed out after {:?}", timeout));
        }
        std::thread::sleep(POLL_INTERVAL);
    };
    let stdout = collect(stdout_reader).context("read stdout")?;
    let stderr = collect(stderr_reader).context("read stderr")?;
    Ok(ProcessOutput {
        success: status.success(),
        stdout,
        stderr,
    })
}

type PipeReader = Option<JoinHandle<std::io::Result<Vec<u8>>>>;

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> PipeReader {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf)?;
            Ok(buf)
        })
    })
}

fn collect(reader: PipeReader) -> Result<String> {
    let Some(handle) = reader else {
        return Ok(String::new());
    };
    let bytes = handle
        .join()
        .map_err(|_| anyhow!("pipe reader panicked"))??;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn random_suffix() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Removes its files on drop. Biometric scratch data must not outlive the call.
#[derive(Default)]
struct ScratchFiles(Vec<PathBuf>);

impl ScratchFiles {
    fn push(&mut self, path: PathBuf) {
        self.0.push(path);
    }
}

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        for path in &self.0 {
            if path.exists() {
                if let Err(err) = std::fs::remove_file(path) {
                    log::warn!("failed to remove {}: {}", path.display(), err);
                }
            }
        }
    }
}
