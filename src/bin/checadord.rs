//! checadord - fingerprint time clock daemon
//!
//! This daemon:
//! 1. Loads and validates the kiosk configuration (fatal on error)
//! 2. Verifies the fingerprint toolkit is installed
//! 3. Opens the punch store and restores the saved calibration
//! 4. Runs the capture pipeline and, if enabled, the sync worker
//! 5. Serves the loopback control API until Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;

use checador::api::{ApiConfig, ApiServer};
use checador::{FrameSource, Kiosk, KioskConfig, Store, Toolkit};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to config.toml (default /etc/checador/config.toml).
    #[arg(long, env = "CHECADOR_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = KioskConfig::load_from(args.config.as_deref()).context("configuration error")?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data dir {}", config.data_dir.display()))?;
    let toolkit = Toolkit::from_settings(&config.fingerprint, &config.temp_dir())
        .context("fingerprint toolkit unavailable")?;

    let roi = {
        let store = Store::open(&config.db_path)?;
        match store.calibration()? {
            Some(saved) => {
                log::info!("using saved calibration {:?}", saved);
                saved
            }
            None => config.camera.roi,
        }
    };
    let source = FrameSource::from_config(&config.camera, roi)?;
    let kiosk = Kiosk::start(&config, toolkit, source)?;

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        token_path: config.api_token_path.clone(),
    };
    let api_handle = ApiServer::new(api_config, kiosk.clone()).spawn()?;
    if let Some(path) = &api_handle.token_path {
        log::info!("control api token written to {}", path.display());
    } else {
        log::warn!(
            "control api token (handle securely): {}",
            api_handle.token
        );
    }
    log::info!(
        "checadord running. device_id={} db={} camera={}",
        config.device_id,
        config.db_path,
        config.camera.device
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");
    api_handle.stop()?;
    kiosk.shutdown()?;
    log::info!("checadord stopped");
    Ok(())
}
