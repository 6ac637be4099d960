use std::{ffi::CString, fs::File, io::BufWriter, os::unix::ffi::OsStrExt, path::Path};

use anyhow::{Context, Result};
use clap::Parser;
use tch::Device;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod batch;
mod config;
mod dataset;
mod error;
mod model;
mod tokenizer;
mod train;
mod vocab;

use config::TrainConfig;
use dataset::Corpus;
use tokenizer::Tokenizer;
use train::Trainer;

fn main() -> Result<()> {
    configure_logging();
    let config = TrainConfig::parse();
    config.validate().context("invalid configuration")?;
    info!(config = %serde_json::to_string(&config)?, "starting");

    tch::manual_seed(config.seed);
    let device = select_device(&config);

    let corpus = Corpus::load(
        &config.data_dir,
        &Tokenizer::basic_english(),
        config.vocab_options(),
    )
    .with_context(|| format!("failed to load corpus from {}", config.data_dir.display()))?;

    let report_path = config.report.clone();
    let mut trainer = Trainer::new(config, corpus.vocab.len(), device)?;
    let report = trainer.fit(&corpus)?;

    if let Some(path) = report_path {
        let file = File::create(&path)
            .with_context(|| format!("failed to create report {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &report)?;
        info!(path = %path.display(), "report written");
    }
    Ok(())
}

fn configure_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(filter)
        .init();
}

fn select_device(config: &TrainConfig) -> Device {
    if config.cpu {
        return Device::Cpu;
    }
    if let Some(lib) = &config.cuda_lib {
        preload_cuda(lib);
    }
    let device = Device::cuda_if_available();
    if device == Device::Cpu {
        warn!("CUDA not available, training on CPU");
    }
    device
}

/// libtorch loads its CUDA backend lazily, so `Cuda::is_available` can report
/// false until the library has been opened.
fn preload_cuda(lib: &Path) {
    let Ok(path) = CString::new(lib.as_os_str().as_bytes()) else {
        warn!(path = %lib.display(), "CUDA library path contains a NUL byte");
        return;
    };
    let handle = unsafe { libc::dlopen(path.as_ptr(), libc::RTLD_LAZY) };
    if handle.is_null() {
        warn!(path = %lib.display(), "failed to load CUDA library");
    } else {
        info!(path = %lib.display(), "CUDA library loaded");
    }
}
