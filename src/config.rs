use std::path::PathBuf;

use anyhow::{Result, ensure};
use clap::Parser;
use serde::Serialize;

use crate::model::{MAX_POSITIONS, ModelConfig};
use crate::vocab::VocabOptions;

/// Train a Transformer language model on WikiText-2.
#[derive(Parser, Debug, Clone, Serialize)]
#[command(version, about)]
pub struct TrainConfig {
    /// Directory holding wiki.{train,valid,test}.tokens (searched recursively).
    #[arg(short = 'd', long, default_value = "data/wikitext-2")]
    pub data_dir: PathBuf,

    /// Parallel columns in the training grid.
    #[arg(short = 'b', long, default_value_t = 20)]
    pub batch_size: usize,

    /// Parallel columns in the validation and test grids.
    #[arg(long, default_value_t = 10)]
    pub eval_batch_size: usize,

    /// Longest window (rows) fed to the model per step.
    #[arg(long, default_value_t = 35)]
    pub bptt: usize,

    #[arg(long, default_value_t = 200)]
    pub emsize: i64,

    #[arg(long, default_value_t = 200)]
    pub nhid: i64,

    #[arg(long, default_value_t = 2)]
    pub nlayers: usize,

    #[arg(long, default_value_t = 2)]
    pub nhead: i64,

    #[arg(long, default_value_t = 0.2)]
    pub dropout: f64,

    /// Initial SGD learning rate.
    #[arg(long, default_value_t = 5.0)]
    pub lr: f64,

    /// Learning-rate decay applied after every epoch.
    #[arg(long, default_value_t = 0.95)]
    pub gamma: f64,

    /// Maximum global gradient norm.
    #[arg(long, default_value_t = 0.5)]
    pub clip: f64,

    #[arg(short = 'e', long, default_value_t = 3)]
    pub epochs: usize,

    /// Batches between progress lines.
    #[arg(long, default_value_t = 200)]
    pub log_interval: usize,

    #[arg(long, default_value_t = 42)]
    pub seed: i64,

    /// Training tokens seen fewer times than this become <unk>.
    #[arg(long, default_value_t = 1)]
    pub min_freq: usize,

    #[arg(long)]
    pub max_vocab: Option<usize>,

    /// Save the best model's weights here; the vocabulary goes next to it.
    #[arg(short = 'o', long)]
    pub checkpoint: Option<PathBuf>,

    /// Write a JSON summary of the run here.
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Train on the CPU even when CUDA is available.
    #[arg(long, default_value_t = false)]
    pub cpu: bool,

    /// libtorch_cuda shared object to load before probing for CUDA.
    #[arg(long)]
    pub cuda_lib: Option<PathBuf>,
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch size must be positive");
        ensure!(self.eval_batch_size > 0, "eval batch size must be positive");
        ensure!(self.bptt > 0, "bptt must be positive");
        ensure!(
            self.bptt <= MAX_POSITIONS as usize,
            "bptt ({}) exceeds the {} positions the model encodes",
            self.bptt,
            MAX_POSITIONS
        );
        ensure!(self.epochs > 0, "epochs must be positive");
        ensure!(self.log_interval > 0, "log interval must be positive");
        ensure!(
            self.emsize > 0 && self.nhead > 0 && self.nhid > 0,
            "model dimensions must be positive"
        );
        ensure!(
            self.emsize % self.nhead == 0,
            "emsize ({}) must be divisible by nhead ({})",
            self.emsize,
            self.nhead
        );
        ensure!(
            (0.0..1.0).contains(&self.dropout),
            "dropout must be in [0, 1), got {}",
            self.dropout
        );
        ensure!(self.lr > 0.0, "learning rate must be positive");
        ensure!(self.clip > 0.0, "clip norm must be positive");
        ensure!(
            self.gamma > 0.0 && self.gamma <= 1.0,
            "gamma must be in (0, 1], got {}",
            self.gamma
        );
        Ok(())
    }

    pub fn model_config(&self, ntokens: usize) -> ModelConfig {
        ModelConfig {
            ntokens: ntokens as i64,
            emsize: self.emsize,
            nhead: self.nhead,
            nhid: self.nhid,
            nlayers: self.nlayers,
            dropout: self.dropout,
        }
    }

    pub fn vocab_options(&self) -> VocabOptions {
        VocabOptions {
            min_freq: self.min_freq,
            max_size: self.max_vocab,
        }
    }
}
