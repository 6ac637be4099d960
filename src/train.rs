use std::{fs::File, io::BufWriter, path::Path, time::Instant};

use anyhow::{Context, Result, ensure};
use serde::Serialize;
use tch::{
    Device, Tensor,
    nn::{ModuleT, Optimizer, OptimizerConfig, Sgd, VarStore},
};
use tracing::{info, trace};

use crate::{
    batch::{Grid, batchify},
    config::TrainConfig,
    dataset::Corpus,
    model::TransformerModel,
    vocab::Vocab,
};

pub fn perplexity(loss: f64) -> f64 {
    loss.exp()
}

/// Decays the learning rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone)]
pub struct StepLr {
    initial_lr: f64,
    step_size: usize,
    gamma: f64,
    epoch: usize,
}

impl StepLr {
    pub fn new(initial_lr: f64, step_size: usize, gamma: f64) -> Self {
        StepLr {
            initial_lr,
            step_size: step_size.max(1),
            gamma,
            epoch: 0,
        }
    }

    pub fn lr(&self) -> f64 {
        self.initial_lr * self.gamma.powi((self.epoch / self.step_size) as i32)
    }

    /// Advances one epoch and returns the new learning rate.
    pub fn step(&mut self) -> f64 {
        self.epoch += 1;
        self.lr()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub lr: f64,
    pub train_loss: f64,
    pub valid_loss: f64,
    pub valid_ppl: f64,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub config: TrainConfig,
    pub vocab_size: usize,
    pub epochs: Vec<EpochReport>,
    pub best_epoch: usize,
    pub best_valid_loss: f64,
    pub test_loss: f64,
    pub test_ppl: f64,
}

#[derive(Debug, Clone, Copy)]
struct BestEpoch {
    epoch: usize,
    valid_loss: f64,
}

/// Owns the model being trained and a second, frozen copy of the weights
/// that scored the lowest validation loss so far.
pub struct Trainer {
    config: TrainConfig,
    device: Device,
    ntokens: i64,
    var_store: VarStore,
    model: TransformerModel,
    optimizer: Optimizer,
    scheduler: StepLr,
    best_store: VarStore,
    best_model: TransformerModel,
    best: Option<BestEpoch>,
}

impl Trainer {
    pub fn new(config: TrainConfig, ntokens: usize, device: Device) -> Result<Trainer> {
        let model_config = config.model_config(ntokens);
        let var_store = VarStore::new(device);
        let model = TransformerModel::new(&var_store.root(), &model_config);
        let best_store = VarStore::new(device);
        let best_model = TransformerModel::new(&best_store.root(), &model_config);
        let optimizer = Sgd::default()
            .build(&var_store, config.lr)
            .context("failed to create SGD optimizer")?;
        info!(
            parameters = count_parameters(&var_store),
            ?device,
            "model initialized"
        );
        Ok(Trainer {
            scheduler: StepLr::new(config.lr, 1, config.gamma),
            config,
            device,
            ntokens: model_config.ntokens,
            var_store,
            model,
            optimizer,
            best_store,
            best_model,
            best: None,
        })
    }

    /// Trains for the configured epochs, keeps the best model by validation
    /// loss, and scores it on the test split.
    pub fn fit(&mut self, corpus: &Corpus) -> Result<TrainingReport> {
        let bptt = self.config.bptt;
        let train = batchify(&corpus.train, self.config.batch_size)
            .context("failed to batchify training split")?;
        let valid = batchify(&corpus.valid, self.config.eval_batch_size)
            .context("failed to batchify validation split")?;
        let test = batchify(&corpus.test, self.config.eval_batch_size)
            .context("failed to batchify test split")?;
        info!(
            train = ?[train.rows(), train.batch_size()],
            valid = ?[valid.rows(), valid.batch_size()],
            test = ?[test.rows(), test.batch_size()],
            "batched splits"
        );
        if let Some(path) = &self.config.checkpoint {
            save_vocab(&corpus.vocab, path)?;
        }

        let mut epochs = Vec::with_capacity(self.config.epochs);
        for epoch in 1..=self.config.epochs {
            let epoch_start = Instant::now();
            let lr = self.scheduler.lr();
            let train_loss = self.train_epoch(epoch, &train)?;
            let valid_loss = evaluate(&self.model, &valid, bptt, self.device)?;
            let elapsed_secs = epoch_start.elapsed().as_secs_f64();

            info!("{}", "-".repeat(89));
            info!(
                "| end of epoch {:3} | time: {:5.2}s | valid loss {:5.2} | valid ppl {:8.2}",
                epoch,
                elapsed_secs,
                valid_loss,
                perplexity(valid_loss)
            );
            info!("{}", "-".repeat(89));

            let best_so_far = self.best.map_or(f64::INFINITY, |b| b.valid_loss);
            if valid_loss < best_so_far {
                self.snapshot_best(epoch, valid_loss)?;
            }
            epochs.push(EpochReport {
                epoch,
                lr,
                train_loss,
                valid_loss,
                valid_ppl: perplexity(valid_loss),
                elapsed_secs,
            });

            let lr = self.scheduler.step();
            self.optimizer.set_lr(lr);
        }

        let best = self
            .best
            .context("no epoch produced a finite validation loss")?;
        let test_loss = evaluate(&self.best_model, &test, bptt, self.device)?;
        info!("{}", "=".repeat(89));
        info!(
            "| End of training | test loss {:5.2} | test ppl {:8.2}",
            test_loss,
            perplexity(test_loss)
        );
        info!("{}", "=".repeat(89));

        Ok(TrainingReport {
            config: self.config.clone(),
            vocab_size: corpus.vocab.len(),
            epochs,
            best_epoch: best.epoch,
            best_valid_loss: best.valid_loss,
            test_loss,
            test_ppl: perplexity(test_loss),
        })
    }

    // Perform one epoch; returns the mean training loss.
    fn train_epoch(&mut self, epoch: usize, grid: &Grid) -> Result<f64> {
        let log_interval = self.config.log_interval;
        let num_batches = grid.num_batches(self.config.bptt);
        let mut total_loss = 0.0;
        let mut steps = 0;
        let mut interval_loss = 0.0;
        let mut interval_steps = 0;
        let mut interval_start = Instant::now();

        for (batch, window) in grid.windows(self.config.bptt)?.enumerate() {
            trace!(start_row = window.start_row, seq_len = window.seq_len, "window");
            let (input, target) = window.to_tensors(self.device);
            let loss = self.train_step(&input, &target);
            total_loss += loss;
            steps += 1;
            interval_loss += loss;
            interval_steps += 1;

            if batch % log_interval == 0 && batch > 0 {
                let cur_loss = interval_loss / interval_steps as f64;
                let ms_per_batch =
                    interval_start.elapsed().as_secs_f64() * 1000.0 / interval_steps as f64;
                info!(
                    "| epoch {:3} | {:5}/{:5} batches | lr {:02.2} | ms/batch {:5.2} | loss {:5.2} | ppl {:8.2}",
                    epoch,
                    batch,
                    num_batches,
                    self.scheduler.lr(),
                    ms_per_batch,
                    cur_loss,
                    perplexity(cur_loss)
                );
                interval_loss = 0.0;
                interval_steps = 0;
                interval_start = Instant::now();
            }
        }
        ensure!(
            steps > 0,
            "training grid with {} rows yields no windows",
            grid.rows()
        );
        Ok(total_loss / steps as f64)
    }

    // Perform one training step.
    fn train_step(&mut self, input: &Tensor, target: &Tensor) -> f64 {
        // [seq_len, batch, ntokens] flattened to one row per predicted position
        let logits = self.model.forward_t(input, true);
        let loss = logits
            .reshape([-1, self.ntokens])
            .cross_entropy_for_logits(target);
        self.optimizer
            .backward_step_clip_norm(&loss, self.config.clip);
        loss.double_value(&[])
    }

    fn snapshot_best(&mut self, epoch: usize, valid_loss: f64) -> Result<()> {
        self.best_store
            .copy(&self.var_store)
            .context("failed to snapshot best model")?;
        self.best = Some(BestEpoch { epoch, valid_loss });
        info!(epoch, valid_loss, "new best model");
        if let Some(path) = &self.config.checkpoint {
            self.best_store
                .save(path)
                .with_context(|| format!("failed to save checkpoint to {}", path.display()))?;
            info!(path = %path.display(), "checkpoint saved");
        }
        Ok(())
    }
}

/// Mean cross-entropy over every predicted position of `grid`, with gradients
/// and dropout disabled.
pub fn evaluate(model: &impl ModuleT, grid: &Grid, bptt: usize, device: Device) -> Result<f64> {
    tch::no_grad(|| {
        let mut total_loss = 0.0;
        let mut positions = 0;
        for window in grid.windows(bptt)? {
            let (input, target) = window.to_tensors(device);
            let logits = model.forward_t(&input, false);
            let ntokens = logits.size()[2];
            let loss = logits
                .reshape([-1, ntokens])
                .cross_entropy_for_logits(&target)
                .double_value(&[]);
            total_loss += window.seq_len as f64 * loss;
            positions += window.seq_len;
        }
        ensure!(
            positions > 0,
            "evaluation grid with {} rows yields no windows",
            grid.rows()
        );
        Ok(total_loss / positions as f64)
    })
}

fn count_parameters(var_store: &VarStore) -> i64 {
    var_store
        .trainable_variables()
        .iter()
        .map(|t| t.numel() as i64)
        .sum()
}

/// Writes the vocabulary next to the checkpoint as `<stem>.vocab.json`.
fn save_vocab(vocab: &Vocab, checkpoint: &Path) -> Result<()> {
    let path = checkpoint.with_extension("vocab.json");
    let file = File::create(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer(BufWriter::new(file), vocab)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), tokens = vocab.len(), "vocabulary saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dataset::frame_tokens, tokenizer::Tokenizer, vocab::VocabOptions};
    use clap::Parser;

    const TEXT: &str = " = Valkyria Chronicles = \n\
        The game began development in 2010 , carrying over a large portion of the work .\n\
        The game 's battle system was carried over directly from the first game .\n\
        It was also the first game in the series to be released outside of Japan .\n";

    fn tiny_config() -> TrainConfig {
        let mut config = TrainConfig::parse_from(["wikitext-lm"]);
        config.batch_size = 2;
        config.eval_batch_size = 2;
        config.bptt = 4;
        config.emsize = 16;
        config.nhid = 32;
        config.nlayers = 1;
        config.nhead = 2;
        config.dropout = 0.0;
        config.lr = 1.0;
        config.epochs = 2;
        config.log_interval = 2;
        config
    }

    fn tiny_corpus() -> Corpus {
        let tokens = frame_tokens(TEXT, &Tokenizer::basic_english());
        let vocab = Vocab::build(tokens.iter().map(String::as_str), VocabOptions::default());
        let stream = vocab.numericalize(&tokens);
        Corpus {
            train: stream.clone(),
            valid: stream[..30].to_vec(),
            test: stream[10..40].to_vec(),
            vocab,
        }
    }

    fn setup_trainer(config: TrainConfig) -> (Trainer, Corpus) {
        tch::manual_seed(7);
        let corpus = tiny_corpus();
        let trainer = Trainer::new(config, corpus.vocab.len(), Device::Cpu).unwrap();
        (trainer, corpus)
    }

    fn sample_window(corpus: &Corpus) -> (Tensor, Tensor) {
        let grid = batchify(&corpus.train, 2).unwrap();
        grid.window(0, 4).to_tensors(Device::Cpu)
    }

    #[test]
    fn test_train_step_loss_is_finite() {
        let (mut trainer, corpus) = setup_trainer(tiny_config());
        let (input, target) = sample_window(&corpus);
        let loss = trainer.train_step(&input, &target);
        assert!(loss.is_finite(), "Loss should be a finite number, got {}", loss);
        assert!(loss > 0.0, "Cross-entropy loss should be positive, got {}", loss);
    }

    #[test]
    fn test_train_step_loss_decreases() {
        let (mut trainer, corpus) = setup_trainer(tiny_config());
        let (input, target) = sample_window(&corpus);
        let first_loss = trainer.train_step(&input, &target);
        let mut last_loss = first_loss;
        for _ in 0..50 {
            last_loss = trainer.train_step(&input, &target);
        }
        assert!(
            last_loss < first_loss,
            "Loss should decrease after repeated training on same input: first={}, last={}",
            first_loss,
            last_loss
        );
    }

    #[test]
    fn test_evaluate_returns_mean_loss() {
        let (trainer, corpus) = setup_trainer(tiny_config());
        let grid = batchify(&corpus.valid, 2).unwrap();
        let loss = evaluate(&trainer.model, &grid, 4, Device::Cpu).unwrap();
        assert!(loss.is_finite() && loss > 0.0);
        // An untrained model should be close to uniform over the vocabulary.
        let uniform = (corpus.vocab.len() as f64).ln();
        assert!(loss < uniform * 2.0, "loss {} vs uniform {}", loss, uniform);
    }

    #[test]
    fn test_evaluate_rejects_grid_without_windows() {
        let (trainer, _corpus) = setup_trainer(tiny_config());
        let grid = batchify(&[1, 2, 3], 2).unwrap();
        assert!(evaluate(&trainer.model, &grid, 4, Device::Cpu).is_err());
    }

    #[test]
    fn test_step_lr_schedule() {
        let mut scheduler = StepLr::new(5.0, 1, 0.95);
        assert_eq!(scheduler.lr(), 5.0);
        scheduler.step();
        let lr = scheduler.step();
        assert!((lr - 5.0 * 0.95 * 0.95).abs() < 1e-12);

        let mut every_other = StepLr::new(1.0, 2, 0.5);
        assert_eq!(every_other.step(), 1.0);
        assert_eq!(every_other.step(), 0.5);
    }

    #[test]
    fn test_best_model_is_a_snapshot() {
        let (mut trainer, corpus) = setup_trainer(tiny_config());
        let (input, target) = sample_window(&corpus);
        trainer.snapshot_best(1, 1.0).unwrap();
        let before = trainer.best_model.forward_t(&input, false);
        for _ in 0..5 {
            trainer.train_step(&input, &target);
        }
        let after = trainer.best_model.forward_t(&input, false);
        let current = trainer.model.forward_t(&input, false);
        let frozen = f64::try_from(&(&before - &after).abs().sum(tch::Kind::Float)).unwrap();
        let moved = f64::try_from(&(&before - &current).abs().sum(tch::Kind::Float)).unwrap();
        assert!(frozen < 1e-6, "best model changed by {}", frozen);
        assert!(moved > 1e-6, "training did not move the live model");
    }

    #[test]
    fn test_fit_reports_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tiny_config();
        config.checkpoint = Some(dir.path().join("model.ot"));
        let (mut trainer, corpus) = setup_trainer(config);
        let report = trainer.fit(&corpus).unwrap();

        assert_eq!(report.epochs.len(), 2);
        assert!((1..=2).contains(&report.best_epoch));
        assert!(report.test_loss.is_finite());
        assert!((report.test_ppl - report.test_loss.exp()).abs() < 1e-9);
        let best = report
            .epochs
            .iter()
            .map(|e| e.valid_loss)
            .fold(f64::INFINITY, f64::min);
        assert_eq!(report.best_valid_loss, best);
        assert!(report.epochs[1].lr < report.epochs[0].lr);

        assert!(dir.path().join("model.ot").exists());
        let vocab_json = std::fs::read_to_string(dir.path().join("model.vocab.json")).unwrap();
        let vocab: Vocab = serde_json::from_str(&vocab_json).unwrap();
        assert_eq!(vocab.len(), corpus.vocab.len());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["config"]["bptt"], 4);
        assert_eq!(json["epochs"].as_array().map(Vec::len), Some(2));
    }
}
