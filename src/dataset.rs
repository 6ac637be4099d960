use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use tracing::{debug, info};

use crate::tokenizer::Tokenizer;
use crate::vocab::{EOS_TOKEN, Vocab, VocabOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl Split {
    pub fn file_name(self) -> &'static str {
        match self {
            Split::Train => "wiki.train.tokens",
            Split::Valid => "wiki.valid.tokens",
            Split::Test => "wiki.test.tokens",
        }
    }
}

/// The three WikiText splits as token-ID streams over a vocabulary built from
/// the training split.
#[derive(Debug, Clone)]
pub struct Corpus {
    pub vocab: Vocab,
    pub train: Vec<i64>,
    pub valid: Vec<i64>,
    pub test: Vec<i64>,
}

impl Corpus {
    pub fn load(data_dir: &Path, tokenizer: &Tokenizer, options: VocabOptions) -> Result<Self> {
        ensure!(
            data_dir.is_dir(),
            "data directory {} does not exist",
            data_dir.display()
        );
        let train = Self::read_split(data_dir, Split::Train, tokenizer)?;
        let valid = Self::read_split(data_dir, Split::Valid, tokenizer)?;
        let test = Self::read_split(data_dir, Split::Test, tokenizer)?;

        let vocab = Vocab::build(train.iter().map(String::as_str), options);
        info!(
            vocab_size = vocab.len(),
            train_tokens = train.len(),
            valid_tokens = valid.len(),
            test_tokens = test.len(),
            "corpus loaded"
        );
        let corpus = Corpus {
            train: vocab.numericalize(&train),
            valid: vocab.numericalize(&valid),
            test: vocab.numericalize(&test),
            vocab,
        };
        let head: Vec<&str> = corpus
            .train
            .iter()
            .take(12)
            .filter_map(|&id| corpus.vocab.token(id))
            .collect();
        debug!(?head, "start of training stream");
        Ok(corpus)
    }

    /// Splits may sit anywhere below `data_dir` (archives often unpack into a
    /// nested `wikitext-2/` folder).
    fn find_split(data_dir: &Path, split: Split) -> Result<PathBuf> {
        walkdir::WalkDir::new(data_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .find(|e| e.file_name() == split.file_name())
            .map(|e| e.into_path())
            .with_context(|| {
                format!(
                    "no {} found under {}",
                    split.file_name(),
                    data_dir.display()
                )
            })
    }

    fn read_split(data_dir: &Path, split: Split, tokenizer: &Tokenizer) -> Result<Vec<String>> {
        let path = Self::find_split(data_dir, split)?;
        debug!(path = %path.display(), ?split, "reading split");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(frame_tokens(&text, tokenizer))
    }
}

/// Tokenizes `text` line by line, closing every line (blank ones included)
/// with `<eos>`. `<sos>` stays a reserved vocabulary entry and never appears
/// in a stream.
pub fn frame_tokens(text: &str, tokenizer: &Tokenizer) -> Vec<String> {
    let mut tokens = Vec::new();
    for line in text.lines() {
        tokens.extend(tokenizer.tokenize(line));
        tokens.push(EOS_TOKEN.to_owned());
    }
    tokens
}
