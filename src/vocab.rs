use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const UNK_TOKEN: &str = "<unk>";
pub const PAD_TOKEN: &str = "<pad>";
pub const SOS_TOKEN: &str = "<sos>";
pub const EOS_TOKEN: &str = "<eos>";

/// Reserved tokens, in ID order.
pub const SPECIALS: [&str; 4] = [UNK_TOKEN, PAD_TOKEN, SOS_TOKEN, EOS_TOKEN];

pub const UNK_ID: i64 = 0;

#[derive(Debug, Clone, Copy)]
pub struct VocabOptions {
    /// Tokens seen fewer times than this map to `<unk>`.
    pub min_freq: usize,
    /// Cap on regular (non-special) tokens.
    pub max_size: Option<usize>,
}

impl Default for VocabOptions {
    fn default() -> Self {
        VocabOptions {
            min_freq: 1,
            max_size: None,
        }
    }
}

/// Word-to-ID mapping. Specials come first, then tokens by descending
/// frequency with ties broken alphabetically.
///
/// Serializes as the plain list of tokens in ID order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Vocab {
    itos: Vec<String>,
    stoi: HashMap<String, i64>,
}

impl From<Vec<String>> for Vocab {
    fn from(itos: Vec<String>) -> Self {
        let stoi = itos
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as i64))
            .collect();
        Vocab { itos, stoi }
    }
}

impl From<Vocab> for Vec<String> {
    fn from(vocab: Vocab) -> Self {
        vocab.itos
    }
}

impl Vocab {
    pub fn build<'a, I>(tokens: I, options: VocabOptions) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for token in tokens {
            *counts.entry(token).or_default() += 1;
        }
        for special in SPECIALS {
            counts.remove(special);
        }

        let mut words: Vec<(&str, usize)> = counts
            .into_iter()
            .filter(|&(_, n)| n >= options.min_freq.max(1))
            .collect();
        words.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        if let Some(max_size) = options.max_size {
            words.truncate(max_size);
        }

        let itos: Vec<String> = SPECIALS
            .iter()
            .map(|s| s.to_string())
            .chain(words.into_iter().map(|(w, _)| w.to_owned()))
            .collect();
        Vocab::from(itos)
    }

    pub fn len(&self) -> usize {
        self.itos.len()
    }

    /// ID of `token`, or `<unk>` when the token is out of vocabulary.
    pub fn id(&self, token: &str) -> i64 {
        self.stoi.get(token).copied().unwrap_or(UNK_ID)
    }

    pub fn token(&self, id: i64) -> Option<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.itos.get(i))
            .map(String::as_str)
    }

    pub fn numericalize<S: AsRef<str>>(&self, tokens: &[S]) -> Vec<i64> {
        tokens.iter().map(|t| self.id(t.as_ref())).collect()
    }
}
