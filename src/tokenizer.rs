/// Basic-English word tokenizer: lowercase, pad punctuation with spaces, split
/// on whitespace.
#[derive(Debug, Clone, Default)]
pub struct Tokenizer {}

/// Applied in order. The apostrophe rule leaves `'` as its own token.
const NORMALIZE_RULES: &[(&str, &str)] = &[
    ("'", " '  "),
    ("\"", ""),
    (".", " . "),
    ("<br />", " "),
    (",", " , "),
    ("(", " ( "),
    (")", " ) "),
    ("!", " ! "),
    ("?", " ? "),
    (";", " "),
    (":", " "),
];

impl Tokenizer {
    pub fn basic_english() -> Self {
        Tokenizer {}
    }

    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let mut line = text.to_lowercase();
        for (pattern, replacement) in NORMALIZE_RULES {
            if line.contains(pattern) {
                line = line.replace(pattern, replacement);
            }
        }
        line.split_whitespace().map(str::to_owned).collect()
    }
}
