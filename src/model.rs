use tch::{
    Device,
    Kind::{Bool, Float},
    Tensor,
    nn::{
        Embedding, EmbeddingConfig, Init, LayerNorm, Linear, LinearConfig, ModuleT, Path,
        embedding, layer_norm, linear,
    },
};

/// Longest sequence the positional table covers.
pub const MAX_POSITIONS: i64 = 5000;

const INIT_RANGE: f64 = 0.1;

#[derive(Debug, Clone, Copy)]
pub struct ModelConfig {
    /// Vocabulary size.
    pub ntokens: i64,
    /// Embedding width, shared by every encoder layer.
    pub emsize: i64,
    pub nhead: i64,
    /// Width of the feed-forward block.
    pub nhid: i64,
    pub nlayers: usize,
    pub dropout: f64,
}

/// Fixed sinusoidal position signal, added to the scaled token embeddings.
#[derive(Debug)]
struct PositionalEncoding {
    table: Tensor, // [MAX_POSITIONS, 1, emsize]
    dropout: f64,
}

impl PositionalEncoding {
    fn new(emsize: i64, dropout: f64, device: Device) -> Self {
        let d = emsize as usize;
        let mut values = Vec::with_capacity(MAX_POSITIONS as usize * d);
        for pos in 0..MAX_POSITIONS {
            for i in 0..d {
                let pair = (i - i % 2) as f64;
                let angle = pos as f64 * (-(10000f64.ln()) * pair / emsize as f64).exp();
                let value = if i % 2 == 0 { angle.sin() } else { angle.cos() };
                values.push(value as f32);
            }
        }
        let table = Tensor::from_slice(&values)
            .view([MAX_POSITIONS, 1, emsize])
            .to_device(device);
        PositionalEncoding { table, dropout }
    }

    /// `[seq_len, batch, emsize]` in and out.
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        let seq_len = input.size()[0];
        (input + self.table.narrow(0, 0, seq_len)).dropout(self.dropout, train)
    }
}

/// Single-head attention mechanism.
/// Takes an input of shape [batch_size, seq_len, emsize] and produces
/// [batch_size, seq_len, head_dim], where each position's output is a weighted
/// combination of earlier positions' values.
#[derive(Debug)]
struct SingleHeadAttention {
    query: Linear, // Projects emsize -> head_dim
    key: Linear,   // Projects emsize -> head_dim
    value: Linear, // Projects emsize -> head_dim
    head_dim: i64,
}

impl SingleHeadAttention {
    fn new(vs: &Path, emsize: i64, head_dim: i64) -> Self {
        let query = linear(vs / "query", emsize, head_dim, Default::default());
        let key = linear(vs / "key", emsize, head_dim, Default::default());
        let value = linear(vs / "value", emsize, head_dim, Default::default());
        SingleHeadAttention {
            query,
            key,
            value,
            head_dim,
        }
    }

    fn forward_t(&self, input: &Tensor, mask: &Tensor, dropout: f64, train: bool) -> Tensor {
        let q = input.apply(&self.query);
        let k = input.apply(&self.key);
        let v = input.apply(&self.value);
        // [batch, seq_len, seq_len]
        let scores = q.matmul(&k.transpose(-2, -1)) / f64::sqrt(self.head_dim as f64);
        scores
            .masked_fill(mask, f64::NEG_INFINITY)
            .softmax(-1, Float)
            .dropout(dropout, train)
            .matmul(&v)
    }
}

#[derive(Debug)]
struct MultiHeadAttention {
    heads: Vec<SingleHeadAttention>,
    output_projection: Linear,
    dropout: f64,
}

impl MultiHeadAttention {
    fn new(vs: &Path, emsize: i64, nhead: i64, dropout: f64) -> Self {
        let head_dim = emsize / nhead;
        let heads = (0..nhead)
            .map(|i| SingleHeadAttention::new(&(vs / i.to_string()), emsize, head_dim))
            .collect();
        let output_projection = linear(vs / "output", emsize, emsize, Default::default());
        MultiHeadAttention {
            heads,
            output_projection,
            dropout,
        }
    }

    fn forward_t(&self, input: &Tensor, mask: &Tensor, train: bool) -> Tensor {
        let outputs: Vec<Tensor> = self
            .heads
            .iter()
            .map(|head| head.forward_t(input, mask, self.dropout, train))
            .collect();
        // [batch, seq_len, head_dim * nhead]
        Tensor::cat(&outputs, -1).apply(&self.output_projection)
    }
}

/// Post-norm encoder block: attention and feed-forward, each wrapped in a
/// residual connection followed by layer norm.
#[derive(Debug)]
struct EncoderLayer {
    attention: MultiHeadAttention,
    norm1: LayerNorm,
    feed_forward_in: Linear,
    feed_forward_out: Linear,
    norm2: LayerNorm,
    dropout: f64,
}

impl EncoderLayer {
    fn new(vs: &Path, config: &ModelConfig) -> Self {
        let ModelConfig {
            emsize,
            nhead,
            nhid,
            dropout,
            ..
        } = *config;
        EncoderLayer {
            attention: MultiHeadAttention::new(&(vs / "attention"), emsize, nhead, dropout),
            norm1: layer_norm(vs / "norm1", vec![emsize], Default::default()),
            feed_forward_in: linear(vs / "ff_in", emsize, nhid, Default::default()),
            feed_forward_out: linear(vs / "ff_out", nhid, emsize, Default::default()),
            norm2: layer_norm(vs / "norm2", vec![emsize], Default::default()),
            dropout,
        }
    }

    /// `[batch, seq_len, emsize]` in and out.
    fn forward_t(&self, input: &Tensor, mask: &Tensor, train: bool) -> Tensor {
        let attended = self.attention.forward_t(input, mask, train);
        let hidden = (input + attended.dropout(self.dropout, train)).apply(&self.norm1);
        let expanded = hidden
            .apply(&self.feed_forward_in)
            .relu()
            .dropout(self.dropout, train)
            .apply(&self.feed_forward_out);
        (&hidden + expanded.dropout(self.dropout, train)).apply(&self.norm2)
    }
}

/// `true` above the diagonal: position `t` may only attend to positions `<= t`.
fn causal_mask(seq_len: i64, device: Device) -> Tensor {
    Tensor::ones([seq_len, seq_len], (Float, device))
        .triu(1)
        .to_kind(Bool)
}

/// Transformer encoder language model.
///
/// Takes token IDs shaped `[seq_len, batch]` and returns next-token logits
/// shaped `[seq_len, batch, ntokens]`.
#[derive(Debug)]
pub struct TransformerModel {
    encoder: Embedding,
    positions: PositionalEncoding,
    layers: Vec<EncoderLayer>,
    decoder: Linear,
    emsize: i64,
}

impl TransformerModel {
    pub fn new(vs: &Path, config: &ModelConfig) -> Self {
        let uniform = Init::Uniform {
            lo: -INIT_RANGE,
            up: INIT_RANGE,
        };
        let encoder = embedding(
            vs / "encoder",
            config.ntokens,
            config.emsize,
            EmbeddingConfig {
                ws_init: uniform,
                ..Default::default()
            },
        );
        let layers_vs = vs / "layers";
        let layers = (0..config.nlayers)
            .map(|i| EncoderLayer::new(&(&layers_vs / i.to_string()), config))
            .collect();
        let decoder = linear(
            vs / "decoder",
            config.emsize,
            config.ntokens,
            LinearConfig {
                ws_init: uniform,
                bs_init: Some(Init::Const(0.)),
                bias: true,
            },
        );
        TransformerModel {
            encoder,
            positions: PositionalEncoding::new(config.emsize, config.dropout, vs.device()),
            layers,
            decoder,
            emsize: config.emsize,
        }
    }
}

impl ModuleT for TransformerModel {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        let seq_len = input.size()[0];
        let mask = causal_mask(seq_len, input.device());
        let embedded = input.apply(&self.encoder) * f64::sqrt(self.emsize as f64);
        // Layers work batch-first.
        let hidden = self.positions.forward_t(&embedded, train).transpose(0, 1);
        let hidden = self
            .layers
            .iter()
            .fold(hidden, |hidden, layer| layer.forward_t(&hidden, &mask, train));
        hidden.transpose(0, 1).apply(&self.decoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind, nn};

    fn small_config() -> ModelConfig {
        ModelConfig {
            ntokens: 50,
            emsize: 16,
            nhead: 2,
            nhid: 32,
            nlayers: 2,
            dropout: 0.2,
        }
    }

    fn token_input(tokens: &[i64], seq_len: i64, batch: i64) -> Tensor {
        Tensor::from_slice(tokens).view([seq_len, batch])
    }

    #[test]
    fn test_forward_output_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = TransformerModel::new(&vs.root(), &small_config());
        let input = token_input(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12], 4, 3);
        let output = model.forward_t(&input, true);
        assert_eq!(output.size(), &[4, 3, 50]);
    }

    #[test]
    fn test_forward_single_token() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = TransformerModel::new(&vs.root(), &small_config());
        let output = model.forward_t(&token_input(&[7], 1, 1), false);
        assert_eq!(output.size(), &[1, 1, 50]);
    }

    #[test]
    fn test_eval_is_deterministic() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = TransformerModel::new(&vs.root(), &small_config());
        let input = token_input(&[4, 8, 15, 16, 23, 42], 3, 2);
        let a = model.forward_t(&input, false);
        let b = model.forward_t(&input, false);
        let diff = (&a - &b).abs().sum(Kind::Float);
        assert!(f64::try_from(&diff).unwrap() < 1e-6);
    }

    #[test]
    fn test_causal_masking() {
        // Changing the last token must not affect earlier positions' logits.
        let vs = nn::VarStore::new(Device::Cpu);
        let model = TransformerModel::new(&vs.root(), &small_config());
        let output_a = model.forward_t(&token_input(&[5, 6, 7, 8], 4, 1), false);
        let output_b = model.forward_t(&token_input(&[5, 6, 7, 30], 4, 1), false);

        for pos in 0..3 {
            let diff = (output_a.get(pos) - output_b.get(pos)).abs().sum(Kind::Float);
            assert!(
                f64::try_from(&diff).unwrap() < 1e-5,
                "Position {} changed when only a future token was modified",
                pos
            );
        }
        let diff3 = (output_a.get(3) - output_b.get(3)).abs().sum(Kind::Float);
        assert!(
            f64::try_from(&diff3).unwrap() > 1e-5,
            "Position 3 should have changed"
        );
    }

    #[test]
    fn test_positional_table() {
        let positions = PositionalEncoding::new(4, 0.0, Device::Cpu);
        assert_eq!(positions.table.size(), &[MAX_POSITIONS, 1, 4]);
        // pos 0: sin(0) = 0, cos(0) = 1
        let first = Vec::<f32>::try_from(&positions.table.get(0).get(0)).unwrap();
        assert_eq!(first, vec![0.0, 1.0, 0.0, 1.0]);
        let second = Vec::<f32>::try_from(&positions.table.get(1).get(0)).unwrap();
        assert!((second[0] - 1f32.sin()).abs() < 1e-6);
        assert!((second[1] - 1f32.cos()).abs() < 1e-6);
    }

    #[test]
    fn test_multi_head_output_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mha = MultiHeadAttention::new(&vs.root(), 16, 4, 0.0);
        let input = Tensor::randn([2, 5, 16], (Float, Device::Cpu));
        let output = mha.forward_t(&input, &causal_mask(5, Device::Cpu), false);
        assert_eq!(output.size(), &[2, 5, 16]);
    }

    #[test]
    fn test_causal_mask_shape() {
        let mask = causal_mask(3, Device::Cpu);
        let above = mask.to_kind(Kind::Int64);
        assert_eq!(i64::try_from(&above.sum(Kind::Int64)).unwrap(), 3);
        assert_eq!(i64::try_from(&above.get(0).get(1)).unwrap(), 1);
        assert_eq!(i64::try_from(&above.get(1).get(0)).unwrap(), 0);
    }
}
