//! Qwen3 text encoder.
//!
//! FLUX.2-klein conditions on the hidden states of a Qwen3 decoder rather than
//! on its output logits:
//!
//! 1. The prompt is wrapped in the Qwen3 chat template (thinking disabled)
//! 2. Tokens are truncated or right-padded to a fixed length (512)
//! 3. The decoder runs with a causal + key-padding mask
//! 4. Hidden states 9, 18 and 27 (index 0 is the token embeddings) are
//!    concatenated into `[seq, 3 × hidden]` = `[512, 7680]`
//!
//! Layers past the last extracted one never influence the output, so only the
//! first 27 of the 36 checkpoint layers are loaded and run; there is no final
//! norm and no LM head.

use std::path::Path;

use candle::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{Embedding, Linear, RmsNorm, VarBuilder};
use tokenizers::Tokenizer;

use crate::config::TextEncoderConfig;
use crate::error::{FluxError, LoadError, Stage, StageContext};
use crate::rope::rope_1d;
use crate::tensor::EmbeddingSequence;
use crate::weights::{WeightManifest, WeightTable};

/// Wrap a user prompt in the Qwen3 chat template with an empty thinking block.
pub fn apply_chat_template(prompt: &str) -> String {
    format!("<|im_start|>user\n{prompt}<|im_end|>\n<|im_start|>assistant\n<think>\n\n</think>\n\n")
}

/// Fixed-length token ids and their attention mask (1 = real token).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTokens {
    pub ids: Vec<u32>,
    pub mask: Vec<u32>,
}

impl PromptTokens {
    /// Number of real (non-padding) tokens.
    pub fn real_len(&self) -> usize {
        self.mask.iter().filter(|&&m| m != 0).count()
    }
}

/// Tokenizer plus the fixed-length padding policy of the encoder.
#[derive(Clone)]
pub struct PromptTokenizer {
    tokenizer: Tokenizer,
    max_length: usize,
    pad_token_id: u32,
}

impl std::fmt::Debug for PromptTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptTokenizer")
            .field("max_length", &self.max_length)
            .field("pad_token_id", &self.pad_token_id)
            .finish()
    }
}

impl PromptTokenizer {
    pub fn new(tokenizer: Tokenizer, config: &TextEncoderConfig) -> Self {
        Self {
            tokenizer,
            max_length: config.max_length,
            pad_token_id: config.pad_token_id,
        }
    }

    /// Load `tokenizer.json`.
    pub fn from_file(path: &Path, config: &TextEncoderConfig) -> crate::Result<Self> {
        if !path.is_file() {
            return Err(LoadError::MissingFile(path.to_path_buf()).into());
        }
        let tokenizer = Tokenizer::from_file(path).map_err(|e| LoadError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self::new(tokenizer, config))
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Template, tokenize, then truncate or right-pad to `max_length`.
    pub fn encode(&self, prompt: &str) -> crate::Result<PromptTokens> {
        let encoding = self
            .tokenizer
            .encode(apply_chat_template(prompt), false)
            .map_err(|e| FluxError::encoding(format!("tokenizer error: {e}")))?;
        let mut ids = encoding.get_ids().to_vec();
        if ids.is_empty() {
            return Err(FluxError::encoding("prompt produced no tokens"));
        }
        if ids.len() > self.max_length {
            tracing::warn!(
                "prompt is {} tokens, truncating to {}",
                ids.len(),
                self.max_length
            );
            ids.truncate(self.max_length);
        }
        let real = ids.len();
        let mut mask = vec![1u32; real];
        ids.resize(self.max_length, self.pad_token_id);
        mask.resize(self.max_length, 0);
        tracing::debug!("tokenized prompt: {real} real tokens of {}", self.max_length);
        Ok(PromptTokens { ids, mask })
    }
}

/// Repeat KV heads for grouped-query attention: `[b, kv, s, d]` -> `[b, kv·n_rep, s, d]`.
fn repeat_kv(xs: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(xs);
    }
    let (b, n_kv, seq, head_dim) = xs.dims4()?;
    Tensor::cat(&vec![&xs; n_rep], 2)?.reshape((b, n_kv * n_rep, seq, head_dim))
}

/// SwiGLU MLP.
#[derive(Debug, Clone)]
struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    fn new(cfg: &TextEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let (hidden, inter) = (cfg.hidden_size, cfg.intermediate_size);
        Ok(Self {
            gate_proj: candle_nn::linear_no_bias(hidden, inter, vb.pp("gate_proj"))?,
            up_proj: candle_nn::linear_no_bias(hidden, inter, vb.pp("up_proj"))?,
            down_proj: candle_nn::linear_no_bias(inter, hidden, vb.pp("down_proj"))?,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let lhs = xs.apply(&self.gate_proj)?.silu()?;
        let rhs = xs.apply(&self.up_proj)?;
        (lhs * rhs)?.apply(&self.down_proj)
    }
}

/// GQA attention with per-head q/k RMSNorm.
#[derive(Debug, Clone)]
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    q_norm: RmsNorm,
    k_norm: RmsNorm,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn new(cfg: &TextEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        let (heads, kv_heads, head_dim) = (cfg.num_attention_heads, cfg.num_key_value_heads, cfg.head_dim);
        Ok(Self {
            q_proj: candle_nn::linear_no_bias(hidden, heads * head_dim, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear_no_bias(hidden, kv_heads * head_dim, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear_no_bias(hidden, kv_heads * head_dim, vb.pp("v_proj"))?,
            o_proj: candle_nn::linear_no_bias(heads * head_dim, hidden, vb.pp("o_proj"))?,
            q_norm: candle_nn::rms_norm(head_dim, cfg.rms_norm_eps, vb.pp("q_norm"))?,
            k_norm: candle_nn::rms_norm(head_dim, cfg.rms_norm_eps, vb.pp("k_norm"))?,
            num_heads: heads,
            num_kv_heads: kv_heads,
            head_dim,
        })
    }

    fn forward(&self, xs: &Tensor, mask: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let (b, seq, _) = xs.dims3()?;

        let q = xs
            .apply(&self.q_proj)?
            .reshape((b, seq, self.num_heads, self.head_dim))?
            .apply(&self.q_norm)?
            .transpose(1, 2)?
            .contiguous()?;
        let k = xs
            .apply(&self.k_proj)?
            .reshape((b, seq, self.num_kv_heads, self.head_dim))?
            .apply(&self.k_norm)?
            .transpose(1, 2)?
            .contiguous()?;
        let v = xs
            .apply(&self.v_proj)?
            .reshape((b, seq, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let q = candle_nn::rotary_emb::rope(&q, cos, sin)?;
        let k = candle_nn::rotary_emb::rope(&k, cos, sin)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let weights = (q.matmul(&k.transpose(2, 3)?)? * scale)?;
        // Softmax in F32 for stability
        let dtype = weights.dtype();
        let weights = weights.to_dtype(DType::F32)?.broadcast_add(mask)?;
        let weights = candle_nn::ops::softmax_last_dim(&weights)?.to_dtype(dtype)?;

        weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, seq, self.num_heads * self.head_dim))?
            .apply(&self.o_proj)
    }
}

#[derive(Debug, Clone)]
struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn new(cfg: &TextEncoderConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::new(cfg, vb.pp("self_attn"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
            input_layernorm: candle_nn::rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: candle_nn::rms_norm(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(&self, xs: &Tensor, mask: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let residual = xs;
        let xs = self
            .self_attn
            .forward(&xs.apply(&self.input_layernorm)?, mask, cos, sin)?;
        let xs = (xs + residual)?;
        let residual = &xs;
        let xs = xs.apply(&self.post_attention_layernorm)?.apply(&self.mlp)?;
        residual + xs
    }
}

/// Causal + key-padding additive mask `[b, 1, seq, seq]` in F32.
fn attention_mask(mask: &[u32], device: &Device) -> Result<Tensor> {
    let seq = mask.len();
    let values: Vec<f32> = (0..seq)
        .flat_map(|i| {
            (0..seq).map(move |j| {
                if j > i || mask[j] == 0 {
                    f32::NEG_INFINITY
                } else {
                    0f32
                }
            })
        })
        .collect();
    Tensor::from_vec(values, (1, 1, seq, seq), device)
}

/// The Qwen3 decoder truncated after the deepest extracted layer.
#[derive(Debug, Clone)]
pub struct Qwen3Encoder {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    config: TextEncoderConfig,
    dtype: DType,
    device: Device,
}

impl Qwen3Encoder {
    pub fn new(config: &TextEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let vb_m = vb.pp("model");
        let embed_tokens = candle_nn::embedding(config.vocab_size, config.hidden_size, vb_m.pp("embed_tokens"))?;
        let vb_l = vb_m.pp("layers");
        let layers = (0..config.layers_to_run())
            .map(|i| DecoderLayer::new(config, vb_l.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embed_tokens,
            layers,
            config: config.clone(),
            dtype: vb.dtype(),
            device: vb.device().clone(),
        })
    }

    /// The tensors [`Qwen3Encoder::new`] reads; later layers are not listed.
    pub fn manifest(config: &TextEncoderConfig) -> WeightManifest {
        let hidden = config.hidden_size;
        let inter = config.intermediate_size;
        let q_dim = config.num_attention_heads * config.head_dim;
        let kv_dim = config.num_key_value_heads * config.head_dim;

        let mut m = WeightManifest::new("text_encoder");
        m.push("model.embed_tokens.weight", &[config.vocab_size, hidden]);
        for i in 0..config.layers_to_run() {
            let p = format!("model.layers.{i}");
            m.linear(&format!("{p}.self_attn.q_proj"), hidden, q_dim);
            m.linear(&format!("{p}.self_attn.k_proj"), hidden, kv_dim);
            m.linear(&format!("{p}.self_attn.v_proj"), hidden, kv_dim);
            m.linear(&format!("{p}.self_attn.o_proj"), q_dim, hidden);
            m.norm(&format!("{p}.self_attn.q_norm"), config.head_dim);
            m.norm(&format!("{p}.self_attn.k_norm"), config.head_dim);
            m.linear(&format!("{p}.mlp.gate_proj"), hidden, inter);
            m.linear(&format!("{p}.mlp.up_proj"), hidden, inter);
            m.linear(&format!("{p}.mlp.down_proj"), inter, hidden);
            m.norm(&format!("{p}.input_layernorm"), hidden);
            m.norm(&format!("{p}.post_attention_layernorm"), hidden);
        }
        m
    }

    /// Concatenated hidden states `[1, seq, embedding_dim]` for one prompt.
    pub fn forward(&self, tokens: &PromptTokens) -> Result<Tensor> {
        let seq = tokens.ids.len();
        if tokens.mask.len() != seq {
            candle::bail!("mask length {} does not match {seq} tokens", tokens.mask.len());
        }
        if tokens.mask.first() != Some(&1) {
            candle::bail!("the first token must not be padding");
        }
        let input_ids = Tensor::new(tokens.ids.as_slice(), &self.device)?.unsqueeze(0)?;
        let mask = attention_mask(&tokens.mask, &self.device)?;
        let (cos, sin) = rope_1d(seq, self.config.head_dim, self.config.rope_theta, &self.device, self.dtype)?;

        let outputs = &self.config.output_layers;
        let mut captured: Vec<Option<Tensor>> = vec![None; outputs.len()];
        let mut capture = |index: usize, xs: &Tensor| {
            for (slot, &layer) in captured.iter_mut().zip(outputs.iter()) {
                if layer == index {
                    *slot = Some(xs.clone());
                }
            }
        };

        let mut xs = self.embed_tokens.forward(&input_ids)?;
        capture(0, &xs);
        for (i, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs, &mask, &cos, &sin)?;
            capture(i + 1, &xs);
        }

        let captured = captured
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| candle::Error::Msg("an output layer was not reached".to_string()))?;
        Tensor::cat(&captured, D::Minus1)
    }
}

/// A loaded text encoder.
#[derive(Debug, Clone)]
pub struct TextEncoder {
    model: Qwen3Encoder,
}

impl TextEncoder {
    /// Build from an already validated weight table.
    pub fn load(table: &WeightTable, config: &TextEncoderConfig, dtype: DType, device: &Device) -> crate::Result<Self> {
        let vb = table.var_builder(dtype, device, Stage::TextEncoder)?;
        let model = Qwen3Encoder::new(config, vb).stage(Stage::TextEncoder)?;
        Ok(Self { model })
    }

    pub fn from_model(model: Qwen3Encoder) -> Self {
        Self { model }
    }

    pub fn embedding_dim(&self) -> usize {
        self.model.config.embedding_dim()
    }

    /// Encode tokenized input to a `[seq, embedding_dim]` F32 sequence.
    pub fn encode_tokens(&self, tokens: &PromptTokens) -> crate::Result<EmbeddingSequence> {
        let hidden = self
            .model
            .forward(tokens)
            .and_then(|t| t.squeeze(0))
            .and_then(|t| t.to_dtype(DType::F32))
            .stage(Stage::TextEncoder)?;
        EmbeddingSequence::new(hidden)
    }

    pub fn encode(&self, tokenizer: &PromptTokenizer, prompt: &str) -> crate::Result<EmbeddingSequence> {
        self.encode_tokens(&tokenizer.encode(prompt)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn tiny_model(device: &Device) -> Result<(Qwen3Encoder, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Qwen3Encoder::new(&TextEncoderConfig::tiny(), vb)?;
        Ok((model, varmap))
    }

    fn tokens(real: &[u32], total: usize) -> PromptTokens {
        let mut ids = real.to_vec();
        let mut mask = vec![1; real.len()];
        ids.resize(total, 0);
        mask.resize(total, 0);
        PromptTokens { ids, mask }
    }

    #[test]
    fn test_chat_template() {
        assert_eq!(
            apply_chat_template("a cat"),
            "<|im_start|>user\na cat<|im_end|>\n<|im_start|>assistant\n<think>\n\n</think>\n\n"
        );
    }

    #[test]
    fn test_attention_mask() -> Result<()> {
        let mask = attention_mask(&[1, 1, 0], &Device::Cpu)?;
        let rows = mask.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?;
        assert_eq!(rows[0][0], 0.0);
        assert_eq!(rows[0][1], f32::NEG_INFINITY); // causal
        assert_eq!(rows[2][1], 0.0);
        assert_eq!(rows[2][2], f32::NEG_INFINITY); // padding key
        Ok(())
    }

    #[test]
    fn test_repeat_kv() -> Result<()> {
        let xs = Tensor::arange(0f32, 4f32, &Device::Cpu)?.reshape((1, 2, 1, 2))?;
        let ys = repeat_kv(xs, 2)?;
        assert_eq!(ys.dims(), &[1, 4, 1, 2]);
        let v = ys.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(v, vec![0., 1., 0., 1., 2., 3., 2., 3.]);
        Ok(())
    }

    #[test]
    fn test_manifest_matches_constructor() -> Result<()> {
        let (_, varmap) = tiny_model(&Device::Cpu)?;
        let manifest = Qwen3Encoder::manifest(&TextEncoderConfig::tiny());
        let data = varmap.data().lock().unwrap();
        assert_eq!(data.len(), manifest.len());
        for (name, shape) in manifest.entries() {
            let var = data.get(name).unwrap_or_else(|| panic!("{name} not created"));
            assert_eq!(var.dims(), shape.as_slice(), "{name}");
        }
        // Only layers up to the deepest output layer are read.
        assert!(!data.contains_key("model.layers.3.mlp.up_proj.weight"));
        Ok(())
    }

    #[test]
    fn test_klein_encoder_manifest() {
        let manifest = Qwen3Encoder::manifest(&TextEncoderConfig::qwen3_4b());
        assert!(manifest
            .entries()
            .iter()
            .any(|(n, s)| n == "model.layers.26.self_attn.k_proj.weight" && s == &[1024, 2560]));
        assert!(!manifest.entries().iter().any(|(n, _)| n.starts_with("model.layers.27.")));
    }

    #[test]
    fn test_encode_shapes_and_padding_independence() -> Result<()> {
        let device = Device::Cpu;
        let (model, _varmap) = tiny_model(&device)?;
        let encoder = TextEncoder::from_model(model);
        let a = encoder.encode_tokens(&tokens(&[5, 9, 3], 8)).unwrap();
        assert_eq!((a.seq_len(), a.dim()), (8, 48));

        // Padding ids never leak into real positions.
        let mut b_tokens = tokens(&[5, 9, 3], 8);
        b_tokens.ids[6] = 42;
        let b = encoder.encode_tokens(&b_tokens).unwrap();
        let real_a = a.tensor().narrow(0, 0, 3)?;
        let real_b = b.tensor().narrow(0, 0, 3)?;
        let diff = (real_a - real_b)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        assert!(a.to_vec().unwrap().iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn test_rejects_leading_padding() -> Result<()> {
        let (model, _varmap) = tiny_model(&Device::Cpu)?;
        let bad = PromptTokens {
            ids: vec![0, 1],
            mask: vec![0, 1],
        };
        assert!(model.forward(&bad).is_err());
        Ok(())
    }
}
