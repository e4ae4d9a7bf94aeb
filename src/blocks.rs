//! Transformer blocks for the FLUX.2 diffusion transformer.
//!
//! - **Double-stream blocks**: image and text keep separate weights but attend
//!   jointly over the concatenated `[txt, img]` sequence.
//! - **Single-stream blocks**: one fused projection produces QKV and the MLP
//!   input for the merged stream; attention and MLP run in parallel.
//!
//! Unlike FLUX.1, modulation parameters are not computed per block: the model
//! computes three shared modulations from the timestep embedding (image
//! double-stream, text double-stream, single-stream) and hands the resulting
//! [`ModulationOut`]s to every block. All linear layers are bias-free.

use candle::{DType, Device, Result, Tensor, D};
use candle_nn::{LayerNorm, Linear, Module, RmsNorm, VarBuilder};

use crate::rope::apply_rope_interleaved;
use crate::weights::WeightManifest;

/// Parameter-free LayerNorm (PyTorch `elementwise_affine=False`).
pub(crate) fn layer_norm_no_affine(size: usize, eps: f64, device: &Device, dtype: DType) -> Result<LayerNorm> {
    let weight = Tensor::ones(size, dtype, device)?;
    Ok(LayerNorm::new_no_bias(weight, eps))
}

/// Clip F16 activations to the finite F16 range; other dtypes pass through.
pub(crate) fn clamp_f16(xs: Tensor) -> Result<Tensor> {
    if xs.dtype() == DType::F16 {
        xs.clamp(-65504f32, 65504f32)
    } else {
        Ok(xs)
    }
}

/// Shift, scale and gate for one norm site, each `[batch, 1, dim]`.
#[derive(Debug, Clone)]
pub struct ModulationOut {
    pub shift: Tensor,
    pub scale: Tensor,
    pub gate: Tensor,
}

impl ModulationOut {
    /// x * (1 + scale) + shift
    pub fn scale_shift(&self, xs: &Tensor) -> Result<Tensor> {
        xs.broadcast_mul(&(&self.scale + 1.0)?)?
            .broadcast_add(&self.shift)
    }

    /// x + gate * y
    pub fn gated_residual(&self, xs: &Tensor, ys: &Tensor) -> Result<Tensor> {
        xs + self.gate.broadcast_mul(ys)?
    }
}

/// Projects `silu(temb)` to `sets` groups of (shift, scale, gate).
#[derive(Debug, Clone)]
pub struct Modulation {
    lin: Linear,
    sets: usize,
}

impl Modulation {
    pub fn new(dim: usize, sets: usize, vb: VarBuilder) -> Result<Self> {
        let lin = candle_nn::linear_no_bias(dim, 3 * sets * dim, vb.pp("linear"))?;
        Ok(Self { lin, sets })
    }

    pub fn declare(manifest: &mut WeightManifest, prefix: &str, dim: usize, sets: usize) {
        manifest.linear(&format!("{prefix}.linear"), dim, 3 * sets * dim);
    }

    pub fn forward(&self, temb: &Tensor) -> Result<Vec<ModulationOut>> {
        let ys = temb.silu()?.apply(&self.lin)?.unsqueeze(1)?;
        let chunks = ys.chunk(3 * self.sets, D::Minus1)?;
        if chunks.len() != 3 * self.sets {
            candle::bail!(
                "expected {} chunks from modulation, got {}",
                3 * self.sets,
                chunks.len()
            );
        }
        Ok(chunks
            .chunks_exact(3)
            .map(|c| ModulationOut {
                shift: c[0].clone(),
                scale: c[1].clone(),
                gate: c[2].clone(),
            })
            .collect())
    }
}

/// silu(a) * b where `xs = [a | b]` along the last dimension.
fn swiglu(xs: &Tensor) -> Result<Tensor> {
    let chunks = xs.chunk(2, D::Minus1)?;
    chunks[0].silu()? * &chunks[1]
}

/// SwiGLU feed-forward: dim -> 2·hidden -> dim.
#[derive(Debug, Clone)]
pub struct FeedForward {
    linear_in: Linear,
    linear_out: Linear,
}

impl FeedForward {
    pub fn new(dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        let linear_in = candle_nn::linear_no_bias(dim, 2 * hidden_dim, vb.pp("linear_in"))?;
        let linear_out = candle_nn::linear_no_bias(hidden_dim, dim, vb.pp("linear_out"))?;
        Ok(Self { linear_in, linear_out })
    }

    pub fn declare(manifest: &mut WeightManifest, prefix: &str, dim: usize, hidden_dim: usize) {
        manifest.linear(&format!("{prefix}.linear_in"), dim, 2 * hidden_dim);
        manifest.linear(&format!("{prefix}.linear_out"), hidden_dim, dim);
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        swiglu(&xs.apply(&self.linear_in)?)?.apply(&self.linear_out)
    }
}

/// Per-head RMSNorm on queries and keys.
#[derive(Debug, Clone)]
pub struct QkNorm {
    query_norm: RmsNorm,
    key_norm: RmsNorm,
}

impl QkNorm {
    /// `q_name`/`k_name` select the stream: `norm_q`/`norm_k` for the image
    /// stream, `norm_added_q`/`norm_added_k` for text.
    pub fn new(head_dim: usize, eps: f64, vb: &VarBuilder, q_name: &str, k_name: &str) -> Result<Self> {
        let query_norm = RmsNorm::new(vb.get(head_dim, &format!("{q_name}.weight"))?, eps);
        let key_norm = RmsNorm::new(vb.get(head_dim, &format!("{k_name}.weight"))?, eps);
        Ok(Self {
            query_norm,
            key_norm,
        })
    }

    pub fn forward_q(&self, q: &Tensor) -> Result<Tensor> {
        q.apply(&self.query_norm)
    }

    pub fn forward_k(&self, k: &Tensor) -> Result<Tensor> {
        k.apply(&self.key_norm)
    }
}

/// softmax(Q Kᵀ / sqrt(d)) V over `[batch, heads, seq, head_dim]`, with the
/// softmax in F32.
pub(crate) fn scaled_dot_product_attention(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
    let dtype = q.dtype();
    let head_dim = q.dim(D::Minus1)?;
    let scale = 1.0 / (head_dim as f64).sqrt();
    let scores = (q.contiguous()?.matmul(&k.t()?.contiguous()?)? * scale)?;
    let probs = candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?.to_dtype(dtype)?;
    probs.matmul(&v.contiguous()?)
}

/// `[b, seq, heads·head_dim]` -> `[b, heads, seq, head_dim]`
fn split_heads(xs: &Tensor, num_heads: usize, head_dim: usize) -> Result<Tensor> {
    let (b, seq, _) = xs.dims3()?;
    xs.reshape((b, seq, num_heads, head_dim))?.transpose(1, 2)
}

/// `[b, heads, seq, head_dim]` -> `[b, seq, heads·head_dim]`
fn merge_heads(xs: &Tensor) -> Result<Tensor> {
    xs.transpose(1, 2)?.flatten_from(2)
}

/// Joint attention of the double-stream blocks.
#[derive(Debug, Clone)]
pub struct DoubleStreamAttention {
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Linear,
    add_q_proj: Linear,
    add_k_proj: Linear,
    add_v_proj: Linear,
    to_add_out: Linear,
    img_norm: QkNorm,
    txt_norm: QkNorm,
    num_heads: usize,
    head_dim: usize,
}

impl DoubleStreamAttention {
    pub fn new(dim: usize, num_heads: usize, head_dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let inner = num_heads * head_dim;
        Ok(Self {
            to_q: candle_nn::linear_no_bias(dim, inner, vb.pp("to_q"))?,
            to_k: candle_nn::linear_no_bias(dim, inner, vb.pp("to_k"))?,
            to_v: candle_nn::linear_no_bias(dim, inner, vb.pp("to_v"))?,
            to_out: candle_nn::linear_no_bias(inner, dim, vb.pp("to_out.0"))?,
            add_q_proj: candle_nn::linear_no_bias(dim, inner, vb.pp("add_q_proj"))?,
            add_k_proj: candle_nn::linear_no_bias(dim, inner, vb.pp("add_k_proj"))?,
            add_v_proj: candle_nn::linear_no_bias(dim, inner, vb.pp("add_v_proj"))?,
            to_add_out: candle_nn::linear_no_bias(inner, dim, vb.pp("to_add_out"))?,
            img_norm: QkNorm::new(head_dim, eps, &vb, "norm_q", "norm_k")?,
            txt_norm: QkNorm::new(head_dim, eps, &vb, "norm_added_q", "norm_added_k")?,
            num_heads,
            head_dim,
        })
    }

    pub fn declare(manifest: &mut WeightManifest, prefix: &str, dim: usize, head_dim: usize) {
        for name in ["to_q", "to_k", "to_v", "add_q_proj", "add_k_proj", "add_v_proj"] {
            manifest.linear(&format!("{prefix}.{name}"), dim, dim);
        }
        manifest.linear(&format!("{prefix}.to_out.0"), dim, dim);
        manifest.linear(&format!("{prefix}.to_add_out"), dim, dim);
        for name in ["norm_q", "norm_k", "norm_added_q", "norm_added_k"] {
            manifest.norm(&format!("{prefix}.{name}"), head_dim);
        }
    }

    /// Returns `(img_out, txt_out)`. `pe` holds cos/sin for `[txt, img]`.
    pub fn forward(&self, img: &Tensor, txt: &Tensor, pe: &(Tensor, Tensor)) -> Result<(Tensor, Tensor)> {
        let txt_seq = txt.dim(1)?;
        let img_seq = img.dim(1)?;
        let (h, d) = (self.num_heads, self.head_dim);

        let img_q = self.img_norm.forward_q(&split_heads(&img.apply(&self.to_q)?, h, d)?)?;
        let img_k = self.img_norm.forward_k(&split_heads(&img.apply(&self.to_k)?, h, d)?)?;
        let img_v = split_heads(&img.apply(&self.to_v)?, h, d)?;

        let txt_q = self.txt_norm.forward_q(&split_heads(&txt.apply(&self.add_q_proj)?, h, d)?)?;
        let txt_k = self.txt_norm.forward_k(&split_heads(&txt.apply(&self.add_k_proj)?, h, d)?)?;
        let txt_v = split_heads(&txt.apply(&self.add_v_proj)?, h, d)?;

        // Joint sequence order is [text, image].
        let q = Tensor::cat(&[&txt_q, &img_q], 2)?;
        let k = Tensor::cat(&[&txt_k, &img_k], 2)?;
        let v = Tensor::cat(&[&txt_v, &img_v], 2)?;
        let q = apply_rope_interleaved(&q, &pe.0, &pe.1)?;
        let k = apply_rope_interleaved(&k, &pe.0, &pe.1)?;

        let attn = merge_heads(&scaled_dot_product_attention(&q, &k, &v)?)?;
        let txt_attn = attn.narrow(1, 0, txt_seq)?;
        let img_attn = attn.narrow(1, txt_seq, img_seq)?;
        Ok((img_attn.apply(&self.to_out)?, txt_attn.apply(&self.to_add_out)?))
    }
}

/// Double-stream block: modulated norm, joint attention, per-stream SwiGLU.
#[derive(Debug, Clone)]
pub struct DoubleStreamBlock {
    norm: LayerNorm,
    attn: DoubleStreamAttention,
    ff: FeedForward,
    ff_context: FeedForward,
}

impl DoubleStreamBlock {
    pub fn new(
        dim: usize,
        num_heads: usize,
        head_dim: usize,
        mlp_hidden: usize,
        eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            norm: layer_norm_no_affine(dim, eps, vb.device(), vb.dtype())?,
            attn: DoubleStreamAttention::new(dim, num_heads, head_dim, eps, vb.pp("attn"))?,
            ff: FeedForward::new(dim, mlp_hidden, vb.pp("ff"))?,
            ff_context: FeedForward::new(dim, mlp_hidden, vb.pp("ff_context"))?,
        })
    }

    pub fn declare(manifest: &mut WeightManifest, prefix: &str, dim: usize, head_dim: usize, mlp_hidden: usize) {
        DoubleStreamAttention::declare(manifest, &format!("{prefix}.attn"), dim, head_dim);
        FeedForward::declare(manifest, &format!("{prefix}.ff"), dim, mlp_hidden);
        FeedForward::declare(manifest, &format!("{prefix}.ff_context"), dim, mlp_hidden);
    }

    /// `img_mod` and `txt_mod` each hold the (attention, MLP) modulations.
    /// Returns `(txt, img)`.
    pub fn forward(
        &self,
        img: &Tensor,
        txt: &Tensor,
        img_mod: &[ModulationOut],
        txt_mod: &[ModulationOut],
        pe: &(Tensor, Tensor),
    ) -> Result<(Tensor, Tensor)> {
        let (img_mod1, img_mod2) = (&img_mod[0], &img_mod[1]);
        let (txt_mod1, txt_mod2) = (&txt_mod[0], &txt_mod[1]);

        // === Attention ===
        let img_modulated = img_mod1.scale_shift(&img.apply(&self.norm)?)?;
        let txt_modulated = txt_mod1.scale_shift(&txt.apply(&self.norm)?)?;
        let (img_attn, txt_attn) = self.attn.forward(&img_modulated, &txt_modulated, pe)?;
        let img = img_mod1.gated_residual(img, &img_attn)?;
        let txt = txt_mod1.gated_residual(txt, &txt_attn)?;

        // === MLP ===
        let img_mlp = img_mod2.scale_shift(&img.apply(&self.norm)?)?.apply(&self.ff)?;
        let img = img_mod2.gated_residual(&img, &img_mlp)?;
        let txt_mlp = txt_mod2.scale_shift(&txt.apply(&self.norm)?)?.apply(&self.ff_context)?;
        let txt = txt_mod2.gated_residual(&txt, &txt_mlp)?;

        Ok((clamp_f16(txt)?, clamp_f16(img)?))
    }
}

/// Single-stream block over the merged `[txt, img]` sequence.
#[derive(Debug, Clone)]
pub struct SingleStreamBlock {
    norm: LayerNorm,
    to_qkv_mlp_proj: Linear,
    to_out: Linear,
    qk_norm: QkNorm,
    num_heads: usize,
    head_dim: usize,
    mlp_hidden: usize,
}

impl SingleStreamBlock {
    pub fn new(
        dim: usize,
        num_heads: usize,
        head_dim: usize,
        mlp_hidden: usize,
        eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let vb = vb.pp("attn");
        Ok(Self {
            norm: layer_norm_no_affine(dim, eps, vb.device(), vb.dtype())?,
            to_qkv_mlp_proj: candle_nn::linear_no_bias(
                dim,
                3 * dim + 2 * mlp_hidden,
                vb.pp("to_qkv_mlp_proj"),
            )?,
            to_out: candle_nn::linear_no_bias(dim + mlp_hidden, dim, vb.pp("to_out"))?,
            qk_norm: QkNorm::new(head_dim, eps, &vb, "norm_q", "norm_k")?,
            num_heads,
            head_dim,
            mlp_hidden,
        })
    }

    pub fn declare(manifest: &mut WeightManifest, prefix: &str, dim: usize, head_dim: usize, mlp_hidden: usize) {
        manifest.linear(
            &format!("{prefix}.attn.to_qkv_mlp_proj"),
            dim,
            3 * dim + 2 * mlp_hidden,
        );
        manifest.linear(&format!("{prefix}.attn.to_out"), dim + mlp_hidden, dim);
        manifest.norm(&format!("{prefix}.attn.norm_q"), head_dim);
        manifest.norm(&format!("{prefix}.attn.norm_k"), head_dim);
    }

    pub fn forward(&self, xs: &Tensor, modulation: &ModulationOut, pe: &(Tensor, Tensor)) -> Result<Tensor> {
        let dim = self.num_heads * self.head_dim;
        let modulated = modulation.scale_shift(&xs.apply(&self.norm)?)?;
        let proj = modulated.apply(&self.to_qkv_mlp_proj)?;

        let q = proj.narrow(D::Minus1, 0, dim)?;
        let k = proj.narrow(D::Minus1, dim, dim)?;
        let v = proj.narrow(D::Minus1, 2 * dim, dim)?;
        let mlp = proj.narrow(D::Minus1, 3 * dim, 2 * self.mlp_hidden)?;

        let q = self.qk_norm.forward_q(&split_heads(&q, self.num_heads, self.head_dim)?)?;
        let k = self.qk_norm.forward_k(&split_heads(&k, self.num_heads, self.head_dim)?)?;
        let v = split_heads(&v, self.num_heads, self.head_dim)?;
        let q = apply_rope_interleaved(&q, &pe.0, &pe.1)?;
        let k = apply_rope_interleaved(&k, &pe.0, &pe.1)?;
        let attn = merge_heads(&scaled_dot_product_attention(&q, &k, &v)?)?;

        let mlp = swiglu(&mlp)?;
        let out = Tensor::cat(&[&attn, &mlp], D::Minus1)?.apply(&self.to_out)?;
        modulation.gated_residual(xs, &out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rope::{image_ids, text_ids, EmbedNd};
    use candle_nn::VarMap;

    #[test]
    fn test_clamp_only_f16() -> Result<()> {
        let device = Device::Cpu;
        let big = Tensor::new(&[1.0e6f32, -1.0e6, 3.0], &device)?;

        let bf16 = clamp_f16(big.to_dtype(DType::BF16)?)?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        assert!(bf16[0] > 9.0e5 && bf16[1] < -9.0e5);

        let full = clamp_f16(big.clone())?.to_vec1::<f32>()?;
        assert_eq!(full, vec![1.0e6, -1.0e6, 3.0]);

        // 1e6 overflows to infinity in F16 and comes back at the largest finite value.
        let f16 = clamp_f16(big.to_dtype(DType::F16)?)?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        assert_eq!(f16, vec![65504.0, -65504.0, 3.0]);
        Ok(())
    }

    fn pe(txt: usize, h: usize, w: usize, device: &Device) -> Result<(Tensor, Tensor)> {
        let ids = Tensor::cat(&[text_ids(txt, device)?, image_ids(h, w, device)?], 0)?;
        EmbedNd::new(2000.0, vec![2, 2, 2, 2]).forward(&ids, DType::F32)
    }

    #[test]
    fn test_modulation_chunks() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let modulation = Modulation::new(8, 2, vb)?;
        let temb = Tensor::randn(0f32, 1f32, (1, 8), &device)?;
        let mods = modulation.forward(&temb)?;
        assert_eq!(mods.len(), 2);
        assert_eq!(mods[1].gate.dims(), &[1, 1, 8]);
        Ok(())
    }

    #[test]
    fn test_zero_gate_is_identity() -> Result<()> {
        let device = Device::Cpu;
        let xs = Tensor::randn(0f32, 1f32, (1, 3, 4), &device)?;
        let zeros = Tensor::zeros((1, 1, 4), DType::F32, &device)?;
        let m = ModulationOut {
            shift: zeros.clone(),
            scale: zeros.clone(),
            gate: zeros,
        };
        let ys = Tensor::randn(0f32, 1f32, (1, 3, 4), &device)?;
        let out = m.gated_residual(&xs, &ys)?;
        let diff = (out - &xs)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        assert_eq!(m.scale_shift(&xs)?.to_vec3::<f32>()?, xs.to_vec3::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_blocks_shapes_and_manifest() -> Result<()> {
        let device = Device::Cpu;
        let (dim, heads, head_dim, mlp) = (16, 2, 8, 24);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let double = DoubleStreamBlock::new(dim, heads, head_dim, mlp, 1e-6, vb.pp("transformer_blocks.0"))?;
        let single = SingleStreamBlock::new(dim, heads, head_dim, mlp, 1e-6, vb.pp("single_transformer_blocks.0"))?;

        let mut manifest = WeightManifest::new("transformer");
        DoubleStreamBlock::declare(&mut manifest, "transformer_blocks.0", dim, head_dim, mlp);
        SingleStreamBlock::declare(&mut manifest, "single_transformer_blocks.0", dim, head_dim, mlp);
        let data = varmap.data().lock().unwrap();
        assert_eq!(data.len(), manifest.len());
        for (name, shape) in manifest.entries() {
            let var = data.get(name).unwrap_or_else(|| panic!("{name} not created"));
            assert_eq!(var.dims(), shape.as_slice(), "{name}");
        }
        drop(data);

        let img = Tensor::randn(0f32, 1f32, (1, 4, dim), &device)?;
        let txt = Tensor::randn(0f32, 1f32, (1, 3, dim), &device)?;
        let temb = Tensor::randn(0f32, 1f32, (1, dim), &device)?;
        let mods = Modulation::new(dim, 2, vb.pp("mod_img"))?.forward(&temb)?;
        let pe = pe(3, 2, 2, &device)?;
        let (txt, img) = double.forward(&img, &txt, &mods, &mods, &pe)?;
        assert_eq!(txt.dims(), &[1, 3, dim]);
        assert_eq!(img.dims(), &[1, 4, dim]);

        let joint = Tensor::cat(&[&txt, &img], 1)?;
        let out = single.forward(&joint, &mods[0], &pe)?;
        assert_eq!(out.dims(), &[1, 7, dim]);
        Ok(())
    }
}
