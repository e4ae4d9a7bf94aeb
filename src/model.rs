//! FLUX.2 diffusion transformer.
//!
//! The flow through [`Flux2Transformer::forward`]:
//! 1. Project packed latent tokens (`x_embedder`) and text embeddings
//!    (`context_embedder`) to the inner dimension
//! 2. Embed the timestep (and the guidance scale, for guidance-distilled
//!    checkpoints) and derive the three shared modulations
//! 3. Run the double-stream blocks on separate image/text streams
//! 4. Concatenate `[txt, img]` and run the single-stream blocks
//! 5. Keep the image tokens, apply AdaLN-continuous and `proj_out`
//!
//! Weight names follow diffusers' `Flux2Transformer2DModel`.

use candle::{DType, Device, Result, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};

use crate::blocks::{layer_norm_no_affine, DoubleStreamBlock, Modulation, SingleStreamBlock};
use crate::config::TransformerConfig;
use crate::progress::{Phase, ProgressObserver};
use crate::rope::{image_ids, text_ids, timestep_embedding, EmbedNd};
use crate::sampler::VelocityModel;
use crate::weights::WeightManifest;

/// Two-layer MLP from the sinusoidal embedding to the inner dimension.
#[derive(Debug, Clone)]
struct MlpEmbedder {
    linear_1: Linear,
    linear_2: Linear,
}

impl MlpEmbedder {
    fn new(in_dim: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            linear_1: candle_nn::linear_no_bias(in_dim, dim, vb.pp("linear_1"))?,
            linear_2: candle_nn::linear_no_bias(dim, dim, vb.pp("linear_2"))?,
        })
    }

    fn declare(manifest: &mut WeightManifest, prefix: &str, in_dim: usize, dim: usize) {
        manifest.linear(&format!("{prefix}.linear_1"), in_dim, dim);
        manifest.linear(&format!("{prefix}.linear_2"), dim, dim);
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.linear_1)?.silu()?.apply(&self.linear_2)
    }
}

/// Timestep embedding plus the optional guidance embedding.
#[derive(Debug, Clone)]
pub struct TimestepGuidanceEmbeddings {
    timestep_embedder: MlpEmbedder,
    guidance_embedder: Option<MlpEmbedder>,
    channels: usize,
}

impl TimestepGuidanceEmbeddings {
    pub fn new(channels: usize, dim: usize, guidance_embeds: bool, vb: VarBuilder) -> Result<Self> {
        let timestep_embedder = MlpEmbedder::new(channels, dim, vb.pp("timestep_embedder"))?;
        let guidance_embedder = if guidance_embeds {
            Some(MlpEmbedder::new(channels, dim, vb.pp("guidance_embedder"))?)
        } else {
            None
        };
        Ok(Self {
            timestep_embedder,
            guidance_embedder,
            channels,
        })
    }

    /// `timestep` and `guidance` are `[batch]`; the result is `[batch, dim]`.
    pub fn forward(&self, timestep: &Tensor, guidance: Option<&Tensor>, dtype: DType) -> Result<Tensor> {
        let temb = self
            .timestep_embedder
            .forward(&timestep_embedding(timestep, self.channels, dtype)?)?;
        match (&self.guidance_embedder, guidance) {
            (Some(embedder), Some(guidance)) => {
                let gemb = embedder.forward(&timestep_embedding(guidance, self.channels, dtype)?)?;
                temb + gemb
            }
            _ => Ok(temb),
        }
    }
}

/// Adaptive LayerNorm with continuous conditioning, used before `proj_out`.
#[derive(Debug, Clone)]
pub struct AdaLayerNormContinuous {
    norm: LayerNorm,
    linear: Linear,
}

impl AdaLayerNormContinuous {
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let norm = layer_norm_no_affine(dim, eps, vb.device(), vb.dtype())?;
        let linear = candle_nn::linear_no_bias(dim, 2 * dim, vb.pp("linear"))?;
        Ok(Self { norm, linear })
    }

    pub fn forward(&self, xs: &Tensor, conditioning: &Tensor) -> Result<Tensor> {
        let chunks = conditioning.silu()?.apply(&self.linear)?.chunk(2, 1)?;
        if chunks.len() != 2 {
            candle::bail!("expected 2 chunks for AdaLN, got {}", chunks.len());
        }
        // Order is (scale, shift), the reverse of the block modulations.
        let scale = &chunks[0];
        let shift = &chunks[1];
        xs.apply(&self.norm)?
            .broadcast_mul(&(scale.unsqueeze(1)? + 1.0)?)?
            .broadcast_add(&shift.unsqueeze(1)?)
    }
}

/// FLUX.2 transformer: 5 double-stream and 20 single-stream blocks for klein 4B.
///
/// - **Input**: packed latent tokens `[batch, (H/16)·(W/16), 128]`
/// - **Text**: Qwen3 embeddings `[batch, txt_seq, 7680]`
/// - **Output**: velocity tokens, same shape as the input
#[derive(Debug, Clone)]
pub struct Flux2Transformer {
    config: TransformerConfig,
    dtype: DType,
    device: Device,
    pe_embedder: EmbedNd,
    x_embedder: Linear,
    context_embedder: Linear,
    time_guidance_embed: TimestepGuidanceEmbeddings,
    double_stream_modulation_img: Modulation,
    double_stream_modulation_txt: Modulation,
    single_stream_modulation: Modulation,
    transformer_blocks: Vec<DoubleStreamBlock>,
    single_transformer_blocks: Vec<SingleStreamBlock>,
    norm_out: AdaLayerNormContinuous,
    proj_out: Linear,
}

impl Flux2Transformer {
    pub fn new(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.inner_dim();
        let mlp = config.mlp_hidden_dim();
        let heads = config.num_attention_heads;
        let head_dim = config.attention_head_dim;
        let eps = config.eps;

        let x_embedder = candle_nn::linear_no_bias(config.in_channels, dim, vb.pp("x_embedder"))?;
        let context_embedder =
            candle_nn::linear_no_bias(config.joint_attention_dim, dim, vb.pp("context_embedder"))?;
        let time_guidance_embed = TimestepGuidanceEmbeddings::new(
            config.timestep_guidance_channels,
            dim,
            config.guidance_embeds,
            vb.pp("time_guidance_embed"),
        )?;

        let double_stream_modulation_img = Modulation::new(dim, 2, vb.pp("double_stream_modulation_img"))?;
        let double_stream_modulation_txt = Modulation::new(dim, 2, vb.pp("double_stream_modulation_txt"))?;
        let single_stream_modulation = Modulation::new(dim, 1, vb.pp("single_stream_modulation"))?;

        let vb_blocks = vb.pp("transformer_blocks");
        let transformer_blocks = (0..config.num_layers)
            .map(|i| DoubleStreamBlock::new(dim, heads, head_dim, mlp, eps, vb_blocks.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let vb_single = vb.pp("single_transformer_blocks");
        let single_transformer_blocks = (0..config.num_single_layers)
            .map(|i| SingleStreamBlock::new(dim, heads, head_dim, mlp, eps, vb_single.pp(i)))
            .collect::<Result<Vec<_>>>()?;

        let norm_out = AdaLayerNormContinuous::new(dim, eps, vb.pp("norm_out"))?;
        let proj_out = candle_nn::linear_no_bias(dim, config.in_channels, vb.pp("proj_out"))?;

        Ok(Self {
            config: config.clone(),
            dtype: vb.dtype(),
            device: vb.device().clone(),
            pe_embedder: EmbedNd::new(config.rope_theta, config.axes_dims_rope.clone()),
            x_embedder,
            context_embedder,
            time_guidance_embed,
            double_stream_modulation_img,
            double_stream_modulation_txt,
            single_stream_modulation,
            transformer_blocks,
            single_transformer_blocks,
            norm_out,
            proj_out,
        })
    }

    /// Every tensor [`Flux2Transformer::new`] reads, with its shape.
    pub fn manifest(config: &TransformerConfig) -> WeightManifest {
        let dim = config.inner_dim();
        let mlp = config.mlp_hidden_dim();
        let head_dim = config.attention_head_dim;
        let channels = config.timestep_guidance_channels;

        let mut m = WeightManifest::new("transformer");
        m.linear("x_embedder", config.in_channels, dim);
        m.linear("context_embedder", config.joint_attention_dim, dim);
        MlpEmbedder::declare(&mut m, "time_guidance_embed.timestep_embedder", channels, dim);
        if config.guidance_embeds {
            MlpEmbedder::declare(&mut m, "time_guidance_embed.guidance_embedder", channels, dim);
        }
        Modulation::declare(&mut m, "double_stream_modulation_img", dim, 2);
        Modulation::declare(&mut m, "double_stream_modulation_txt", dim, 2);
        Modulation::declare(&mut m, "single_stream_modulation", dim, 1);
        for i in 0..config.num_layers {
            DoubleStreamBlock::declare(&mut m, &format!("transformer_blocks.{i}"), dim, head_dim, mlp);
        }
        for i in 0..config.num_single_layers {
            SingleStreamBlock::declare(&mut m, &format!("single_transformer_blocks.{i}"), dim, head_dim, mlp);
        }
        m.linear("norm_out.linear", dim, 2 * dim);
        m.linear("proj_out", dim, config.in_channels);
        m
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `img` - Packed latent tokens `[batch, img_seq, in_channels]`
    /// * `img_ids` - Image position ids `[img_seq, 4]`
    /// * `txt` - Text embeddings `[batch, txt_seq, joint_attention_dim]`
    /// * `txt_ids` - Text position ids `[txt_seq, 4]`
    /// * `timesteps` - Flow times in [0, 1], `[batch]`
    /// * `guidance` - Guidance scales `[batch]`, used only with `guidance_embeds`
    /// * `progress` - Receives one notification per block
    ///
    /// # Returns
    /// Velocity `[batch, img_seq, in_channels]` in the model dtype
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        img: &Tensor,
        img_ids: &Tensor,
        txt: &Tensor,
        txt_ids: &Tensor,
        timesteps: &Tensor,
        guidance: Option<&Tensor>,
        progress: &mut dyn ProgressObserver,
    ) -> Result<Tensor> {
        if img.rank() != 3 {
            candle::bail!("unexpected shape for img {:?}", img.shape())
        }
        if txt.rank() != 3 {
            candle::bail!("unexpected shape for txt {:?}", txt.shape())
        }
        let txt_seq = txt.dim(1)?;
        let img_seq = img.dim(1)?;

        let mut img = img.to_dtype(self.dtype)?.apply(&self.x_embedder)?;
        let mut txt = txt.to_dtype(self.dtype)?.apply(&self.context_embedder)?;

        let temb = self.time_guidance_embed.forward(timesteps, guidance, self.dtype)?;
        let img_mod = self.double_stream_modulation_img.forward(&temb)?;
        let txt_mod = self.double_stream_modulation_txt.forward(&temb)?;
        let single_mod = self.single_stream_modulation.forward(&temb)?;

        let ids = Tensor::cat(&[txt_ids, img_ids], 0)?;
        let pe = self.pe_embedder.forward(&ids, self.dtype)?;

        let n_double = self.transformer_blocks.len();
        for (i, block) in self.transformer_blocks.iter().enumerate() {
            let (t, x) = block.forward(&img, &txt, &img_mod, &txt_mod, &pe)?;
            txt = t;
            img = x;
            progress.substep(Phase::DoubleBlock, i, n_double);
        }

        let mut xs = Tensor::cat(&[&txt, &img], 1)?;
        let n_single = self.single_transformer_blocks.len();
        for (i, block) in self.single_transformer_blocks.iter().enumerate() {
            xs = block.forward(&xs, &single_mod[0], &pe)?;
            progress.substep(Phase::SingleBlock, i, n_single);
        }

        let img = xs.narrow(1, txt_seq, img_seq)?;
        let out = self.norm_out.forward(&img, &temb)?.apply(&self.proj_out)?;
        progress.substep(Phase::FinalLayer, 0, 1);
        Ok(out)
    }
}

impl VelocityModel for Flux2Transformer {
    fn in_channels(&self) -> usize {
        self.config.in_channels
    }

    fn predict(
        &self,
        tokens: &Tensor,
        grid: (usize, usize),
        context: &Tensor,
        timestep: f64,
        guidance: f64,
        progress: &mut dyn ProgressObserver,
    ) -> Result<Tensor> {
        let batch = tokens.dim(0)?;
        let img_ids = image_ids(grid.0, grid.1, &self.device)?;
        let txt_ids = text_ids(context.dim(1)?, &self.device)?;
        let t = Tensor::full(timestep as f32, batch, &self.device)?;
        let g = Tensor::full(guidance as f32, batch, &self.device)?;
        let guidance = self.config.guidance_embeds.then_some(&g);
        self.forward(tokens, &img_ids, context, &txt_ids, &t, guidance, progress)?
            .to_dtype(DType::F32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::tests::{Event, Recorder};
    use candle_nn::VarMap;

    #[test]
    fn test_manifest_matches_constructor() -> Result<()> {
        for guidance_embeds in [false, true] {
            let config = TransformerConfig {
                guidance_embeds,
                ..TransformerConfig::tiny()
            };
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            Flux2Transformer::new(&config, vb)?;
            let manifest = Flux2Transformer::manifest(&config);
            let data = varmap.data().lock().unwrap();
            assert_eq!(data.len(), manifest.len());
            for (name, shape) in manifest.entries() {
                let var = data.get(name).unwrap_or_else(|| panic!("{name} not created"));
                assert_eq!(var.dims(), shape.as_slice(), "{name}");
            }
        }
        Ok(())
    }

    #[test]
    fn test_klein_manifest_size() {
        let manifest = Flux2Transformer::manifest(&TransformerConfig::klein_4b());
        // ~3.9B parameters
        let params = manifest.num_parameters();
        assert!(params > 3_500_000_000 && params < 4_200_000_000, "{params}");
        assert!(manifest
            .entries()
            .iter()
            .any(|(n, s)| n == "single_transformer_blocks.19.attn.to_qkv_mlp_proj.weight"
                && s == &[3 * 3072 + 2 * 9216, 3072]));
    }

    #[test]
    fn test_forward_shape_and_progress() -> Result<()> {
        let device = Device::Cpu;
        let config = TransformerConfig::tiny();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = Flux2Transformer::new(&config, vb)?;

        let tokens = Tensor::randn(0f32, 1f32, (1, 6, config.in_channels), &device)?;
        let context = Tensor::randn(0f32, 1f32, (1, 5, config.joint_attention_dim), &device)?;
        let mut recorder = Recorder::default();
        let out = model.predict(&tokens, (2, 3), &context, 0.5, 1.0, &mut recorder)?;
        assert_eq!(out.dims(), tokens.dims());
        assert_eq!(
            recorder.events,
            vec![
                Event::Substep(Phase::DoubleBlock, 0, 1),
                Event::Substep(Phase::SingleBlock, 0, 2),
                Event::Substep(Phase::SingleBlock, 1, 2),
                Event::Substep(Phase::FinalLayer, 0, 1),
            ]
        );
        Ok(())
    }
}
