//! Generation orchestrator.
//!
//! [`Context`] owns a loaded model directory and runs the stages in order:
//!
//! ```text
//! prompt ──> PromptTokenizer ──> TextEncoder ──> EmbeddingSequence ─┐
//!                                                                    ├─> Sampler ──> VAE decode ──> RasterImage
//! seed ──> MtBoxMullerRng ──> noise ─(img2img: blend with VAE encode)┘
//! ```
//!
//! The transformer and VAE stay resident for the lifetime of the context. The
//! text encoder is by far the largest component and is only needed once per
//! prompt, so it lives in a lazy slot: text-based calls load it on demand and
//! release it again afterwards unless [`Context::set_retain_text_encoder`] is
//! set. [`Context::encode_text`] leaves it resident, to be paired with
//! [`Context::release_text_encoder`].
//!
//! Every entry point records a failure message retrievable through
//! [`Context::last_error`] and never returns a partial image.

use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use candle::{DType, Device, Tensor};

use crate::config::{
    load_config, GenerationParams, LoadOptions, SchedulerConfig, TextEncoderConfig, TransformerConfig,
    VaeConfig,
};
use crate::error::{FluxError, LoadError, Result, Stage, StageContext};
use crate::model::Flux2Transformer;
use crate::progress::{NoProgress, ProgressObserver};
use crate::rng::MtBoxMullerRng;
use crate::sampler::{Conditioning, InitialLatent, Sampler, SamplerOptions};
use crate::tensor::{patchify, unpatchify, EmbeddingSequence, LatentTensor, RasterImage};
use crate::text_encoder::{PromptTokenizer, Qwen3Encoder, TextEncoder};
use crate::vae::AutoencoderKLFlux2;
use crate::weights::WeightTable;

const TRANSFORMER_DIR: &str = "transformer";
const TEXT_ENCODER_DIR: &str = "text_encoder";
const VAE_DIR: &str = "vae";
const TOKENIZER_FILE: &str = "tokenizer/tokenizer.json";
const SCHEDULER_CONFIG_FILE: &str = "scheduler/scheduler_config.json";
const CONFIG_FILE: &str = "config.json";

/// Residency of the text encoder weights.
#[derive(Debug)]
enum EncoderSlot {
    Unloaded,
    Loaded(Box<TextEncoder>),
    Released,
}

impl EncoderSlot {
    fn is_loaded(&self) -> bool {
        matches!(self, EncoderSlot::Loaded(_))
    }

    /// Return the resident encoder, loading it first if needed.
    fn get_or_load(&mut self, load: impl FnOnce() -> Result<TextEncoder>) -> Result<&TextEncoder> {
        if !self.is_loaded() {
            if matches!(self, EncoderSlot::Released) {
                tracing::info!("reloading text encoder");
            } else {
                tracing::info!("loading text encoder");
            }
            let start = Instant::now();
            *self = EncoderSlot::Loaded(Box::new(load()?));
            tracing::debug!("text encoder loaded in {:.2?}", start.elapsed());
        }
        match self {
            EncoderSlot::Loaded(encoder) => Ok(&**encoder),
            _ => Err(FluxError::validation("text encoder is not resident")),
        }
    }

    fn release(&mut self) {
        if self.is_loaded() {
            tracing::info!("releasing text encoder");
            *self = EncoderSlot::Released;
        }
    }
}

fn load_component_config<T>(dir: &Path, validate: impl FnOnce(&T) -> std::result::Result<(), String>) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    let path = dir.join(CONFIG_FILE);
    let config: T = load_config(&path)?;
    validate(&config).map_err(|reason| LoadError::UnsupportedFormat { path, reason })?;
    Ok(config)
}

/// A loaded FLUX.2-klein model.
pub struct Context {
    dir: PathBuf,
    device: Device,
    dtype: DType,

    transformer: Flux2Transformer,
    vae: AutoencoderKLFlux2,
    scheduler_config: SchedulerConfig,

    text_config: TextEncoderConfig,
    text_table: WeightTable,
    tokenizer: PromptTokenizer,
    encoder: EncoderSlot,
    retain_text_encoder: bool,

    seed: Option<u64>,
    last_seed: Option<u64>,
    progress: Box<dyn ProgressObserver>,
    last_error: Option<String>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("dir", &self.dir)
            .field("device", &self.device)
            .field("dtype", &self.dtype)
            .field("encoder", &self.encoder)
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Open a diffusers-layout model directory.
    ///
    /// Every tensor of every stage, the lazily loaded text encoder included,
    /// is checked for presence and shape before anything is built.
    pub fn load(dir: impl AsRef<Path>, options: LoadOptions) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(LoadError::MissingFile(dir.to_path_buf()).into());
        }
        let start = Instant::now();
        let device = options.device.clone();
        let dtype = options.model_dtype();
        tracing::info!("loading model from {} ({dtype:?} on {device:?})", dir.display());

        let transformer_dir = dir.join(TRANSFORMER_DIR);
        let text_dir = dir.join(TEXT_ENCODER_DIR);
        let vae_dir = dir.join(VAE_DIR);

        let transformer_config: TransformerConfig =
            load_component_config(&transformer_dir, TransformerConfig::validate)?;
        let text_config: TextEncoderConfig = load_component_config(&text_dir, TextEncoderConfig::validate)?;
        let vae_config: VaeConfig = load_component_config(&vae_dir, VaeConfig::validate)?;
        let scheduler_config: SchedulerConfig = load_config(&dir.join(SCHEDULER_CONFIG_FILE))?;

        if text_config.embedding_dim() != transformer_config.joint_attention_dim {
            return Err(LoadError::UnsupportedFormat {
                path: text_dir.join(CONFIG_FILE),
                reason: format!(
                    "text embedding width {} does not match joint_attention_dim {}",
                    text_config.embedding_dim(),
                    transformer_config.joint_attention_dim
                ),
            }
            .into());
        }
        if vae_config.patched_channels() != transformer_config.in_channels {
            return Err(LoadError::UnsupportedFormat {
                path: vae_dir.join(CONFIG_FILE),
                reason: format!(
                    "patched latent channels {} do not match transformer in_channels {}",
                    vae_config.patched_channels(),
                    transformer_config.in_channels
                ),
            }
            .into());
        }

        let transformer_table = WeightTable::open(&transformer_dir)?;
        let text_table = WeightTable::open(&text_dir)?;
        let vae_table = WeightTable::open(&vae_dir)?;
        transformer_table.validate(&Flux2Transformer::manifest(&transformer_config))?;
        text_table.validate(&Qwen3Encoder::manifest(&text_config))?;
        vae_table.validate(&AutoencoderKLFlux2::manifest(&vae_config))?;

        let tokenizer = PromptTokenizer::from_file(&dir.join(TOKENIZER_FILE), &text_config)?;

        let vb = transformer_table.var_builder(dtype, &device, Stage::Transformer)?;
        let transformer = Flux2Transformer::new(&transformer_config, vb).stage(Stage::Transformer)?;
        let vb = vae_table.var_builder(DType::F32, &device, Stage::Vae)?;
        let vae = AutoencoderKLFlux2::new(&vae_config, vb).stage(Stage::Vae)?;

        tracing::info!("model loaded in {:.2?}", start.elapsed());
        Ok(Self {
            dir: dir.to_path_buf(),
            device,
            dtype,
            transformer,
            vae,
            scheduler_config,
            text_config,
            text_table,
            tokenizer,
            encoder: EncoderSlot::Unloaded,
            retain_text_encoder: false,
            seed: None,
            last_seed: None,
            progress: Box::new(NoProgress),
            last_error: None,
        })
    }

    /// Release every owned tensor.
    pub fn free(self) {
        tracing::debug!("freeing context for {}", self.dir.display());
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn transformer_config(&self) -> &TransformerConfig {
        self.transformer.config()
    }

    /// Width every embedding row must have.
    pub fn embedding_dim(&self) -> usize {
        self.transformer.config().joint_attention_dim
    }

    /// Human-readable model summary.
    pub fn model_info(&self) -> String {
        let cfg = self.transformer.config();
        let name = if *cfg == TransformerConfig::klein_4b() {
            "FLUX.2 klein 4B"
        } else {
            "FLUX.2 klein"
        };
        format!(
            "{name} ({} double + {} single blocks, hidden {}, text dim {}, {} latent channels, text encoder {})",
            cfg.num_layers,
            cfg.num_single_layers,
            cfg.inner_dim(),
            cfg.joint_attention_dim,
            self.vae.config().latent_channels,
            if self.encoder.is_loaded() { "loaded" } else { "not loaded" },
        )
    }

    /// Message of the most recent failed call, cleared by the next call.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Seed used when a call passes `seed = -1`. Negative seeds are rejected.
    pub fn set_seed(&mut self, seed: i64) -> Result<()> {
        self.record("set_seed", |_| {
            u64::try_from(seed).map_err(|_| FluxError::validation(format!("seed must be non-negative, got {seed}")))
        })
        .map(|seed| self.seed = Some(seed))
    }

    /// Seed used by the most recent generation.
    pub fn last_seed(&self) -> Option<u64> {
        self.last_seed
    }

    pub fn set_progress(&mut self, progress: Box<dyn ProgressObserver>) {
        self.progress = progress;
    }

    pub fn clear_progress(&mut self) {
        self.progress = Box::new(NoProgress);
    }

    /// Keep the text encoder resident after text-based generation calls.
    pub fn set_retain_text_encoder(&mut self, retain: bool) {
        self.retain_text_encoder = retain;
    }

    pub fn text_encoder_loaded(&self) -> bool {
        self.encoder.is_loaded()
    }

    /// Drop the text encoder weights; the next text-based call reloads them.
    pub fn release_text_encoder(&mut self) {
        self.encoder.release();
    }

    // ------------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------------

    /// Text-to-image.
    pub fn generate(&mut self, prompt: &str, params: &GenerationParams) -> Result<RasterImage> {
        self.record("generate", |ctx| {
            params.validate()?;
            let (cond, uncond) = ctx.encode_conditioning(prompt, params.uses_cfg())?;
            ctx.denoise_and_decode(&cond, uncond.as_ref(), None, None, params)
        })
    }

    /// Image-to-image. The input is resized to `width × height` first if needed.
    pub fn img2img(&mut self, prompt: &str, image: &RasterImage, params: &GenerationParams) -> Result<RasterImage> {
        self.record("img2img", |ctx| {
            params.validate()?;
            let input = if (image.width(), image.height()) != (params.width, params.height) {
                tracing::info!(
                    "resizing input {}x{} to {}x{}",
                    image.width(),
                    image.height(),
                    params.width,
                    params.height
                );
                image.resize(params.width, params.height)?
            } else {
                image.to_rgb()
            };
            let (cond, uncond) = ctx.encode_conditioning(prompt, params.uses_cfg())?;
            let latent = ctx.vae.encode_image(&input)?;
            ctx.denoise_and_decode(&cond, uncond.as_ref(), Some(&latent), None, params)
        })
    }

    /// Generate from precomputed embeddings, `seq_len × embedding_dim` floats.
    pub fn generate_with_embeddings(
        &mut self,
        embeddings: &[f32],
        seq_len: usize,
        params: &GenerationParams,
    ) -> Result<RasterImage> {
        self.record("generate_with_embeddings", |ctx| {
            params.validate()?;
            let cond = ctx.external_embeddings(embeddings, seq_len)?;
            let uncond = ctx.unconditioned(params)?;
            ctx.denoise_and_decode(&cond, uncond.as_ref(), None, None, params)
        })
    }

    /// Generate from precomputed embeddings and an explicit initial noise.
    ///
    /// `noise` holds `4C × H/16 × W/16` floats in the patchified latent layout.
    pub fn generate_with_embeddings_and_noise(
        &mut self,
        embeddings: &[f32],
        seq_len: usize,
        noise: &[f32],
        noise_len: usize,
        params: &GenerationParams,
    ) -> Result<RasterImage> {
        self.record("generate_with_embeddings_and_noise", |ctx| {
            params.validate()?;
            let expected = ctx.noise_len(params);
            if noise_len != noise.len() || noise_len != expected {
                return Err(FluxError::validation(format!(
                    "noise holds {} floats (declared {noise_len}), expected {expected} for {}x{}",
                    noise.len(),
                    params.width,
                    params.height
                )));
            }
            let cond = ctx.external_embeddings(embeddings, seq_len)?;
            let uncond = ctx.unconditioned(params)?;
            ctx.denoise_and_decode(&cond, uncond.as_ref(), None, Some(noise), params)
        })
    }

    /// Encode a prompt, leaving the encoder resident. Returns the sequence and its length.
    pub fn encode_text(&mut self, prompt: &str) -> Result<(EmbeddingSequence, usize)> {
        self.record("encode_text", |ctx| {
            let embeddings = ctx.encode_prompt(prompt)?;
            let seq_len = embeddings.seq_len();
            Ok((embeddings, seq_len))
        })
    }

    /// VAE-encode an image. Returns the latent and its height and width.
    pub fn encode_image(&mut self, image: &RasterImage) -> Result<(LatentTensor, usize, usize)> {
        self.record("encode_image", |ctx| {
            let latent = ctx.vae.encode_image(image)?;
            let (h, w) = (latent.height(), latent.width());
            Ok((latent, h, w))
        })
    }

    /// VAE-decode a latent of declared height and width.
    pub fn decode_latent(&mut self, latent: &LatentTensor, height: usize, width: usize) -> Result<RasterImage> {
        self.record("decode_latent", |ctx| {
            if (latent.height(), latent.width()) != (height, width) {
                return Err(FluxError::validation(format!(
                    "latent is {}x{}, declared {height}x{width}",
                    latent.height(),
                    latent.width()
                )));
            }
            ctx.vae.decode_latent(latent)
        })
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Run `f`, keeping `last_error` in sync with its outcome.
    fn record<T>(&mut self, op: &str, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.last_error = None;
        let result = f(self);
        if let Err(e) = &result {
            tracing::error!("{op} failed: {e}");
            self.last_error = Some(e.to_string());
        }
        result
    }

    fn encode_prompt(&mut self, prompt: &str) -> Result<EmbeddingSequence> {
        let encoder = self.encoder.get_or_load(|| {
            TextEncoder::load(&self.text_table, &self.text_config, self.dtype, &self.device)
        })?;
        let start = Instant::now();
        let embeddings = encoder.encode(&self.tokenizer, prompt)?;
        tracing::debug!(
            "encoded prompt to {}x{} in {:.2?}",
            embeddings.seq_len(),
            embeddings.dim(),
            start.elapsed()
        );
        Ok(embeddings)
    }

    /// Conditioned and (for CFG) empty-prompt embeddings, then the release policy.
    fn encode_conditioning(
        &mut self,
        prompt: &str,
        cfg: bool,
    ) -> Result<(EmbeddingSequence, Option<EmbeddingSequence>)> {
        tracing::info!("encoding prompt");
        let encoded = self.encode_prompt(prompt).and_then(|cond| {
            let uncond = if cfg { Some(self.encode_prompt("")?) } else { None };
            Ok((cond, uncond))
        });
        if !self.retain_text_encoder {
            self.encoder.release();
        }
        encoded
    }

    fn unconditioned(&mut self, params: &GenerationParams) -> Result<Option<EmbeddingSequence>> {
        if !params.uses_cfg() {
            return Ok(None);
        }
        let (uncond, _) = self.encode_conditioning("", false)?;
        Ok(Some(uncond))
    }

    fn external_embeddings(&self, embeddings: &[f32], seq_len: usize) -> Result<EmbeddingSequence> {
        let dim = self.embedding_dim();
        if embeddings.len() % dim != 0 {
            return Err(FluxError::encoding(format!(
                "embedding buffer of {} floats is not a multiple of the embedding dimension {dim}",
                embeddings.len()
            )));
        }
        if seq_len.checked_mul(dim) != Some(embeddings.len()) {
            return Err(FluxError::validation(format!(
                "embedding buffer of {} floats does not hold {seq_len} rows of {dim}",
                embeddings.len()
            )));
        }
        EmbeddingSequence::from_f32(embeddings, seq_len, dim, &self.device)
    }

    fn latent_grid(&self, params: &GenerationParams) -> (usize, usize, usize) {
        let patch = self.vae.config().spatial_compression_ratio() * 2;
        (self.transformer.config().in_channels, params.height / patch, params.width / patch)
    }

    fn noise_len(&self, params: &GenerationParams) -> usize {
        let (c, h, w) = self.latent_grid(params);
        c * h * w
    }

    fn resolve_seed(&self, requested: i64) -> u64 {
        if let Ok(seed) = u64::try_from(requested) {
            return seed;
        }
        if let Some(seed) = self.seed {
            return seed;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() ^ u64::from(d.subsec_nanos()))
            .unwrap_or_default();
        now & u64::from(u32::MAX)
    }

    fn denoise_and_decode(
        &mut self,
        cond: &EmbeddingSequence,
        uncond: Option<&EmbeddingSequence>,
        image: Option<&LatentTensor>,
        noise: Option<&[f32]>,
        params: &GenerationParams,
    ) -> Result<RasterImage> {
        let dim = self.embedding_dim();
        cond.check_dim(dim)?;
        if let Some(uncond) = uncond {
            uncond.check_dim(dim)?;
        }

        let seed = self.resolve_seed(params.seed);
        self.last_seed = Some(seed);
        let (c, h, w) = self.latent_grid(params);
        tracing::info!(
            "generating {}x{} ({} steps, guidance {}, seed {seed})",
            params.width,
            params.height,
            params.num_steps,
            params.guidance_scale
        );

        let noise = match noise {
            Some(values) => Tensor::from_slice(values, (1, c, h, w), &self.device),
            None => MtBoxMullerRng::new(seed).randn(&[1, c, h, w], &self.device, DType::F32),
        }
        .stage(Stage::Sampler)?;
        let init = match image {
            Some(latent) => {
                let image = latent
                    .batched()?
                    .to_device(&self.device)
                    .and_then(|z| patchify(&z))
                    .stage(Stage::Sampler)?;
                InitialLatent::Blend {
                    image,
                    noise,
                    strength: params.strength,
                }
            }
            None => InitialLatent::Noise(noise),
        };

        let to_batch = |e: &EmbeddingSequence| e.tensor().to_device(&self.device)?.unsqueeze(0);
        let conditioning = Conditioning {
            cond: to_batch(cond).stage(Stage::Sampler)?,
            uncond: uncond.map(to_batch).transpose().stage(Stage::Sampler)?,
        };
        let options = SamplerOptions {
            num_steps: params.num_steps,
            guidance_scale: params.guidance_scale,
        };

        let start = Instant::now();
        let mut sampler = Sampler::new(&self.scheduler_config);
        let latent = sampler.run(&self.transformer, init, &conditioning, &options, self.progress.as_mut())?;
        tracing::info!("denoising done in {:.2?}", start.elapsed());

        let start = Instant::now();
        let latent = LatentTensor::new(unpatchify(&latent).stage(Stage::Vae)?)?;
        let image = self.vae.decode_latent(&latent)?;
        tracing::info!("decoded {}x{} image in {:.2?}", image.width(), image.height(), start.elapsed());
        Ok(image)
    }
}
