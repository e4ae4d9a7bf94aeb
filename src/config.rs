//! Configuration structures for the FLUX.2-klein components.
//!
//! Each model component reads an optional `config.json` from its directory in
//! the model folder (diffusers layout); every field falls back to the klein 4B
//! value when missing. [`GenerationParams`] is the per-call configuration
//! surface and carries its own range validation.

use std::path::Path;

use candle::{DType, Device};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{FluxError, LoadError, Result};

/// Smallest accepted output width/height in pixels.
pub const MIN_IMAGE_DIM: usize = 64;
/// Largest accepted output width/height in pixels.
pub const MAX_IMAGE_DIM: usize = 4096;
/// Output width/height must be a multiple of this (VAE ×8, then 2×2 patches).
pub const IMAGE_DIM_MULTIPLE: usize = 16;
/// Largest accepted number of sampling steps.
pub const MAX_STEPS: usize = 100;

/// Configuration for the FLUX.2 diffusion transformer.
///
/// Field names follow the diffusers `Flux2Transformer2DModel` config so that
/// `transformer/config.json` deserializes directly.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransformerConfig {
    /// Channels of a packed latent token (default: 128 = 32 latent channels × 2×2).
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,

    /// Number of double-stream blocks (default: 5).
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,

    /// Number of single-stream blocks (default: 20).
    #[serde(default = "default_num_single_layers")]
    pub num_single_layers: usize,

    /// Dimension per attention head (default: 128).
    #[serde(default = "default_attention_head_dim")]
    pub attention_head_dim: usize,

    /// Number of attention heads (default: 24).
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,

    /// Width of the text embeddings (default: 7680 = 3 × 2560 from Qwen3).
    #[serde(default = "default_joint_attention_dim")]
    pub joint_attention_dim: usize,

    /// Sinusoidal timestep embedding width (default: 256).
    #[serde(default = "default_timestep_guidance_channels")]
    pub timestep_guidance_channels: usize,

    /// Feed-forward expansion ratio (default: 3.0).
    #[serde(default = "default_mlp_ratio")]
    pub mlp_ratio: f64,

    /// RoPE dimensions per position axis (default: [32, 32, 32, 32]).
    #[serde(default = "default_axes_dims_rope")]
    pub axes_dims_rope: Vec<usize>,

    /// RoPE base frequency (default: 2000).
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,

    /// LayerNorm / RMSNorm epsilon (default: 1e-6).
    #[serde(default = "default_eps")]
    pub eps: f64,

    /// Whether the model embeds the guidance scale (false for klein).
    #[serde(default)]
    pub guidance_embeds: bool,
}

fn default_in_channels() -> usize {
    128
}
fn default_num_layers() -> usize {
    5
}
fn default_num_single_layers() -> usize {
    20
}
fn default_attention_head_dim() -> usize {
    128
}
fn default_num_attention_heads() -> usize {
    24
}
fn default_joint_attention_dim() -> usize {
    7680
}
fn default_timestep_guidance_channels() -> usize {
    256
}
fn default_mlp_ratio() -> f64 {
    3.0
}
fn default_axes_dims_rope() -> Vec<usize> {
    vec![32, 32, 32, 32]
}
fn default_rope_theta() -> f64 {
    2000.0
}
fn default_eps() -> f64 {
    1e-6
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self::klein_4b()
    }
}

impl TransformerConfig {
    /// FLUX.2-klein 4B: 5 double blocks, 20 single blocks, 3072 hidden.
    pub fn klein_4b() -> Self {
        Self {
            in_channels: 128,
            num_layers: 5,
            num_single_layers: 20,
            attention_head_dim: 128,
            num_attention_heads: 24,
            joint_attention_dim: 7680,
            timestep_guidance_channels: 256,
            mlp_ratio: 3.0,
            axes_dims_rope: vec![32, 32, 32, 32],
            rope_theta: 2000.0,
            eps: 1e-6,
            guidance_embeds: false,
        }
    }

    /// A structurally complete but very small transformer for smoke tests.
    pub fn tiny() -> Self {
        Self {
            in_channels: 16,
            num_layers: 1,
            num_single_layers: 2,
            attention_head_dim: 16,
            num_attention_heads: 2,
            joint_attention_dim: 48,
            timestep_guidance_channels: 32,
            mlp_ratio: 3.0,
            axes_dims_rope: vec![4, 4, 4, 4],
            rope_theta: 2000.0,
            eps: 1e-6,
            guidance_embeds: false,
        }
    }

    /// Hidden size = num_heads × head_dim (3072 for klein 4B).
    pub fn inner_dim(&self) -> usize {
        self.num_attention_heads * self.attention_head_dim
    }

    /// SwiGLU hidden width (9216 for klein 4B).
    pub fn mlp_hidden_dim(&self) -> usize {
        (self.inner_dim() as f64 * self.mlp_ratio) as usize
    }

    /// Sum of the per-axis RoPE dimensions; must equal the head dimension.
    pub fn rope_dim(&self) -> usize {
        self.axes_dims_rope.iter().sum()
    }

    /// Check internal consistency of a deserialized configuration.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.rope_dim() != self.attention_head_dim {
            return Err(format!(
                "axes_dims_rope {:?} sum to {} but attention_head_dim is {}",
                self.axes_dims_rope,
                self.rope_dim(),
                self.attention_head_dim
            ));
        }
        if self.axes_dims_rope.iter().any(|d| d % 2 != 0) {
            return Err(format!("axes_dims_rope {:?} must be even", self.axes_dims_rope));
        }
        if self.timestep_guidance_channels % 2 != 0 {
            return Err("timestep_guidance_channels must be even".to_string());
        }
        Ok(())
    }
}

/// Configuration for the Qwen3 text encoder.
///
/// The model fields match the HuggingFace `Qwen3Config`; `output_layers`,
/// `max_length` and `pad_token_id` describe how FLUX.2 conditions on it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TextEncoderConfig {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,

    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,

    /// Layers in the checkpoint (36). Only the first `max(output_layers)` run.
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,

    #[serde(default = "default_text_num_attention_heads")]
    pub num_attention_heads: usize,

    #[serde(default = "default_num_key_value_heads")]
    pub num_key_value_heads: usize,

    #[serde(default = "default_head_dim")]
    pub head_dim: usize,

    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,

    #[serde(default = "default_text_rope_theta")]
    pub rope_theta: f64,

    /// Hidden-state indices to concatenate (index 0 = token embeddings).
    #[serde(default = "default_output_layers")]
    pub output_layers: Vec<usize>,

    /// Fixed prompt length after padding/truncation.
    #[serde(default = "default_max_length")]
    pub max_length: usize,

    /// Token used to right-pad prompts (`<|endoftext|>`).
    #[serde(default = "default_pad_token_id")]
    pub pad_token_id: u32,
}

fn default_vocab_size() -> usize {
    151936
}
fn default_hidden_size() -> usize {
    2560
}
fn default_intermediate_size() -> usize {
    9728
}
fn default_num_hidden_layers() -> usize {
    36
}
fn default_text_num_attention_heads() -> usize {
    32
}
fn default_num_key_value_heads() -> usize {
    8
}
fn default_head_dim() -> usize {
    128
}
fn default_rms_norm_eps() -> f64 {
    1e-6
}
fn default_text_rope_theta() -> f64 {
    1_000_000.0
}
fn default_output_layers() -> Vec<usize> {
    vec![9, 18, 27]
}
fn default_max_length() -> usize {
    512
}
fn default_pad_token_id() -> u32 {
    151643
}

impl Default for TextEncoderConfig {
    fn default() -> Self {
        Self::qwen3_4b()
    }
}

impl TextEncoderConfig {
    /// Qwen3-4B as shipped with FLUX.2-klein.
    pub fn qwen3_4b() -> Self {
        Self {
            vocab_size: 151936,
            hidden_size: 2560,
            intermediate_size: 9728,
            num_hidden_layers: 36,
            num_attention_heads: 32,
            num_key_value_heads: 8,
            head_dim: 128,
            rms_norm_eps: 1e-6,
            rope_theta: 1_000_000.0,
            output_layers: vec![9, 18, 27],
            max_length: 512,
            pad_token_id: 151643,
        }
    }

    /// Tiny encoder whose embedding width matches [`TransformerConfig::tiny`].
    pub fn tiny() -> Self {
        Self {
            vocab_size: 64,
            hidden_size: 16,
            intermediate_size: 32,
            num_hidden_layers: 4,
            num_attention_heads: 4,
            num_key_value_heads: 2,
            head_dim: 4,
            rms_norm_eps: 1e-6,
            rope_theta: 1_000_000.0,
            output_layers: vec![1, 2, 3],
            max_length: 24,
            pad_token_id: 0,
        }
    }

    /// Width of the concatenated conditioning vectors (7680 for klein).
    pub fn embedding_dim(&self) -> usize {
        self.hidden_size * self.output_layers.len()
    }

    /// Number of decoder layers that must actually run.
    pub fn layers_to_run(&self) -> usize {
        self.output_layers.iter().copied().max().unwrap_or(0)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.output_layers.is_empty() {
            return Err("output_layers must not be empty".to_string());
        }
        if self.layers_to_run() > self.num_hidden_layers {
            return Err(format!(
                "output layer {} exceeds num_hidden_layers {}",
                self.layers_to_run(),
                self.num_hidden_layers
            ));
        }
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            return Err(format!(
                "num_attention_heads {} is not a multiple of num_key_value_heads {}",
                self.num_attention_heads, self.num_key_value_heads
            ));
        }
        if self.max_length == 0 {
            return Err("max_length must be positive".to_string());
        }
        Ok(())
    }
}

/// Configuration for the FLUX.2 VAE (`AutoencoderKLFlux2`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VaeConfig {
    /// Image channels (default: 3).
    #[serde(default = "default_image_channels")]
    pub in_channels: usize,

    /// Decoded image channels (default: 3).
    #[serde(default = "default_image_channels")]
    pub out_channels: usize,

    /// Channels per resolution level (default: [128, 256, 512, 512]).
    #[serde(default = "default_block_out_channels")]
    pub block_out_channels: Vec<usize>,

    /// Residual blocks per encoder level; the decoder uses one more (default: 2).
    #[serde(default = "default_layers_per_block")]
    pub layers_per_block: usize,

    /// Latent channels before 2×2 patchification (default: 32).
    #[serde(default = "default_latent_channels")]
    pub latent_channels: usize,

    /// GroupNorm groups (default: 32).
    #[serde(default = "default_norm_num_groups")]
    pub norm_num_groups: usize,

    /// Epsilon of the latent batch-norm statistics (default: 1e-4).
    #[serde(default = "default_batch_norm_eps")]
    pub batch_norm_eps: f64,
}

fn default_image_channels() -> usize {
    3
}
fn default_block_out_channels() -> Vec<usize> {
    vec![128, 256, 512, 512]
}
fn default_layers_per_block() -> usize {
    2
}
fn default_latent_channels() -> usize {
    32
}
fn default_norm_num_groups() -> usize {
    32
}
fn default_batch_norm_eps() -> f64 {
    1e-4
}

impl Default for VaeConfig {
    fn default() -> Self {
        Self::flux2()
    }
}

impl VaeConfig {
    /// The FLUX.2 autoencoder: 8× spatial compression to 32 channels.
    pub fn flux2() -> Self {
        Self {
            in_channels: 3,
            out_channels: 3,
            block_out_channels: vec![128, 256, 512, 512],
            layers_per_block: 2,
            latent_channels: 32,
            norm_num_groups: 32,
            batch_norm_eps: 1e-4,
        }
    }

    /// Four levels (still 8× compression) with very few channels.
    pub fn tiny() -> Self {
        Self {
            in_channels: 3,
            out_channels: 3,
            block_out_channels: vec![8, 8, 16, 16],
            layers_per_block: 1,
            latent_channels: 4,
            norm_num_groups: 4,
            batch_norm_eps: 1e-4,
        }
    }

    /// Spatial compression ratio (2^(levels - 1) = 8).
    pub fn spatial_compression_ratio(&self) -> usize {
        1 << self.block_out_channels.len().saturating_sub(1)
    }

    /// Channels of the 2×2 patchified latent seen by the transformer.
    pub fn patched_channels(&self) -> usize {
        self.latent_channels * 4
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.block_out_channels.is_empty() {
            return Err("block_out_channels must not be empty".to_string());
        }
        if let Some(c) = self
            .block_out_channels
            .iter()
            .find(|&&c| c % self.norm_num_groups != 0)
        {
            return Err(format!(
                "channel count {c} is not divisible by norm_num_groups {}",
                self.norm_num_groups
            ));
        }
        Ok(())
    }
}

/// Configuration for the rectified-flow timestep schedule.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SchedulerConfig {
    /// Multiplier from sigma to model timestep (default: 1000).
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,

    /// Derive the shift from image size and step count (default: true).
    #[serde(default = "default_use_dynamic_shifting")]
    pub use_dynamic_shifting: bool,

    /// Static shift used when dynamic shifting is off (default: 3.0).
    #[serde(default = "default_shift")]
    pub shift: f64,
}

fn default_num_train_timesteps() -> usize {
    1000
}
fn default_use_dynamic_shifting() -> bool {
    true
}
fn default_shift() -> f64 {
    3.0
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::flux2()
    }
}

impl SchedulerConfig {
    pub fn flux2() -> Self {
        Self {
            num_train_timesteps: 1000,
            use_dynamic_shifting: true,
            shift: 3.0,
        }
    }
}

/// Parameters of a single generation call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    /// Output width in pixels, in [64, 4096] and a multiple of 16.
    pub width: usize,
    /// Output height in pixels, in [64, 4096] and a multiple of 16.
    pub height: usize,
    /// Number of sampling steps, in [1, 100].
    pub num_steps: usize,
    /// Classifier-free guidance scale; 1.0 disables the unconditioned pass.
    pub guidance_scale: f64,
    /// Seed for the initial noise; -1 picks a fresh one.
    pub seed: i64,
    /// Fraction of the schedule applied in img2img, in [0, 1].
    pub strength: f64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            width: 256,
            height: 256,
            num_steps: 4,
            guidance_scale: 1.0,
            seed: -1,
            strength: 0.75,
        }
    }
}

impl GenerationParams {
    /// Reject out-of-range parameters. Nothing is clamped.
    pub fn validate(&self) -> Result<()> {
        validate_dimension("width", self.width)?;
        validate_dimension("height", self.height)?;
        if self.num_steps < 1 || self.num_steps > MAX_STEPS {
            return Err(FluxError::validation(format!(
                "num_steps must be between 1 and {MAX_STEPS}, got {}",
                self.num_steps
            )));
        }
        if !self.guidance_scale.is_finite() || self.guidance_scale < 0.0 {
            return Err(FluxError::validation(format!(
                "guidance_scale must be a non-negative number, got {}",
                self.guidance_scale
            )));
        }
        if !(0.0..=1.0).contains(&self.strength) {
            return Err(FluxError::validation(format!(
                "strength must be between 0.0 and 1.0, got {}",
                self.strength
            )));
        }
        if self.seed < -1 {
            return Err(FluxError::validation(format!(
                "seed must be non-negative or -1, got {}",
                self.seed
            )));
        }
        Ok(())
    }

    /// Whether an unconditioned pass is needed.
    pub fn uses_cfg(&self) -> bool {
        self.guidance_scale != 1.0
    }
}

fn validate_dimension(name: &str, value: usize) -> Result<()> {
    if !(MIN_IMAGE_DIM..=MAX_IMAGE_DIM).contains(&value) {
        return Err(FluxError::validation(format!(
            "{name} must be between {MIN_IMAGE_DIM} and {MAX_IMAGE_DIM}, got {value}"
        )));
    }
    if value % IMAGE_DIM_MULTIPLE != 0 {
        return Err(FluxError::validation(format!(
            "{name} must be a multiple of {IMAGE_DIM_MULTIPLE}, got {value}"
        )));
    }
    Ok(())
}

/// Where and in which precision the model is loaded.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub device: Device,
    /// Weight dtype for the text encoder and transformer. `None` picks BF16 on
    /// accelerators and F32 on CPU. The VAE always runs in F32.
    pub dtype: Option<DType>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self::cpu()
    }
}

impl LoadOptions {
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            dtype: None,
        }
    }

    pub fn new(device: Device) -> Self {
        Self {
            device,
            dtype: None,
        }
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn model_dtype(&self) -> DType {
        self.dtype
            .unwrap_or_else(|| self.device.bf16_default_to_f32())
    }
}

/// Read a component `config.json`, falling back to defaults when absent.
pub fn load_config<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        tracing::debug!("no {}, using defaults", path.display());
        return Ok(T::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| FluxError::io(path, e))?;
    serde_json::from_str(&contents).map_err(|e| {
        LoadError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transformer_config_defaults() {
        let config = TransformerConfig::klein_4b();
        assert_eq!(config.inner_dim(), 3072); // 24 * 128
        assert_eq!(config.mlp_hidden_dim(), 9216); // 3072 * 3
        assert_eq!(config.rope_dim(), 128);
        assert!(config.validate().is_ok());
        assert!(TransformerConfig::tiny().validate().is_ok());
    }

    #[test]
    fn test_text_encoder_config_defaults() {
        let config = TextEncoderConfig::qwen3_4b();
        assert_eq!(config.embedding_dim(), 7680); // 3 * 2560
        assert_eq!(config.layers_to_run(), 27);
        assert!(config.validate().is_ok());
        let tiny = TextEncoderConfig::tiny();
        assert_eq!(tiny.embedding_dim(), TransformerConfig::tiny().joint_attention_dim);
    }

    #[test]
    fn test_vae_config_defaults() {
        let config = VaeConfig::flux2();
        assert_eq!(config.spatial_compression_ratio(), 8);
        assert_eq!(config.patched_channels(), 128);
        assert_eq!(VaeConfig::tiny().spatial_compression_ratio(), 8);
        assert_eq!(
            VaeConfig::tiny().patched_channels(),
            TransformerConfig::tiny().in_channels
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: TransformerConfig =
            serde_json::from_str(r#"{"num_layers": 2, "_class_name": "Flux2Transformer2DModel"}"#)
                .unwrap();
        assert_eq!(config.num_layers, 2);
        assert_eq!(config.num_single_layers, 20);
        assert_eq!(config.axes_dims_rope, vec![32, 32, 32, 32]);
    }

    #[test]
    fn test_generation_params_ranges() {
        assert!(GenerationParams::default().validate().is_ok());

        let rejects = [
            GenerationParams { num_steps: 0, ..Default::default() },
            GenerationParams { num_steps: 101, ..Default::default() },
            GenerationParams { width: 32, ..Default::default() },
            GenerationParams { height: 4112, ..Default::default() },
            GenerationParams { width: 100, ..Default::default() },
            GenerationParams { strength: -0.1, ..Default::default() },
            GenerationParams { strength: 1.1, ..Default::default() },
            GenerationParams { guidance_scale: -1.0, ..Default::default() },
            GenerationParams { guidance_scale: f64::NAN, ..Default::default() },
            GenerationParams { seed: -2, ..Default::default() },
        ];
        for params in rejects {
            let err = params.validate().unwrap_err();
            assert!(matches!(err, FluxError::Validation(_)), "{params:?}");
        }
    }

    #[test]
    fn test_cfg_gate() {
        assert!(!GenerationParams::default().uses_cfg());
        let params = GenerationParams { guidance_scale: 4.0, ..Default::default() };
        assert!(params.uses_cfg());
    }
}
