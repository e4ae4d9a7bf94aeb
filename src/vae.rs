//! FLUX.2 variational autoencoder (`AutoencoderKLFlux2`, diffusers layout).
//!
//! A 2D KL autoencoder with 8× spatial compression to 32 channels. What
//! distinguishes it from earlier FLUX VAEs is the latent normalization: the
//! latent is 2×2-patchified to 128 channels and standardized with stored
//! batch-norm statistics, which is the space the transformer works in.
//!
//! ```text
//! encode: image -> encoder -> quant_conv -> mean -> patchify -> (z - m) / sqrt(v + eps)
//! decode: z * sqrt(v + eps) + m -> unpatchify -> post_quant_conv -> decoder -> image
//! ```

use candle::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{conv2d, group_norm, Conv2d, Conv2dConfig, GroupNorm, Linear, VarBuilder};

use crate::config::{VaeConfig, IMAGE_DIM_MULTIPLE};
use crate::error::{FluxError, Stage, StageContext};
use crate::tensor::{patchify, unpatchify, LatentTensor, RasterImage};
use crate::weights::WeightManifest;

const GROUP_NORM_EPS: f64 = 1e-6;

fn conv3x3() -> Conv2dConfig {
    Conv2dConfig {
        padding: 1,
        ..Default::default()
    }
}

// ============================================================================
// Attention
// ============================================================================

/// Single-head spatial self-attention of the mid block.
#[derive(Debug, Clone)]
struct Attention {
    group_norm: GroupNorm,
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Linear,
}

impl Attention {
    fn new(channels: usize, num_groups: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            group_norm: group_norm(num_groups, channels, GROUP_NORM_EPS, vb.pp("group_norm"))?,
            to_q: candle_nn::linear(channels, channels, vb.pp("to_q"))?,
            to_k: candle_nn::linear(channels, channels, vb.pp("to_k"))?,
            to_v: candle_nn::linear(channels, channels, vb.pp("to_v"))?,
            to_out: candle_nn::linear(channels, channels, vb.pp("to_out").pp("0"))?,
        })
    }

    fn declare(m: &mut WeightManifest, prefix: &str, channels: usize) {
        m.norm_b(&format!("{prefix}.group_norm"), channels);
        for name in ["to_q", "to_k", "to_v", "to_out.0"] {
            m.linear_b(&format!("{prefix}.{name}"), channels, channels);
        }
    }
}

impl Module for Attention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let residual = xs;
        let (b, c, h, w) = xs.dims4()?;

        // [B, C, H, W] -> [B, H·W, C]
        let xs = xs
            .apply(&self.group_norm)?
            .reshape((b, c, h * w))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = xs.apply(&self.to_q)?;
        let k = xs.apply(&self.to_k)?;
        let v = xs.apply(&self.to_v)?;

        let scale = 1.0 / (c as f64).sqrt();
        let weights = (q.matmul(&k.t()?)? * scale)?;
        let weights = candle_nn::ops::softmax_last_dim(&weights)?;
        let xs = weights.matmul(&v)?.apply(&self.to_out)?;

        let xs = xs.transpose(1, 2)?.reshape((b, c, h, w))?;
        xs + residual
    }
}

// ============================================================================
// Residual block
// ============================================================================

#[derive(Debug, Clone)]
struct ResnetBlock2D {
    norm1: GroupNorm,
    conv1: Conv2d,
    norm2: GroupNorm,
    conv2: Conv2d,
    conv_shortcut: Option<Conv2d>,
}

impl ResnetBlock2D {
    fn new(in_channels: usize, out_channels: usize, num_groups: usize, vb: VarBuilder) -> Result<Self> {
        let conv_shortcut = if in_channels != out_channels {
            Some(conv2d(in_channels, out_channels, 1, Default::default(), vb.pp("conv_shortcut"))?)
        } else {
            None
        };
        Ok(Self {
            norm1: group_norm(num_groups, in_channels, GROUP_NORM_EPS, vb.pp("norm1"))?,
            conv1: conv2d(in_channels, out_channels, 3, conv3x3(), vb.pp("conv1"))?,
            norm2: group_norm(num_groups, out_channels, GROUP_NORM_EPS, vb.pp("norm2"))?,
            conv2: conv2d(out_channels, out_channels, 3, conv3x3(), vb.pp("conv2"))?,
            conv_shortcut,
        })
    }

    fn declare(m: &mut WeightManifest, prefix: &str, in_channels: usize, out_channels: usize) {
        m.norm_b(&format!("{prefix}.norm1"), in_channels);
        m.conv2d(&format!("{prefix}.conv1"), in_channels, out_channels, 3);
        m.norm_b(&format!("{prefix}.norm2"), out_channels);
        m.conv2d(&format!("{prefix}.conv2"), out_channels, out_channels, 3);
        if in_channels != out_channels {
            m.conv2d(&format!("{prefix}.conv_shortcut"), in_channels, out_channels, 1);
        }
    }
}

impl Module for ResnetBlock2D {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = xs
            .apply(&self.norm1)?
            .silu()?
            .apply(&self.conv1)?
            .apply(&self.norm2)?
            .silu()?
            .apply(&self.conv2)?;
        match &self.conv_shortcut {
            Some(conv) => xs.apply(conv)? + h,
            None => xs + h,
        }
    }
}

// ============================================================================
// Resampling
// ============================================================================

/// Stride-2 conv after asymmetric (0, 1, 0, 1) zero padding.
#[derive(Debug, Clone)]
struct Downsample2D {
    conv: Conv2d,
}

impl Downsample2D {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            stride: 2,
            ..Default::default()
        };
        Ok(Self {
            conv: conv2d(channels, channels, 3, cfg, vb.pp("conv"))?,
        })
    }
}

impl Module for Downsample2D {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.pad_with_zeros(D::Minus1, 0, 1)?
            .pad_with_zeros(D::Minus2, 0, 1)?
            .apply(&self.conv)
    }
}

/// Nearest-neighbour ×2 followed by a 3×3 conv.
#[derive(Debug, Clone)]
struct Upsample2D {
    conv: Conv2d,
}

impl Upsample2D {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv: conv2d(channels, channels, 3, conv3x3(), vb.pp("conv"))?,
        })
    }
}

impl Module for Upsample2D {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = xs.dims4()?;
        xs.upsample_nearest2d(h * 2, w * 2)?.apply(&self.conv)
    }
}

// ============================================================================
// Blocks
// ============================================================================

/// Residual stack with an optional resampler (`downsamplers.0` / `upsamplers.0`).
#[derive(Debug, Clone)]
struct ResampleBlock {
    resnets: Vec<ResnetBlock2D>,
    down: Option<Downsample2D>,
    up: Option<Upsample2D>,
}

impl ResampleBlock {
    fn down(
        in_channels: usize,
        out_channels: usize,
        num_layers: usize,
        num_groups: usize,
        add_downsample: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let resnets = Self::resnets(in_channels, out_channels, num_layers, num_groups, &vb)?;
        let down = if add_downsample {
            Some(Downsample2D::new(out_channels, vb.pp("downsamplers").pp("0"))?)
        } else {
            None
        };
        Ok(Self {
            resnets,
            down,
            up: None,
        })
    }

    fn up(
        in_channels: usize,
        out_channels: usize,
        num_layers: usize,
        num_groups: usize,
        add_upsample: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let resnets = Self::resnets(in_channels, out_channels, num_layers, num_groups, &vb)?;
        let up = if add_upsample {
            Some(Upsample2D::new(out_channels, vb.pp("upsamplers").pp("0"))?)
        } else {
            None
        };
        Ok(Self {
            resnets,
            down: None,
            up,
        })
    }

    fn resnets(
        in_channels: usize,
        out_channels: usize,
        num_layers: usize,
        num_groups: usize,
        vb: &VarBuilder,
    ) -> Result<Vec<ResnetBlock2D>> {
        let vb = vb.pp("resnets");
        (0..num_layers)
            .map(|i| {
                let in_c = if i == 0 { in_channels } else { out_channels };
                ResnetBlock2D::new(in_c, out_channels, num_groups, vb.pp(i))
            })
            .collect()
    }

    fn declare(
        m: &mut WeightManifest,
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
        num_layers: usize,
        resampler: Option<&str>,
    ) {
        for i in 0..num_layers {
            let in_c = if i == 0 { in_channels } else { out_channels };
            ResnetBlock2D::declare(m, &format!("{prefix}.resnets.{i}"), in_c, out_channels);
        }
        if let Some(kind) = resampler {
            m.conv2d(&format!("{prefix}.{kind}.0.conv"), out_channels, out_channels, 3);
        }
    }
}

impl Module for ResampleBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for resnet in &self.resnets {
            xs = xs.apply(resnet)?;
        }
        if let Some(down) = &self.down {
            xs = xs.apply(down)?;
        }
        if let Some(up) = &self.up {
            xs = xs.apply(up)?;
        }
        Ok(xs)
    }
}

#[derive(Debug, Clone)]
struct MidBlock {
    resnet_0: ResnetBlock2D,
    attention: Attention,
    resnet_1: ResnetBlock2D,
}

impl MidBlock {
    fn new(channels: usize, num_groups: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            resnet_0: ResnetBlock2D::new(channels, channels, num_groups, vb.pp("resnets").pp("0"))?,
            attention: Attention::new(channels, num_groups, vb.pp("attentions").pp("0"))?,
            resnet_1: ResnetBlock2D::new(channels, channels, num_groups, vb.pp("resnets").pp("1"))?,
        })
    }

    fn declare(m: &mut WeightManifest, prefix: &str, channels: usize) {
        ResnetBlock2D::declare(m, &format!("{prefix}.resnets.0"), channels, channels);
        Attention::declare(m, &format!("{prefix}.attentions.0"), channels);
        ResnetBlock2D::declare(m, &format!("{prefix}.resnets.1"), channels, channels);
    }
}

impl Module for MidBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.resnet_0)?
            .apply(&self.attention)?
            .apply(&self.resnet_1)
    }
}

fn mid_channels(cfg: &VaeConfig) -> usize {
    cfg.block_out_channels.last().copied().unwrap_or_default()
}

// ============================================================================
// Encoder / Decoder
// ============================================================================

#[derive(Debug, Clone)]
struct Encoder {
    conv_in: Conv2d,
    down_blocks: Vec<ResampleBlock>,
    mid_block: MidBlock,
    conv_norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl Encoder {
    fn new(cfg: &VaeConfig, vb: VarBuilder) -> Result<Self> {
        let channels = &cfg.block_out_channels;
        let conv_in = conv2d(cfg.in_channels, channels[0], 3, conv3x3(), vb.pp("conv_in"))?;

        let vb_down = vb.pp("down_blocks");
        let mut down_blocks = Vec::with_capacity(channels.len());
        for (i, &out_c) in channels.iter().enumerate() {
            let in_c = if i == 0 { channels[0] } else { channels[i - 1] };
            let add_downsample = i + 1 < channels.len();
            down_blocks.push(ResampleBlock::down(
                in_c,
                out_c,
                cfg.layers_per_block,
                cfg.norm_num_groups,
                add_downsample,
                vb_down.pp(i),
            )?);
        }

        let mid = mid_channels(cfg);
        Ok(Self {
            conv_in,
            down_blocks,
            mid_block: MidBlock::new(mid, cfg.norm_num_groups, vb.pp("mid_block"))?,
            conv_norm_out: group_norm(cfg.norm_num_groups, mid, GROUP_NORM_EPS, vb.pp("conv_norm_out"))?,
            conv_out: conv2d(mid, 2 * cfg.latent_channels, 3, conv3x3(), vb.pp("conv_out"))?,
        })
    }

    fn declare(m: &mut WeightManifest, cfg: &VaeConfig) {
        let channels = &cfg.block_out_channels;
        m.conv2d("encoder.conv_in", cfg.in_channels, channels[0], 3);
        for (i, &out_c) in channels.iter().enumerate() {
            let in_c = if i == 0 { channels[0] } else { channels[i - 1] };
            let resampler = (i + 1 < channels.len()).then_some("downsamplers");
            ResampleBlock::declare(
                m,
                &format!("encoder.down_blocks.{i}"),
                in_c,
                out_c,
                cfg.layers_per_block,
                resampler,
            );
        }
        let mid = mid_channels(cfg);
        MidBlock::declare(m, "encoder.mid_block", mid);
        m.norm_b("encoder.conv_norm_out", mid);
        m.conv2d("encoder.conv_out", mid, 2 * cfg.latent_channels, 3);
    }
}

impl Module for Encoder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.apply(&self.conv_in)?;
        for block in &self.down_blocks {
            xs = xs.apply(block)?;
        }
        xs.apply(&self.mid_block)?
            .apply(&self.conv_norm_out)?
            .silu()?
            .apply(&self.conv_out)
    }
}

#[derive(Debug, Clone)]
struct Decoder {
    conv_in: Conv2d,
    mid_block: MidBlock,
    up_blocks: Vec<ResampleBlock>,
    conv_norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl Decoder {
    fn new(cfg: &VaeConfig, vb: VarBuilder) -> Result<Self> {
        let mid = mid_channels(cfg);
        let reversed: Vec<usize> = cfg.block_out_channels.iter().rev().copied().collect();

        let vb_up = vb.pp("up_blocks");
        let mut up_blocks = Vec::with_capacity(reversed.len());
        for (i, &out_c) in reversed.iter().enumerate() {
            let in_c = if i == 0 { mid } else { reversed[i - 1] };
            let add_upsample = i + 1 < reversed.len();
            up_blocks.push(ResampleBlock::up(
                in_c,
                out_c,
                cfg.layers_per_block + 1,
                cfg.norm_num_groups,
                add_upsample,
                vb_up.pp(i),
            )?);
        }

        let last = cfg.block_out_channels[0];
        Ok(Self {
            conv_in: conv2d(cfg.latent_channels, mid, 3, conv3x3(), vb.pp("conv_in"))?,
            mid_block: MidBlock::new(mid, cfg.norm_num_groups, vb.pp("mid_block"))?,
            up_blocks,
            conv_norm_out: group_norm(cfg.norm_num_groups, last, GROUP_NORM_EPS, vb.pp("conv_norm_out"))?,
            conv_out: conv2d(last, cfg.out_channels, 3, conv3x3(), vb.pp("conv_out"))?,
        })
    }

    fn declare(m: &mut WeightManifest, cfg: &VaeConfig) {
        let mid = mid_channels(cfg);
        let reversed: Vec<usize> = cfg.block_out_channels.iter().rev().copied().collect();
        m.conv2d("decoder.conv_in", cfg.latent_channels, mid, 3);
        MidBlock::declare(m, "decoder.mid_block", mid);
        for (i, &out_c) in reversed.iter().enumerate() {
            let in_c = if i == 0 { mid } else { reversed[i - 1] };
            let resampler = (i + 1 < reversed.len()).then_some("upsamplers");
            ResampleBlock::declare(
                m,
                &format!("decoder.up_blocks.{i}"),
                in_c,
                out_c,
                cfg.layers_per_block + 1,
                resampler,
            );
        }
        let last = cfg.block_out_channels[0];
        m.norm_b("decoder.conv_norm_out", last);
        m.conv2d("decoder.conv_out", last, cfg.out_channels, 3);
    }
}

impl Module for Decoder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.apply(&self.conv_in)?.apply(&self.mid_block)?;
        for block in &self.up_blocks {
            xs = xs.apply(block)?;
        }
        xs.apply(&self.conv_norm_out)?.silu()?.apply(&self.conv_out)
    }
}

// ============================================================================
// Latent normalization
// ============================================================================

/// Frozen batch-norm statistics over the patchified latent channels.
#[derive(Debug, Clone)]
pub struct LatentNorm {
    mean: Tensor,
    std: Tensor,
}

impl LatentNorm {
    fn new(channels: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let mean = vb.get_with_hints(channels, "running_mean", candle_nn::Init::Const(0.0))?;
        let var = vb.get_with_hints(channels, "running_var", candle_nn::Init::Const(1.0))?;
        let std = (var + eps)?.sqrt()?;
        Ok(Self {
            mean: mean.reshape((1, channels, 1, 1))?,
            std: std.reshape((1, channels, 1, 1))?,
        })
    }

    /// `(z - m) / sqrt(v + eps)` on `[B, 4C, h, w]`.
    pub fn normalize(&self, xs: &Tensor) -> Result<Tensor> {
        xs.broadcast_sub(&self.mean)?.broadcast_div(&self.std)
    }

    /// `z * sqrt(v + eps) + m` on `[B, 4C, h, w]`.
    pub fn denormalize(&self, xs: &Tensor) -> Result<Tensor> {
        xs.broadcast_mul(&self.std)?.broadcast_add(&self.mean)
    }
}

// ============================================================================
// Autoencoder
// ============================================================================

#[derive(Debug, Clone)]
pub struct AutoencoderKLFlux2 {
    encoder: Encoder,
    decoder: Decoder,
    quant_conv: Conv2d,
    post_quant_conv: Conv2d,
    bn: LatentNorm,
    config: VaeConfig,
    device: Device,
}

impl AutoencoderKLFlux2 {
    pub fn new(config: &VaeConfig, vb: VarBuilder) -> Result<Self> {
        let latent = config.latent_channels;
        Ok(Self {
            encoder: Encoder::new(config, vb.pp("encoder"))?,
            decoder: Decoder::new(config, vb.pp("decoder"))?,
            quant_conv: conv2d(2 * latent, 2 * latent, 1, Default::default(), vb.pp("quant_conv"))?,
            post_quant_conv: conv2d(latent, latent, 1, Default::default(), vb.pp("post_quant_conv"))?,
            bn: LatentNorm::new(config.patched_channels(), config.batch_norm_eps, vb.pp("bn"))?,
            config: config.clone(),
            device: vb.device().clone(),
        })
    }

    /// The tensors [`AutoencoderKLFlux2::new`] reads.
    pub fn manifest(config: &VaeConfig) -> WeightManifest {
        let latent = config.latent_channels;
        let mut m = WeightManifest::new("vae");
        Encoder::declare(&mut m, config);
        m.conv2d("quant_conv", 2 * latent, 2 * latent, 1);
        m.conv2d("post_quant_conv", latent, latent, 1);
        Decoder::declare(&mut m, config);
        m.push("bn.running_mean", &[config.patched_channels()]);
        m.push("bn.running_var", &[config.patched_channels()]);
        m
    }

    pub fn config(&self) -> &VaeConfig {
        &self.config
    }

    /// Image `[B, 3, H, W]` in [-1, 1] to the raw latent mean `[B, C, H/8, W/8]`.
    pub fn encode_raw(&self, xs: &Tensor) -> Result<Tensor> {
        let moments = xs.apply(&self.encoder)?.apply(&self.quant_conv)?;
        // Deterministic: take the posterior mean and drop the log-variance.
        moments.narrow(1, 0, self.config.latent_channels)
    }

    /// Raw latent `[B, C, H/8, W/8]` to an image in roughly [-1, 1].
    pub fn decode_raw(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.post_quant_conv)?.apply(&self.decoder)
    }

    /// Image to the normalized patchified latent `[B, 4C, H/16, W/16]`.
    pub fn encode(&self, xs: &Tensor) -> Result<Tensor> {
        self.bn.normalize(&patchify(&self.encode_raw(xs)?)?)
    }

    /// Normalized patchified latent back to an image.
    pub fn decode(&self, xs: &Tensor) -> Result<Tensor> {
        self.decode_raw(&unpatchify(&self.bn.denormalize(xs)?)?)
    }

    /// Encode a raster; gray and alpha inputs are converted to RGB first.
    ///
    /// Returns the normalized latent at 1/8 resolution, unpatchified.
    pub fn encode_image(&self, image: &RasterImage) -> crate::Result<LatentTensor> {
        let (w, h) = (image.width(), image.height());
        if w % IMAGE_DIM_MULTIPLE != 0 || h % IMAGE_DIM_MULTIPLE != 0 {
            return Err(FluxError::validation(format!(
                "image size {w}x{h} is not a multiple of {IMAGE_DIM_MULTIPLE}"
            )));
        }
        let latent = image
            .to_tensor(&self.device)
            .and_then(|t| self.encode(&t))
            .and_then(|z| unpatchify(&z))
            .stage(Stage::Vae)?;
        tracing::debug!("encoded {w}x{h} image to latent {:?}", latent.dims());
        LatentTensor::new(latent)
    }

    /// Decode a normalized latent `[C, H/8, W/8]` to an RGB raster.
    pub fn decode_latent(&self, latent: &LatentTensor) -> crate::Result<RasterImage> {
        if latent.channels() != self.config.latent_channels {
            return Err(FluxError::validation(format!(
                "latent has {} channels, the VAE expects {}",
                latent.channels(),
                self.config.latent_channels
            )));
        }
        if latent.height() % 2 != 0 || latent.width() % 2 != 0 {
            return Err(FluxError::validation(format!(
                "latent size {}x{} is not a whole number of 2x2 patches",
                latent.height(),
                latent.width()
            )));
        }
        let image = latent
            .batched()?
            .to_device(&self.device)
            .and_then(|z| z.to_dtype(DType::F32))
            .and_then(|z| patchify(&z))
            .and_then(|z| self.decode(&z))
            .and_then(|img| RasterImage::from_tensor(&img))
            .stage(Stage::Vae)?;
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn tiny_vae(device: &Device) -> Result<(AutoencoderKLFlux2, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let vae = AutoencoderKLFlux2::new(&VaeConfig::tiny(), vb)?;
        Ok((vae, varmap))
    }

    #[test]
    fn test_manifest_matches_constructor() -> Result<()> {
        let (_, varmap) = tiny_vae(&Device::Cpu)?;
        let manifest = AutoencoderKLFlux2::manifest(&VaeConfig::tiny());
        let data = varmap.data().lock().unwrap();
        assert_eq!(data.len(), manifest.len());
        for (name, shape) in manifest.entries() {
            let var = data.get(name).unwrap_or_else(|| panic!("{name} not created"));
            assert_eq!(var.dims(), shape.as_slice(), "{name}");
        }
        Ok(())
    }

    #[test]
    fn test_flux2_manifest() {
        let manifest = AutoencoderKLFlux2::manifest(&VaeConfig::flux2());
        let find = |name: &str| {
            manifest
                .entries()
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, s)| s.clone())
        };
        assert_eq!(find("bn.running_mean"), Some(vec![128]));
        assert_eq!(find("quant_conv.weight"), Some(vec![64, 64, 1, 1]));
        assert_eq!(find("encoder.down_blocks.1.resnets.0.conv_shortcut.weight"), Some(vec![256, 128, 1, 1]));
        assert_eq!(find("decoder.up_blocks.3.resnets.2.conv2.weight"), Some(vec![128, 128, 3, 3]));
        assert_eq!(find("encoder.down_blocks.3.downsamplers.0.conv.weight"), None);
        assert_eq!(find("decoder.up_blocks.3.upsamplers.0.conv.weight"), None);
        let params = manifest.num_parameters();
        assert!((70_000_000..100_000_000).contains(&params), "{params}");
    }

    #[test]
    fn test_encode_decode_shapes() -> Result<()> {
        let device = Device::Cpu;
        let (vae, _varmap) = tiny_vae(&device)?;
        let image = Tensor::randn(0f32, 0.5f32, (1, 3, 64, 32), &device)?;
        let z = vae.encode(&image)?;
        assert_eq!(z.dims(), &[1, 16, 4, 2]);
        let decoded = vae.decode(&z)?;
        assert_eq!(decoded.dims(), &[1, 3, 64, 32]);
        Ok(())
    }

    #[test]
    fn test_latent_norm() -> Result<()> {
        let device = Device::Cpu;
        let tensors = std::collections::HashMap::from([
            ("running_mean".to_string(), Tensor::new(&[1f32, -1.0], &device)?),
            ("running_var".to_string(), Tensor::new(&[4f32, 9.0], &device)?),
        ]);
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        let norm = LatentNorm::new(2, 0.0, vb)?;
        let z = Tensor::new(&[3f32, 2.0], &device)?.reshape((1, 2, 1, 1))?;
        let n = norm.normalize(&z)?;
        assert_eq!(n.flatten_all()?.to_vec1::<f32>()?, vec![1.0, 1.0]);
        let back = norm.denormalize(&n)?;
        assert_eq!(back.flatten_all()?.to_vec1::<f32>()?, vec![3.0, 2.0]);

        // Fresh statistics are the identity.
        let varmap = VarMap::new();
        let identity = LatentNorm::new(2, 0.0, VarBuilder::from_varmap(&varmap, DType::F32, &device))?;
        assert_eq!(identity.normalize(&z)?.flatten_all()?.to_vec1::<f32>()?, vec![3.0, 2.0]);
        Ok(())
    }

    #[test]
    fn test_encode_image_and_decode_latent() -> Result<()> {
        let device = Device::Cpu;
        let (vae, _varmap) = tiny_vae(&device)?;
        let gray = RasterImage::new(32, 16, 1, vec![200; 32 * 16]).unwrap();
        let latent = vae.encode_image(&gray).unwrap();
        assert_eq!((latent.channels(), latent.height(), latent.width()), (4, 2, 4));
        let image = vae.decode_latent(&latent).unwrap();
        assert_eq!((image.width(), image.height(), image.channels()), (32, 16, 3));

        let odd = RasterImage::new(24, 16, 3, vec![0; 24 * 16 * 3]).unwrap();
        assert!(matches!(vae.encode_image(&odd), Err(FluxError::Validation(_))));

        let unpaired = LatentTensor::new(Tensor::zeros((4, 3, 4), DType::F32, &device)?).unwrap();
        assert!(matches!(vae.decode_latent(&unpaired), Err(FluxError::Validation(_))));
        Ok(())
    }
}
