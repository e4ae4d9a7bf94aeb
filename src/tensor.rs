//! Typed buffers exchanged between pipeline stages.
//!
//! The numeric heavy lifting happens on [`candle::Tensor`]; these wrappers pin
//! down the shape each stage boundary expects:
//!
//! - [`EmbeddingSequence`]: `[seq_len, embedding_dim]` text conditioning
//! - [`LatentTensor`]: `[channels, H/8, W/8]` normalized latent
//! - [`RasterImage`]: interleaved 8-bit pixels
//!
//! It also holds the 2×2 patchify and token packing used between the VAE
//! latent grid and the transformer's token sequence.

use candle::{DType, Device, Tensor};
use image::imageops::FilterType;

use crate::error::{FluxError, Result, Stage, StageContext};

/// Text conditioning, one row per token.
#[derive(Debug, Clone)]
pub struct EmbeddingSequence {
    tensor: Tensor,
}

impl EmbeddingSequence {
    /// Wrap a `[seq_len, dim]` tensor.
    pub fn new(tensor: Tensor) -> Result<Self> {
        if tensor.rank() != 2 {
            return Err(FluxError::encoding(format!(
                "embeddings must be [seq_len, dim], got {:?}",
                tensor.dims()
            )));
        }
        Ok(Self { tensor })
    }

    /// Build from a flat row-major buffer of `seq_len × dim` floats.
    pub fn from_f32(data: &[f32], seq_len: usize, dim: usize, device: &Device) -> Result<Self> {
        if seq_len == 0 {
            return Err(FluxError::validation("embedding sequence is empty"));
        }
        let expected = seq_len.checked_mul(dim).ok_or_else(|| {
            FluxError::validation(format!("embedding size {seq_len} x {dim} overflows"))
        })?;
        if data.len() != expected {
            return Err(FluxError::validation(format!(
                "embedding buffer holds {} floats, expected {seq_len} x {dim} = {expected}",
                data.len()
            )));
        }
        let tensor = Tensor::from_slice(data, (seq_len, dim), device).stage(Stage::TextEncoder)?;
        Ok(Self { tensor })
    }

    pub fn seq_len(&self) -> usize {
        self.tensor.dims()[0]
    }

    pub fn dim(&self) -> usize {
        self.tensor.dims()[1]
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// Fail unless the embedding width is exactly `expected`.
    pub fn check_dim(&self, expected: usize) -> Result<()> {
        if self.dim() != expected {
            return Err(FluxError::encoding(format!(
                "embedding dimension {} does not match the transformer's {expected}",
                self.dim()
            )));
        }
        Ok(())
    }

    /// Row-major f32 copy, e.g. for writing an embeddings file.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        self.tensor
            .to_dtype(DType::F32)
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<f32>())
            .stage(Stage::TextEncoder)
    }
}

/// A normalized latent image `[channels, height, width]` at 1/8 resolution.
#[derive(Debug, Clone)]
pub struct LatentTensor {
    tensor: Tensor,
}

impl LatentTensor {
    pub fn new(tensor: Tensor) -> Result<Self> {
        let tensor = match tensor.rank() {
            3 => tensor,
            4 if tensor.dims()[0] == 1 => tensor.squeeze(0).stage(Stage::Vae)?,
            _ => {
                return Err(FluxError::validation(format!(
                    "latent must be [channels, height, width], got {:?}",
                    tensor.dims()
                )))
            }
        };
        Ok(Self { tensor })
    }

    pub fn channels(&self) -> usize {
        self.tensor.dims()[0]
    }

    pub fn height(&self) -> usize {
        self.tensor.dims()[1]
    }

    pub fn width(&self) -> usize {
        self.tensor.dims()[2]
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// Batched view `[1, channels, height, width]`.
    pub fn batched(&self) -> Result<Tensor> {
        self.tensor.unsqueeze(0).stage(Stage::Vae)
    }
}

/// An 8-bit raster, `channels` interleaved values per pixel in row-major order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    width: usize,
    height: usize,
    channels: usize,
    data: Vec<u8>,
}

impl RasterImage {
    /// Gray (1), RGB (3) and RGBA (4) layouts are accepted.
    pub fn new(width: usize, height: usize, channels: usize, data: Vec<u8>) -> Result<Self> {
        if !matches!(channels, 1 | 3 | 4) {
            return Err(FluxError::validation(format!(
                "unsupported channel count {channels}"
            )));
        }
        let expected = width.checked_mul(height).and_then(|n| n.checked_mul(channels));
        if width == 0 || height == 0 || expected != Some(data.len()) {
            return Err(FluxError::validation(format!(
                "pixel buffer of {} bytes does not match {width}x{height}x{channels}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Convert to 3-channel RGB; gray is replicated, alpha is dropped.
    pub fn to_rgb(&self) -> RasterImage {
        let data = match self.channels {
            3 => self.data.clone(),
            1 => self.data.iter().flat_map(|&v| [v, v, v]).collect(),
            _ => self
                .data
                .chunks_exact(self.channels)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect(),
        };
        RasterImage {
            width: self.width,
            height: self.height,
            channels: 3,
            data,
        }
    }

    /// Lanczos3 resize to exactly `width × height` (RGB output).
    pub fn resize(&self, width: usize, height: usize) -> Result<RasterImage> {
        let rgb = self.to_rgb();
        if rgb.width == width && rgb.height == height {
            return Ok(rgb);
        }
        let buffer = image::RgbImage::from_raw(rgb.width as u32, rgb.height as u32, rgb.data)
            .ok_or_else(|| FluxError::validation("pixel buffer too small for its dimensions"))?;
        let resized =
            image::imageops::resize(&buffer, width as u32, height as u32, FilterType::Lanczos3);
        RasterImage::new(width, height, 3, resized.into_raw())
    }

    /// Convert to a `[1, 3, H, W]` f32 tensor with values in [-1, 1].
    pub fn to_tensor(&self, device: &Device) -> candle::Result<Tensor> {
        let rgb = self.to_rgb();
        let (h, w) = (rgb.height, rgb.width);
        let mut data = Vec::with_capacity(3 * h * w);
        for c in 0..3 {
            for y in 0..h {
                for x in 0..w {
                    let value = rgb.data[(y * w + x) * 3 + c] as f32 / 127.5 - 1.0;
                    data.push(value);
                }
            }
        }
        Tensor::from_vec(data, (1, 3, h, w), device)
    }

    /// Convert a `[1, 3, H, W]` or `[3, H, W]` tensor in [-1, 1] back to pixels.
    pub fn from_tensor(tensor: &Tensor) -> candle::Result<RasterImage> {
        let tensor = if tensor.rank() == 4 {
            tensor.squeeze(0)?
        } else {
            tensor.clone()
        };
        let (c, h, w) = tensor.dims3()?;
        let pixels = ((tensor.to_dtype(DType::F32)? + 1.0)? * 127.5)?
            .clamp(0f32, 255f32)?
            .round()?
            .permute((1, 2, 0))?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let data = pixels.into_iter().map(|v| v as u8).collect();
        Ok(RasterImage {
            width: w,
            height: h,
            channels: c,
            data,
        })
    }
}

/// 2×2 patchify: `[B, C, H, W]` → `[B, C·4, H/2, W/2]`.
///
/// Patch channel `c·4 + dy·2 + dx` holds pixel `(2y + dy, 2x + dx)` of channel `c`.
pub fn patchify(latents: &Tensor) -> candle::Result<Tensor> {
    let (b, c, h, w) = latents.dims4()?;
    if h % 2 != 0 || w % 2 != 0 {
        candle::bail!("latent grid {h}x{w} is not divisible by the 2x2 patch size");
    }
    latents
        .reshape((b, c, h / 2, 2, w / 2, 2))?
        .permute((0, 1, 3, 5, 2, 4))?
        .reshape((b, c * 4, h / 2, w / 2))
}

/// Inverse of [`patchify`].
pub fn unpatchify(patched: &Tensor) -> candle::Result<Tensor> {
    let (b, c4, h, w) = patched.dims4()?;
    if c4 % 4 != 0 {
        candle::bail!("patched channel count {c4} is not divisible by 4");
    }
    let c = c4 / 4;
    patched
        .reshape((b, c, 2, 2, h, w))?
        .permute((0, 1, 4, 2, 5, 3))?
        .reshape((b, c, h * 2, w * 2))
}

/// Pack a patchified grid into tokens: `[B, C, H, W]` → `[B, H·W, C]`.
pub fn pack_latents(patched: &Tensor) -> candle::Result<Tensor> {
    let (b, c, h, w) = patched.dims4()?;
    patched.reshape((b, c, h * w))?.transpose(1, 2)?.contiguous()
}

/// Inverse of [`pack_latents`].
pub fn unpack_latents(tokens: &Tensor, height: usize, width: usize) -> candle::Result<Tensor> {
    let (b, seq, c) = tokens.dims3()?;
    if seq != height * width {
        candle::bail!("cannot unpack {seq} tokens into a {height}x{width} grid");
    }
    tokens
        .transpose(1, 2)?
        .contiguous()?
        .reshape((b, c, height, width))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patchify_layout() -> candle::Result<()> {
        let device = Device::Cpu;
        // One channel, 2x4 grid: values are their own flat index.
        let x = Tensor::arange(0f32, 8f32, &device)?.reshape((1, 1, 2, 4))?;
        let p = patchify(&x)?;
        assert_eq!(p.dims(), &[1, 4, 1, 2]);
        // Patch channel dy*2 + dx at patch column 1 holds pixel (dy, 2 + dx).
        let v = p.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(v, vec![0., 2., 1., 3., 4., 6., 5., 7.]);
        let back = unpatchify(&p)?;
        assert_eq!(back.flatten_all()?.to_vec1::<f32>()?, x.flatten_all()?.to_vec1::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_pack_unpack_tokens() -> candle::Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1f32, (1, 8, 3, 5), &device)?;
        let tokens = pack_latents(&x)?;
        assert_eq!(tokens.dims(), &[1, 15, 8]);
        // Token (y, x) carries every channel of that grid cell.
        let cell = x.narrow(2, 1, 1)?.narrow(3, 2, 1)?.flatten_all()?.to_vec1::<f32>()?;
        let token = tokens.get(0)?.get(5 + 2)?.to_vec1::<f32>()?;
        assert_eq!(cell, token);
        let back = unpack_latents(&tokens, 3, 5)?;
        let diff = (back - &x)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        assert!(unpack_latents(&tokens, 4, 4).is_err());
        Ok(())
    }

    #[test]
    fn test_raster_tensor_conversion() -> candle::Result<()> {
        let data: Vec<u8> = (0..48).map(|v| (v * 5) as u8).collect();
        let image = RasterImage::new(4, 4, 3, data.clone()).unwrap();
        let tensor = image.to_tensor(&Device::Cpu)?;
        assert_eq!(tensor.dims(), &[1, 3, 4, 4]);
        let first = tensor.flatten_all()?.to_vec1::<f32>()?[0];
        assert!((first + 1.0).abs() < 1e-6); // 0 -> -1.0
        let back = RasterImage::from_tensor(&tensor)?;
        assert_eq!(back.data(), &data[..]);
        Ok(())
    }

    #[test]
    fn test_raster_rejects_bad_buffers() {
        assert!(RasterImage::new(2, 2, 3, vec![0; 11]).is_err());
        assert!(RasterImage::new(2, 2, 2, vec![0; 8]).is_err());
        assert!(RasterImage::new(0, 2, 3, vec![]).is_err());
    }

    #[test]
    fn test_raster_size_overflow() {
        let err = RasterImage::new(usize::MAX / 2 + 1, 2, 3, vec![]).unwrap_err();
        assert!(matches!(err, FluxError::Validation(_)), "{err}");
        assert!(matches!(
            RasterImage::new(2, usize::MAX / 4, 3, vec![0; 12]),
            Err(FluxError::Validation(_))
        ));
    }

    #[test]
    fn test_raster_channel_conversion_and_resize() {
        let gray = RasterImage::new(2, 1, 1, vec![10, 200]).unwrap();
        assert_eq!(gray.to_rgb().data(), &[10, 10, 10, 200, 200, 200]);
        let rgba = RasterImage::new(1, 1, 4, vec![1, 2, 3, 4]).unwrap();
        assert_eq!(rgba.to_rgb().data(), &[1, 2, 3]);

        let flat = RasterImage::new(8, 8, 3, vec![128; 192]).unwrap();
        let resized = flat.resize(16, 4).unwrap();
        assert_eq!((resized.width(), resized.height(), resized.channels()), (16, 4, 3));
        assert!(resized.data().iter().all(|&v| (v as i32 - 128).abs() <= 1));
    }

    #[test]
    fn test_embedding_sequence_checks() {
        let device = Device::Cpu;
        let emb = EmbeddingSequence::from_f32(&[0.0; 12], 3, 4, &device).unwrap();
        assert_eq!((emb.seq_len(), emb.dim()), (3, 4));
        assert!(emb.check_dim(4).is_ok());
        assert!(matches!(emb.check_dim(7680), Err(FluxError::Encoding(_))));
        assert!(EmbeddingSequence::from_f32(&[0.0; 10], 3, 4, &device).is_err());
        assert!(EmbeddingSequence::from_f32(&[], 0, 4, &device).is_err());
        assert!(matches!(
            EmbeddingSequence::from_f32(&[0.0; 4], usize::MAX / 2 + 1, 4, &device),
            Err(FluxError::Validation(_))
        ));
    }
}
