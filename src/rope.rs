//! Positional and timestep embeddings.
//!
//! FLUX.2 gives every token a 4-axis position id `(t, y, x, l)`:
//!
//! - image tokens: `(0, row, col, 0)` on the 2×2-patch grid
//! - text tokens: `(0, 0, 0, index)`
//!
//! Each axis owns a slice of the head dimension (`axes_dims_rope`, 32 each for
//! klein) and rotates adjacent pairs (interleaved RoPE, `rope_i`). The
//! per-axis cos/sin tables are concatenated so one `[seq, head_dim/2]` table
//! covers the joint `[txt, img]` sequence.
//!
//! The Qwen3 text encoder uses ordinary 1-D RoPE with the rotate-half layout;
//! [`rope_1d`] builds its tables.

use candle::{DType, Device, Result, Tensor, D};

/// Sinusoidal timestep embedding.
///
/// `timesteps` are flow times in [0, 1]; they are scaled by 1000 before the
/// sinusoid. Output is `cat(cos, sin)` of shape `[batch, embedding_dim]`.
pub fn timestep_embedding(timesteps: &Tensor, embedding_dim: usize, dtype: DType) -> Result<Tensor> {
    const SCALE: f64 = 1000.0;
    const MAX_PERIOD: f64 = 10000.0;

    if embedding_dim % 2 != 0 {
        candle::bail!("embedding_dim {embedding_dim} must be even");
    }
    let device = timesteps.device();
    let half_dim = embedding_dim / 2;

    let timesteps = (timesteps.to_dtype(DType::F32)? * SCALE)?;
    let exponent: Vec<f32> = (0..half_dim)
        .map(|i| (-(MAX_PERIOD.ln()) * i as f64 / half_dim as f64).exp() as f32)
        .collect();
    let freqs = Tensor::from_vec(exponent, (1, half_dim), device)?;

    let args = timesteps.unsqueeze(1)?.broadcast_mul(&freqs)?;
    Tensor::cat(&[args.cos()?, args.sin()?], D::Minus1)?.to_dtype(dtype)
}

/// Position ids `[h·w, 4]` for an image token grid, row-major.
pub fn image_ids(height: usize, width: usize, device: &Device) -> Result<Tensor> {
    let mut ids = Vec::with_capacity(height * width * 4);
    for y in 0..height {
        for x in 0..width {
            ids.extend_from_slice(&[0f32, y as f32, x as f32, 0f32]);
        }
    }
    Tensor::from_vec(ids, (height * width, 4), device)
}

/// Position ids `[len, 4]` for text tokens.
pub fn text_ids(len: usize, device: &Device) -> Result<Tensor> {
    let ids: Vec<f32> = (0..len)
        .flat_map(|i| [0f32, 0f32, 0f32, i as f32])
        .collect();
    Tensor::from_vec(ids, (len, 4), device)
}

fn inv_freq(dim: usize, theta: f64) -> Vec<f32> {
    (0..dim / 2)
        .map(|j| (1.0 / theta.powf(2.0 * j as f64 / dim as f64)) as f32)
        .collect()
}

/// Multi-axis rotary embedding.
#[derive(Debug, Clone)]
pub struct EmbedNd {
    theta: f64,
    axes_dim: Vec<usize>,
}

impl EmbedNd {
    pub fn new(theta: f64, axes_dim: Vec<usize>) -> Self {
        Self { theta, axes_dim }
    }

    pub fn head_dim(&self) -> usize {
        self.axes_dim.iter().sum()
    }

    /// Cos/sin tables `[seq, head_dim/2]` for position ids `[seq, n_axes]`.
    pub fn forward(&self, ids: &Tensor, dtype: DType) -> Result<(Tensor, Tensor)> {
        let (_seq, n_axes) = ids.dims2()?;
        if n_axes != self.axes_dim.len() {
            candle::bail!(
                "position ids have {n_axes} axes but rope is configured for {}",
                self.axes_dim.len()
            );
        }
        let ids = ids.to_dtype(DType::F32)?;
        let mut angles = Vec::with_capacity(n_axes);
        for (axis, &dim) in self.axes_dim.iter().enumerate() {
            let freqs = inv_freq(dim, self.theta);
            let freqs = Tensor::from_vec(freqs, (1, dim / 2), ids.device())?;
            let pos = ids.narrow(1, axis, 1)?;
            angles.push(pos.broadcast_mul(&freqs)?);
        }
        let angles = Tensor::cat(&angles, 1)?;
        let cos = angles.cos()?.to_dtype(dtype)?.contiguous()?;
        let sin = angles.sin()?.to_dtype(dtype)?.contiguous()?;
        Ok((cos, sin))
    }
}

/// Cos/sin tables `[seq, dim/2]` for positions `0..seq` (rotate-half layout).
pub fn rope_1d(seq: usize, dim: usize, theta: f64, device: &Device, dtype: DType) -> Result<(Tensor, Tensor)> {
    let freqs = Tensor::from_vec(inv_freq(dim, theta), (1, dim / 2), device)?;
    let positions = Tensor::arange(0u32, seq as u32, device)?
        .to_dtype(DType::F32)?
        .reshape((seq, 1))?;
    let angles = positions.broadcast_mul(&freqs)?;
    Ok((angles.cos()?.to_dtype(dtype)?, angles.sin()?.to_dtype(dtype)?))
}

/// Apply interleaved RoPE to `[batch, heads, seq, head_dim]`.
pub fn apply_rope_interleaved(xs: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    candle_nn::rotary_emb::rope_i(&xs.contiguous()?, cos, sin)
}
