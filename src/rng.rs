//! Seeded Gaussian noise matching `torch.randn` on CPU.
//!
//! FLUX.2 reference pipelines draw their initial latents with PyTorch's CPU
//! generator, so a given seed only reproduces a reference image if the same
//! MT19937 stream and Box-Muller variant are used here.
//!
//! # Two Paths
//!
//! - **Scalar (count < 16)**: 53-bit double uniforms, one cached value per pair.
//! - **Vectorized (count >= 16)**: 24-bit float uniforms transformed in blocks
//!   of 16; a trailing partial block is handled by regenerating the last 16
//!   values, as `normal_fill` does.

use candle::{DType, Device, Tensor};
use rand_mt::Mt;

/// MT19937 + Box-Muller normal sampler.
#[derive(Debug, Clone)]
pub struct MtBoxMullerRng {
    rng: Mt,
    /// Second value of the last scalar Box-Muller pair.
    cached_value: Option<f32>,
}

impl MtBoxMullerRng {
    /// PyTorch seeds MT19937 with the low 32 bits of the seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mt::new(seed as u32),
            cached_value: None,
        }
    }

    #[inline]
    fn uniform_double(lo: u32, hi: u32) -> f64 {
        const MASK_53BIT: u64 = 0x001F_FFFF_FFFF_FFFF;
        const DIVISOR: f64 = 9_007_199_254_740_992.0; // 2^53
        let combined = ((lo as u64) << 32) | (hi as u64);
        (combined & MASK_53BIT) as f64 / DIVISOR
    }

    #[inline]
    fn uniform_float(val: u32) -> f32 {
        const MASK_24BIT: u32 = 0x00FF_FFFF;
        const DIVISOR: f32 = 16_777_216.0; // 2^24
        (val & MASK_24BIT) as f32 / DIVISOR
    }

    /// One N(0, 1) sample through the scalar path.
    pub fn sample_scalar(&mut self) -> f32 {
        if let Some(cached) = self.cached_value.take() {
            return cached;
        }
        let u1 = Self::uniform_double(self.rng.next_u32(), self.rng.next_u32());
        let u2 = Self::uniform_double(self.rng.next_u32(), self.rng.next_u32());

        // log(1 - u2) keeps the argument away from zero.
        let r = (-2.0_f64 * (1.0_f64 - u2).ln()).sqrt();
        let theta = 2.0_f64 * std::f64::consts::PI * u1;

        self.cached_value = Some((r * theta.sin()) as f32);
        (r * theta.cos()) as f32
    }

    /// Box-Muller over a block of 16 uniforms: cosines land in the first
    /// eight slots, sines in the last eight.
    fn normal_fill_16(block: &mut [f32]) {
        for j in 0..8 {
            let u1 = 1.0_f32 - block[j];
            let u2 = block[j + 8];
            let r = (-2.0_f32 * u1.ln()).sqrt();
            let theta = 2.0_f32 * std::f32::consts::PI * u2;
            block[j] = r * theta.cos();
            block[j + 8] = r * theta.sin();
        }
    }

    fn sample_vectorized(&mut self, count: usize) -> Vec<f32> {
        let mut data: Vec<f32> = (0..count)
            .map(|_| Self::uniform_float(self.rng.next_u32()))
            .collect();
        for start in (0..count - 15).step_by(16) {
            Self::normal_fill_16(&mut data[start..start + 16]);
        }
        if count % 16 != 0 {
            let tail = count - 16;
            for value in data[tail..].iter_mut() {
                *value = Self::uniform_float(self.rng.next_u32());
            }
            Self::normal_fill_16(&mut data[tail..]);
        }
        data
    }

    /// `count` standard normal samples.
    pub fn randn_vec(&mut self, count: usize) -> Vec<f32> {
        if count >= 16 {
            self.sample_vectorized(count)
        } else {
            (0..count).map(|_| self.sample_scalar()).collect()
        }
    }

    /// A tensor of standard normal samples, generated on the CPU then moved.
    pub fn randn(&mut self, shape: &[usize], device: &Device, dtype: DType) -> candle::Result<Tensor> {
        let elem_count: usize = shape.iter().product();
        let data = self.randn_vec(elem_count);
        Tensor::from_vec(data, shape, &Device::Cpu)?
            .to_device(device)?
            .to_dtype(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_determinism() {
        let mut rng1 = MtBoxMullerRng::new(42);
        let mut rng2 = MtBoxMullerRng::new(42);
        assert_eq!(rng1.randn_vec(100), rng2.randn_vec(100));

        let mut rng3 = MtBoxMullerRng::new(43);
        let mut rng1 = MtBoxMullerRng::new(42);
        assert_ne!(rng1.randn_vec(32), rng3.randn_vec(32));
    }

    #[test]
    fn test_scalar_path_caches_pairs() {
        let mut rng = MtBoxMullerRng::new(7);
        let _ = rng.sample_scalar();
        assert!(rng.cached_value.is_some());
        let _ = rng.sample_scalar();
        assert!(rng.cached_value.is_none());
    }

    #[test]
    fn test_torch_parity_vectorized_seed_42() {
        // torch.manual_seed(42); torch.randn(16)[:8]
        let expected = [
            1.926_915_f32,
            1.487_284_2,
            0.900_717_2,
            -2.105_521_4,
            0.678_418_46,
            -1.234_545,
            -0.043_067_48,
            -1.604_667,
        ];
        let mut rng = MtBoxMullerRng::new(42);
        let values = rng.randn_vec(16);
        for (i, (got, want)) in values.iter().zip(expected.iter()).enumerate() {
            assert!((got - want).abs() < 1e-5, "index {i}: {got} vs {want}");
        }
    }

    #[test]
    fn test_partial_tail_block() {
        let values = MtBoxMullerRng::new(0).randn_vec(37);
        assert_eq!(values.len(), 37);
        assert!(values.iter().all(|v| v.is_finite()));
        // The first full block is unaffected by the tail handling.
        let head = MtBoxMullerRng::new(0).randn_vec(32);
        assert_eq!(&values[..16], &head[..16]);
    }

    #[test]
    fn test_randn_tensor() -> candle::Result<()> {
        let mut rng = MtBoxMullerRng::new(42);
        let tensor = rng.randn(&[2, 3, 4], &Device::Cpu, DType::F32)?;
        assert_eq!(tensor.dims(), &[2, 3, 4]);
        Ok(())
    }
}
