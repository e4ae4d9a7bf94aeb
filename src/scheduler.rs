//! Rectified-flow Euler scheduler for FLUX.2-klein.
//!
//! The sample follows the straight-line path
//! ```text
//! x_sigma = (1 - sigma) * x_0 + sigma * noise
//! ```
//! and sigmas go from 1.0 (pure noise) to 0.0 (clean latent). The uniform grid
//! `1 - i/N` is warped by an exponential time shift whose strength `mu` comes
//! from an empirical fit over image size and step count, so larger images and
//! shorter schedules spend more of their steps at high noise.

use candle::{Result, Tensor};

use crate::config::SchedulerConfig;

/// Sequence length above which `mu` no longer depends on the step count.
const MU_SEQ_LEN_CUTOFF: usize = 4300;

/// Empirical shift parameter for a packed image sequence length and step count.
///
/// Two linear fits in `image_seq_len` (for 10 and 200 steps) are interpolated
/// linearly in `num_steps`.
pub fn empirical_mu(image_seq_len: usize, num_steps: usize) -> f64 {
    const A1: f64 = 8.73809524e-05;
    const B1: f64 = 1.89833333;
    const A2: f64 = 0.00016927;
    const B2: f64 = 0.45666666;

    let seq = image_seq_len as f64;
    if image_seq_len > MU_SEQ_LEN_CUTOFF {
        return A2 * seq + B2;
    }
    let m_200 = A2 * seq + B2;
    let m_10 = A1 * seq + B1;
    let a = (m_200 - m_10) / 190.0;
    let b = m_200 - 200.0 * a;
    a * num_steps as f64 + b
}

/// Exponential time shift `e^mu / (e^mu + (1/t - 1))`, fixed at the endpoints.
pub fn time_shift(mu: f64, t: f64) -> f64 {
    if t <= 0.0 {
        return 0.0;
    }
    if t >= 1.0 {
        return 1.0;
    }
    let exp_mu = mu.exp();
    exp_mu / (exp_mu + (1.0 / t - 1.0))
}

/// Number of leading steps skipped for an img2img `strength`.
pub fn start_index_for_strength(num_steps: usize, strength: f64) -> usize {
    let skipped = ((1.0 - strength) * num_steps as f64).round();
    (skipped.max(0.0) as usize).min(num_steps)
}

#[derive(Debug, Clone)]
pub struct FlowMatchEulerScheduler {
    num_train_timesteps: usize,
    use_dynamic_shifting: bool,
    shift: f64,

    /// N + 1 noise levels, the last one 0.0.
    sigmas: Vec<f64>,
    step_index: usize,
    begin_index: usize,
}

impl FlowMatchEulerScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            num_train_timesteps: config.num_train_timesteps,
            use_dynamic_shifting: config.use_dynamic_shifting,
            shift: config.shift,
            sigmas: Vec::new(),
            step_index: 0,
            begin_index: 0,
        }
    }

    /// Shift parameter used for this image size and step count.
    pub fn mu(&self, image_seq_len: usize, num_steps: usize) -> f64 {
        if self.use_dynamic_shifting {
            empirical_mu(image_seq_len, num_steps)
        } else {
            self.shift.ln()
        }
    }

    /// Build the schedule for `num_steps` steps over `image_seq_len` tokens.
    pub fn set_timesteps(&mut self, num_steps: usize, image_seq_len: usize) {
        let mu = self.mu(image_seq_len, num_steps);
        self.sigmas = (0..=num_steps)
            .map(|i| time_shift(mu, 1.0 - i as f64 / num_steps as f64))
            .collect();
        self.begin_index = 0;
        self.step_index = 0;
        tracing::debug!("schedule: {num_steps} steps, mu = {mu:.4}");
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    /// Sigmas scaled to the training timestep range (0..1000).
    pub fn timesteps(&self) -> Vec<f64> {
        self.sigmas
            .iter()
            .map(|s| s * self.num_train_timesteps as f64)
            .collect()
    }

    pub fn num_inference_steps(&self) -> usize {
        self.sigmas.len().saturating_sub(1)
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn begin_index(&self) -> usize {
        self.begin_index
    }

    /// Steps left between the current index and the end of the schedule.
    pub fn remaining_steps(&self) -> usize {
        self.num_inference_steps().saturating_sub(self.step_index)
    }

    /// Start denoising from `begin_index` (img2img).
    pub fn set_begin_index(&mut self, begin_index: usize) {
        let begin_index = begin_index.min(self.num_inference_steps());
        self.begin_index = begin_index;
        self.step_index = begin_index;
    }

    /// Noise level at the current step.
    pub fn current_sigma(&self) -> f64 {
        self.sigmas.get(self.step_index).copied().unwrap_or(0.0)
    }

    /// Euler step: `x + (sigma_next - sigma) * v`.
    pub fn step(&mut self, model_output: &Tensor, sample: &Tensor) -> Result<Tensor> {
        if self.step_index + 1 >= self.sigmas.len() {
            candle::bail!(
                "scheduler step {} is past the end of a {}-step schedule",
                self.step_index,
                self.num_inference_steps()
            );
        }
        let sigma = self.sigmas[self.step_index];
        let sigma_next = self.sigmas[self.step_index + 1];
        let dt = sigma_next - sigma;

        let prev_sample = (sample + (model_output * dt)?)?;
        self.step_index += 1;
        Ok(prev_sample)
    }

    /// `(1 - sigma) * sample + sigma * noise`
    pub fn scale_noise(&self, sample: &Tensor, noise: &Tensor, sigma: f64) -> Result<Tensor> {
        (sample * (1.0 - sigma))? + (noise * sigma)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device};

    #[test]
    fn test_empirical_mu() {
        // Above the cutoff only the 200-step fit is used.
        let mu = empirical_mu(5000, 4);
        assert!((mu - (0.00016927 * 5000.0 + 0.45666666)).abs() < 1e-9);

        // At 10 and 200 steps the interpolation reproduces each fit.
        let seq = 1024;
        let m_10 = 8.73809524e-05 * seq as f64 + 1.89833333;
        let m_200 = 0.00016927 * seq as f64 + 0.45666666;
        assert!((empirical_mu(seq, 10) - m_10).abs() < 1e-9);
        assert!((empirical_mu(seq, 200) - m_200).abs() < 1e-9);

        // Fewer steps shift harder.
        assert!(empirical_mu(seq, 4) > empirical_mu(seq, 50));
    }

    #[test]
    fn test_time_shift() {
        assert_eq!(time_shift(1.0, 0.0), 0.0);
        assert_eq!(time_shift(1.0, 1.0), 1.0);
        assert!((time_shift(0.0, 0.5) - 0.5).abs() < 1e-12);
        assert!(time_shift(1.0, 0.5) > 0.5);
    }

    #[test]
    fn test_sigmas_monotonic() {
        let mut scheduler = FlowMatchEulerScheduler::new(&SchedulerConfig::flux2());
        scheduler.set_timesteps(4, 1024);
        let sigmas = scheduler.sigmas();
        assert_eq!(sigmas.len(), 5);
        assert_eq!(sigmas[0], 1.0);
        assert_eq!(sigmas[4], 0.0);
        assert!(sigmas.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(scheduler.timesteps()[0], 1000.0);
    }

    #[test]
    fn test_static_shift() {
        let config = SchedulerConfig {
            use_dynamic_shifting: false,
            shift: 1.0,
            ..SchedulerConfig::flux2()
        };
        let mut scheduler = FlowMatchEulerScheduler::new(&config);
        // shift 1 => mu 0 => the plain linear grid.
        scheduler.set_timesteps(4, 1024);
        for (i, s) in scheduler.sigmas().iter().enumerate() {
            assert!((s - (1.0 - i as f64 / 4.0)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_start_index_for_strength() {
        assert_eq!(start_index_for_strength(4, 1.0), 0);
        assert_eq!(start_index_for_strength(4, 0.0), 4);
        assert_eq!(start_index_for_strength(4, 0.75), 1);
        assert_eq!(start_index_for_strength(4, 0.5), 2);
    }

    #[test]
    fn test_step_integrates_to_data() -> Result<()> {
        // With the exact velocity (noise - x0) the Euler steps land on x0.
        let device = Device::Cpu;
        let mut scheduler = FlowMatchEulerScheduler::new(&SchedulerConfig::flux2());
        scheduler.set_timesteps(3, 256);
        let x0 = Tensor::full(2f32, (1, 4), &device)?;
        let noise = Tensor::full(-1f32, (1, 4), &device)?;
        let velocity = (&noise - &x0)?;
        let mut x = noise.clone();
        while scheduler.remaining_steps() > 0 {
            x = scheduler.step(&velocity, &x)?;
        }
        let diff = (x - &x0)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        assert!(scheduler.step(&velocity, &x0).is_err());
        Ok(())
    }

    #[test]
    fn test_scale_noise_and_begin_index() -> Result<()> {
        let device = Device::Cpu;
        let mut scheduler = FlowMatchEulerScheduler::new(&SchedulerConfig::flux2());
        scheduler.set_timesteps(4, 256);
        scheduler.set_begin_index(2);
        assert_eq!(scheduler.remaining_steps(), 2);
        let sigma = scheduler.current_sigma();
        assert_eq!(sigma, scheduler.sigmas()[2]);

        let sample = Tensor::ones((1, 4), DType::F32, &device)?;
        let noise = Tensor::zeros((1, 4), DType::F32, &device)?;
        let noised = scheduler.scale_noise(&sample, &noise, sigma)?;
        let v = noised.flatten_all()?.to_vec1::<f32>()?;
        assert!(v.iter().all(|x| (x - (1.0 - sigma as f32)).abs() < 1e-6));

        scheduler.set_begin_index(9);
        assert_eq!(scheduler.remaining_steps(), 0);
        Ok(())
    }
}
