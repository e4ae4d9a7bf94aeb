//! Denoising loop.
//!
//! A [`Sampler`] run goes through
//! `Initializing -> Stepping(0..n) -> Finalizing -> Done`, and ends in
//! `Failed` if any stage errors. Each step issues one velocity prediction, or
//! two (conditioned and unconditioned) when classifier-free guidance is on:
//! ```text
//! v = v_uncond + scale * (v_cond - v_uncond)
//! ```
//! Latents are kept in the patchified `[1, 4C, H/16, W/16]` layout at the
//! boundary and as packed tokens `[1, H/16 · W/16, 4C]` during stepping.

use std::fmt;

use candle::{DType, Tensor};

use crate::config::SchedulerConfig;
use crate::error::{FluxError, Result, Stage, StageContext};
use crate::progress::ProgressObserver;
use crate::scheduler::{start_index_for_strength, FlowMatchEulerScheduler};
use crate::tensor::{pack_latents, unpack_latents};

/// A network predicting the flow velocity for packed latent tokens.
pub trait VelocityModel {
    /// Channels of one packed token.
    fn in_channels(&self) -> usize;

    /// Predict the velocity `[batch, h·w, in_channels]` (F32) for `tokens` on
    /// an `(h, w)` grid at flow time `timestep` in [0, 1].
    fn predict(
        &self,
        tokens: &Tensor,
        grid: (usize, usize),
        context: &Tensor,
        timestep: f64,
        guidance: f64,
        progress: &mut dyn ProgressObserver,
    ) -> candle::Result<Tensor>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SamplerState {
    Initializing,
    /// Running the given 0-based step of this run.
    Stepping(usize),
    Finalizing,
    Done,
    Failed(String),
}

impl fmt::Display for SamplerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplerState::Initializing => f.write_str("initializing"),
            SamplerState::Stepping(i) => write!(f, "stepping({i})"),
            SamplerState::Finalizing => f.write_str("finalizing"),
            SamplerState::Done => f.write_str("done"),
            SamplerState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Starting point of a run.
#[derive(Debug, Clone)]
pub enum InitialLatent {
    /// Text-to-image: start from pure noise.
    Noise(Tensor),
    /// Image-to-image: blend the encoded image with noise at the sigma where
    /// the shortened schedule begins.
    Blend {
        image: Tensor,
        noise: Tensor,
        strength: f64,
    },
}

impl InitialLatent {
    fn noise(&self) -> &Tensor {
        match self {
            InitialLatent::Noise(noise) => noise,
            InitialLatent::Blend { noise, .. } => noise,
        }
    }
}

/// Text conditioning, `[1, seq, dim]` each.
#[derive(Debug, Clone)]
pub struct Conditioning {
    pub cond: Tensor,
    /// Present iff classifier-free guidance runs.
    pub uncond: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub struct SamplerOptions {
    pub num_steps: usize,
    pub guidance_scale: f64,
}

#[derive(Debug)]
pub struct Sampler {
    scheduler: FlowMatchEulerScheduler,
    state: SamplerState,
}

impl Sampler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            scheduler: FlowMatchEulerScheduler::new(config),
            state: SamplerState::Initializing,
        }
    }

    pub fn state(&self) -> &SamplerState {
        &self.state
    }

    pub fn scheduler(&self) -> &FlowMatchEulerScheduler {
        &self.scheduler
    }

    /// Run the full loop and return the final patchified latent `[1, 4C, h, w]` (F32).
    pub fn run(
        &mut self,
        model: &dyn VelocityModel,
        init: InitialLatent,
        conditioning: &Conditioning,
        options: &SamplerOptions,
        progress: &mut dyn ProgressObserver,
    ) -> Result<Tensor> {
        self.state = SamplerState::Initializing;
        match self.run_inner(model, init, conditioning, options, progress) {
            Ok(latent) => {
                self.state = SamplerState::Done;
                Ok(latent)
            }
            Err(e) => {
                self.state = SamplerState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    fn run_inner(
        &mut self,
        model: &dyn VelocityModel,
        init: InitialLatent,
        conditioning: &Conditioning,
        options: &SamplerOptions,
        progress: &mut dyn ProgressObserver,
    ) -> Result<Tensor> {
        let (_, channels, h, w) = init.noise().dims4().stage(Stage::Sampler)?;
        if channels != model.in_channels() {
            return Err(FluxError::validation(format!(
                "latent has {channels} channels but the model expects {}",
                model.in_channels()
            )));
        }

        self.scheduler.set_timesteps(options.num_steps, h * w);
        let latent = match init {
            InitialLatent::Noise(noise) => noise,
            InitialLatent::Blend {
                image,
                noise,
                strength,
            } => {
                if image.dims() != noise.dims() {
                    return Err(FluxError::validation(format!(
                        "image latent {:?} and noise {:?} differ in shape",
                        image.dims(),
                        noise.dims()
                    )));
                }
                self.scheduler
                    .set_begin_index(start_index_for_strength(options.num_steps, strength));
                let sigma = self.scheduler.current_sigma();
                tracing::debug!(
                    "img2img: strength {strength}, starting at step {} (sigma {sigma:.4})",
                    self.scheduler.begin_index()
                );
                self.scheduler
                    .scale_noise(&image, &noise, sigma)
                    .stage(Stage::Sampler)?
            }
        };
        let mut tokens = latent
            .to_dtype(DType::F32)
            .and_then(|l| pack_latents(&l))
            .stage(Stage::Sampler)?;

        let cfg = conditioning
            .uncond
            .as_ref()
            .filter(|_| options.guidance_scale != 1.0);
        let steps_to_run = self.scheduler.remaining_steps();
        for i in 0..steps_to_run {
            self.state = SamplerState::Stepping(i);
            progress.step(i + 1, steps_to_run);

            let sigma = self.scheduler.current_sigma();
            let cond = model
                .predict(&tokens, (h, w), &conditioning.cond, sigma, options.guidance_scale, progress)
                .stage(Stage::Transformer)?;
            let velocity = match cfg {
                Some(uncond) => {
                    let uncond = model
                        .predict(&tokens, (h, w), uncond, sigma, options.guidance_scale, progress)
                        .stage(Stage::Transformer)?;
                    guided_velocity(&cond, &uncond, options.guidance_scale).stage(Stage::Sampler)?
                }
                None => cond,
            };
            tokens = self.scheduler.step(&velocity, &tokens).stage(Stage::Sampler)?;
        }

        self.state = SamplerState::Finalizing;
        unpack_latents(&tokens, h, w).stage(Stage::Sampler)
    }
}

/// `uncond + scale * (cond - uncond)`
pub fn guided_velocity(cond: &Tensor, uncond: &Tensor, scale: f64) -> candle::Result<Tensor> {
    uncond + ((cond - uncond)? * scale)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::tests::{Event, Recorder};
    use crate::progress::NoProgress;
    use candle::Device;
    use std::cell::RefCell;

    /// Predicts the exact velocity towards a fixed target, shifted by the
    /// context's mean so conditioned and unconditioned passes differ.
    struct TowardsTarget {
        target: Tensor,
        channels: usize,
        calls: RefCell<Vec<f64>>,
        fail_at: Option<usize>,
    }

    impl TowardsTarget {
        fn new(target: Tensor) -> candle::Result<Self> {
            let channels = target.dim(2)?;
            Ok(Self {
                target,
                channels,
                calls: RefCell::new(Vec::new()),
                fail_at: None,
            })
        }
    }

    impl VelocityModel for TowardsTarget {
        fn in_channels(&self) -> usize {
            self.channels
        }

        fn predict(
            &self,
            tokens: &Tensor,
            _grid: (usize, usize),
            context: &Tensor,
            timestep: f64,
            _guidance: f64,
            _progress: &mut dyn ProgressObserver,
        ) -> candle::Result<Tensor> {
            let mut calls = self.calls.borrow_mut();
            if self.fail_at == Some(calls.len()) {
                candle::bail!("injected failure");
            }
            calls.push(timestep);
            // x_sigma = (1 - sigma) x0 + sigma n  =>  v = n - x0 = (x - x0) / sigma
            let offset = context.mean_all()?.to_scalar::<f32>()? as f64;
            (((tokens - &self.target)? / timestep)? + offset)
        }
    }

    fn setup(device: &Device) -> candle::Result<(Tensor, Tensor, Conditioning)> {
        let noise = Tensor::randn(0f32, 1f32, (1, 8, 2, 2), device)?;
        let target = Tensor::full(0.5f32, (1, 8, 2, 2), device)?;
        let conditioning = Conditioning {
            cond: Tensor::zeros((1, 3, 4), DType::F32, device)?,
            uncond: Some(Tensor::ones((1, 3, 4), DType::F32, device)?),
        };
        Ok((noise, target, conditioning))
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> candle::Result<f32> {
        (a - b)?.abs()?.max_all()?.to_scalar::<f32>()
    }

    #[test]
    fn test_text_to_image_reaches_target() -> candle::Result<()> {
        let device = Device::Cpu;
        let (noise, target, conditioning) = setup(&device)?;
        let model = TowardsTarget::new(pack_latents(&target)?)?;
        let mut sampler = Sampler::new(&SchedulerConfig::flux2());
        let mut recorder = Recorder::default();
        let options = SamplerOptions {
            num_steps: 4,
            guidance_scale: 1.0,
        };
        let out = sampler
            .run(&model, InitialLatent::Noise(noise), &conditioning, &options, &mut recorder)
            .unwrap();
        assert_eq!(out.dims(), &[1, 8, 2, 2]);
        assert!(max_diff(&out, &target)? < 1e-4);
        assert_eq!(sampler.state(), &SamplerState::Done);

        // No CFG at scale 1: one call per step, at decreasing sigmas.
        let calls = model.calls.borrow();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0], 1.0);
        assert!(calls.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(
            recorder.events,
            (1..=4).map(|i| Event::Step(i, 4)).collect::<Vec<_>>()
        );
        Ok(())
    }

    #[test]
    fn test_cfg_doubles_calls() -> candle::Result<()> {
        let device = Device::Cpu;
        let (noise, target, conditioning) = setup(&device)?;
        let model = TowardsTarget::new(pack_latents(&target)?)?;
        let mut sampler = Sampler::new(&SchedulerConfig::flux2());
        let options = SamplerOptions {
            num_steps: 3,
            guidance_scale: 4.0,
        };
        sampler
            .run(&model, InitialLatent::Noise(noise), &conditioning, &options, &mut NoProgress)
            .unwrap();
        assert_eq!(model.calls.borrow().len(), 6);
        Ok(())
    }

    #[test]
    fn test_guided_velocity() -> candle::Result<()> {
        let device = Device::Cpu;
        let cond = Tensor::full(3f32, 2, &device)?;
        let uncond = Tensor::full(1f32, 2, &device)?;
        let v = guided_velocity(&cond, &uncond, 2.5)?.to_vec1::<f32>()?;
        assert_eq!(v, vec![6.0, 6.0]);
        Ok(())
    }

    #[test]
    fn test_strength_boundaries() -> candle::Result<()> {
        let device = Device::Cpu;
        let (noise, target, conditioning) = setup(&device)?;
        let image = Tensor::full(-0.25f32, (1, 8, 2, 2), &device)?;
        let options = SamplerOptions {
            num_steps: 4,
            guidance_scale: 1.0,
        };

        // strength 0: no steps, the encoded image comes back unchanged.
        let model = TowardsTarget::new(pack_latents(&target)?)?;
        let mut sampler = Sampler::new(&SchedulerConfig::flux2());
        let mut recorder = Recorder::default();
        let init = InitialLatent::Blend {
            image: image.clone(),
            noise: noise.clone(),
            strength: 0.0,
        };
        let out = sampler.run(&model, init, &conditioning, &options, &mut recorder).unwrap();
        assert!(max_diff(&out, &image)? < 1e-6);
        assert!(model.calls.borrow().is_empty());
        assert!(recorder.events.is_empty());

        // strength 0.5: half the schedule, starting mid-way.
        let model = TowardsTarget::new(pack_latents(&target)?)?;
        let init = InitialLatent::Blend {
            image: image.clone(),
            noise: noise.clone(),
            strength: 0.5,
        };
        sampler.run(&model, init, &conditioning, &options, &mut NoProgress).unwrap();
        let calls = model.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], sampler.scheduler().sigmas()[2]);

        // strength 1: identical to text-to-image from the same noise.
        let model = TowardsTarget::new(pack_latents(&target)?)?;
        let init = InitialLatent::Blend {
            image,
            noise: noise.clone(),
            strength: 1.0,
        };
        let blended = sampler.run(&model, init, &conditioning, &options, &mut NoProgress).unwrap();
        let model = TowardsTarget::new(pack_latents(&target)?)?;
        let plain = sampler
            .run(&model, InitialLatent::Noise(noise), &conditioning, &options, &mut NoProgress)
            .unwrap();
        assert!(max_diff(&blended, &plain)? < 1e-6);
        Ok(())
    }

    #[test]
    fn test_failure_state() -> candle::Result<()> {
        let device = Device::Cpu;
        let (noise, target, conditioning) = setup(&device)?;
        let mut model = TowardsTarget::new(pack_latents(&target)?)?;
        model.fail_at = Some(1);
        let mut sampler = Sampler::new(&SchedulerConfig::flux2());
        let options = SamplerOptions {
            num_steps: 4,
            guidance_scale: 1.0,
        };
        let err = sampler
            .run(&model, InitialLatent::Noise(noise), &conditioning, &options, &mut NoProgress)
            .unwrap_err();
        assert!(matches!(
            err,
            FluxError::Numeric {
                stage: Stage::Transformer,
                ..
            }
        ));
        assert!(matches!(sampler.state(), SamplerState::Failed(reason) if reason.contains("injected")));
        Ok(())
    }

    #[test]
    fn test_channel_mismatch() -> candle::Result<()> {
        let device = Device::Cpu;
        let (_, target, conditioning) = setup(&device)?;
        let model = TowardsTarget::new(pack_latents(&target)?)?;
        let mut sampler = Sampler::new(&SchedulerConfig::flux2());
        let noise = Tensor::zeros((1, 4, 2, 2), DType::F32, &device)?;
        let options = SamplerOptions {
            num_steps: 1,
            guidance_scale: 1.0,
        };
        let err = sampler
            .run(&model, InitialLatent::Noise(noise), &conditioning, &options, &mut NoProgress)
            .unwrap_err();
        assert!(matches!(err, FluxError::Validation(_)));
        Ok(())
    }
}
