//! FLUX.2-klein text-to-image inference on candle.
//!
//! FLUX.2-klein 4B is a rectified-flow latent diffusion model. A prompt is
//! encoded by a Qwen3 text encoder, a 5 + 20 block transformer predicts the
//! flow velocity for a latent on a 2×2-patch grid, and a KL autoencoder maps
//! latents to pixels.
//!
//! # Architecture
//!
//! ```text
//!                       ┌──────────────────────┐
//!  prompt ─ template ──>│ Qwen3 (27 of 36 lay.) │── hidden[9,18,27] ──> [512, 7680]
//!                       └──────────────────────┘                            │
//!                                                                           ▼
//!  seed ──> MT19937 noise [128, H/16, W/16] ──> ┌──────────────────────────────────────┐
//!                                               │ Flux2Transformer                      │
//!  (img2img) image ─> VAE encode ─> blend ────> │  5 double-stream blocks (txt | img)   │ × N Euler steps
//!                                               │ 20 single-stream blocks ([txt, img])  │
//!                                               └──────────────────────────────────────┘
//!                                                                           │
//!                                                     latent ──> VAE decode ──> RasterImage
//! ```
//!
//! # Example
//!
//! ```ignore
//! use flux_klein::{Context, GenerationParams, LoadOptions};
//!
//! let mut ctx = Context::load("FLUX.2-klein-4B", LoadOptions::cpu())?;
//! let params = GenerationParams { width: 512, height: 512, seed: 42, ..Default::default() };
//! let image = ctx.generate("a lighthouse at dusk", &params)?;
//! assert_eq!(image.width(), 512);
//! ```

pub mod blocks;
pub mod config;
pub mod error;
pub mod io;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod rng;
pub mod rope;
pub mod sampler;
pub mod scheduler;
pub mod tensor;
pub mod text_encoder;
pub mod utils;
pub mod vae;
pub mod weights;

pub use config::{
    GenerationParams, LoadOptions, SchedulerConfig, TextEncoderConfig, TransformerConfig, VaeConfig,
};
pub use error::{FluxError, LoadError, Result, Stage};
pub use model::Flux2Transformer;
pub use pipeline::Context;
pub use progress::{NoProgress, Phase, ProgressObserver, TracingProgress};
pub use rng::MtBoxMullerRng;
pub use sampler::{SamplerState, VelocityModel};
pub use tensor::{EmbeddingSequence, LatentTensor, RasterImage};
pub use text_encoder::TextEncoder;
pub use vae::AutoencoderKLFlux2;
pub use weights::{WeightManifest, WeightTable};
