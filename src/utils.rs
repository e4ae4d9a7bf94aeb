//! Host-side helpers: tracing setup and device selection.

use candle::{Device, Result};
use tracing_chrome::ChromeLayerBuilder;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Install a `tracing` subscriber.
///
/// Log lines go to stderr, filtered by `RUST_LOG` (default `info`). With
/// `chrome` set, a Chrome trace file is also written; keep the returned guard
/// alive until the end of the run so the file is flushed. Calling this twice
/// leaves the first subscriber in place.
pub fn setup_tracing(chrome: bool) -> Option<tracing_chrome::FlushGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter).with(fmt);
    if chrome {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        registry.with(chrome_layer).try_init().ok()?;
        Some(guard)
    } else {
        let _ = registry.try_init();
        None
    }
}

/// Pick CUDA, then Metal, then the CPU.
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    if candle::utils::cuda_is_available() {
        Device::new_cuda(0)
    } else if candle::utils::metal_is_available() {
        Device::new_metal(0)
    } else {
        tracing::info!("running on CPU, build with `--features cuda` or `--features metal` for GPU");
        Ok(Device::Cpu)
    }
}
