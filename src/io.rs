//! Raw little-endian `f32` buffers on disk.
//!
//! Embeddings are stored row-major as `seq_len × dim` floats with no header;
//! the sequence length is inferred from the file size. Noise files hold the
//! patchified initial latent in the same headerless form.

use std::fs;
use std::path::Path;

use crate::error::{FluxError, Result};

const F32_BYTES: usize = std::mem::size_of::<f32>();

fn decode_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(F32_BYTES)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Read an embeddings file, returning the flat data and its sequence length.
///
/// The file size must be a non-zero multiple of `4 × dim` bytes.
pub fn read_embeddings_file(path: &Path, dim: usize) -> Result<(Vec<f32>, usize)> {
    let bytes = fs::read(path).map_err(|e| FluxError::io(path, e))?;
    let row_bytes = F32_BYTES * dim;
    if dim == 0 || bytes.is_empty() || bytes.len() % row_bytes != 0 {
        return Err(FluxError::encoding(format!(
            "{}: {} bytes is not a whole number of {dim}-dim f32 embeddings",
            path.display(),
            bytes.len()
        )));
    }
    let seq_len = bytes.len() / row_bytes;
    tracing::debug!("read {seq_len}x{dim} embeddings from {}", path.display());
    Ok((decode_f32(&bytes), seq_len))
}

/// Read a noise file; its length is the file size divided by four.
pub fn read_noise_file(path: &Path) -> Result<Vec<f32>> {
    let bytes = fs::read(path).map_err(|e| FluxError::io(path, e))?;
    if bytes.is_empty() || bytes.len() % F32_BYTES != 0 {
        return Err(FluxError::validation(format!(
            "{}: {} bytes is not a whole number of f32 values",
            path.display(),
            bytes.len()
        )));
    }
    Ok(decode_f32(&bytes))
}

/// Write `data` as little-endian f32.
pub fn write_f32_file(path: &Path, data: &[f32]) -> Result<()> {
    let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
    fs::write(path, bytes).map_err(|e| FluxError::io(path, e))
}
