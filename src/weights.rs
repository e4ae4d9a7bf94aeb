//! Weight store adapter.
//!
//! A component directory (`transformer/`, `text_encoder/`, `vae/`) holds one
//! or more `*.safetensors` shards. [`WeightTable`] memory-maps them and indexes
//! every tensor header by name; nothing is copied until a model is built.
//!
//! Each model declares the tensors it reads as a [`WeightManifest`], and
//! [`WeightTable::validate`] checks every entry's presence, shape and dtype
//! before any stage is constructed, so a bad checkpoint fails with a precise
//! [`LoadError`] instead of a shape error deep inside a forward pass.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle::{DType, Device};
use candle_nn::VarBuilder;

use crate::error::{FluxError, LoadError, Result, Stage, StageContext};

/// The `(name, shape)` pairs a model stage reads from its weight table.
#[derive(Debug, Clone, Default)]
pub struct WeightManifest {
    component: String,
    entries: Vec<(String, Vec<usize>)>,
}

impl WeightManifest {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            entries: Vec::new(),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn push(&mut self, name: impl Into<String>, shape: &[usize]) {
        self.entries.push((name.into(), shape.to_vec()));
    }

    /// A bias-free linear layer, stored as `[out, in]`.
    pub fn linear(&mut self, prefix: &str, in_dim: usize, out_dim: usize) {
        self.push(format!("{prefix}.weight"), &[out_dim, in_dim]);
    }

    /// A linear layer with bias.
    pub fn linear_b(&mut self, prefix: &str, in_dim: usize, out_dim: usize) {
        self.linear(prefix, in_dim, out_dim);
        self.push(format!("{prefix}.bias"), &[out_dim]);
    }

    /// A weight-only norm (RMSNorm).
    pub fn norm(&mut self, prefix: &str, dim: usize) {
        self.push(format!("{prefix}.weight"), &[dim]);
    }

    /// An affine norm with weight and bias (GroupNorm).
    pub fn norm_b(&mut self, prefix: &str, dim: usize) {
        self.norm(prefix, dim);
        self.push(format!("{prefix}.bias"), &[dim]);
    }

    /// A 2d convolution with bias.
    pub fn conv2d(&mut self, prefix: &str, in_c: usize, out_c: usize, kernel: usize) {
        self.push(format!("{prefix}.weight"), &[out_c, in_c, kernel, kernel]);
        self.push(format!("{prefix}.bias"), &[out_c]);
    }

    pub fn entries(&self) -> &[(String, Vec<usize>)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of scalar parameters.
    pub fn num_parameters(&self) -> usize {
        self.entries
            .iter()
            .map(|(_, shape)| shape.iter().product::<usize>())
            .sum()
    }
}

#[derive(Debug, Clone)]
struct TensorInfo {
    shape: Vec<usize>,
    /// `None` for dtypes candle cannot represent.
    dtype: Option<DType>,
    file: usize,
}

/// Memory-mapped safetensors shards of one model component.
#[derive(Debug)]
pub struct WeightTable {
    dir: PathBuf,
    files: Vec<PathBuf>,
    index: HashMap<String, TensorInfo>,
}

impl WeightTable {
    /// Open every `*.safetensors` file in `dir`, in file-name order.
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(LoadError::MissingFile(dir.to_path_buf()).into());
        }
        let entries = std::fs::read_dir(dir).map_err(|e| FluxError::io(dir, e))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(LoadError::MissingFile(dir.join("*.safetensors")).into());
        }

        let mut index = HashMap::new();
        for (file_idx, path) in files.iter().enumerate() {
            // SAFETY: the mapping is read-only and dropped before returning.
            let mmaped = unsafe { candle::safetensors::MmapedSafetensors::new(path) }.map_err(
                |e| LoadError::UnsupportedFormat {
                    path: path.clone(),
                    reason: e.to_string(),
                },
            )?;
            for (name, view) in mmaped.tensors() {
                let info = TensorInfo {
                    shape: view.shape().to_vec(),
                    dtype: DType::try_from(view.dtype()).ok(),
                    file: file_idx,
                };
                index.insert(name, info);
            }
        }
        tracing::debug!(
            "indexed {} tensors in {} file(s) under {}",
            index.len(),
            files.len(),
            dir.display()
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            files,
            index,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Stored shape of `name`, if present.
    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.index.get(name).map(|info| info.shape.as_slice())
    }

    /// Check that every manifest entry exists with the declared shape and a
    /// floating-point dtype. Extra tensors in the table are ignored.
    pub fn validate(&self, manifest: &WeightManifest) -> Result<()> {
        for (name, expected) in manifest.entries() {
            let info = self
                .index
                .get(name)
                .ok_or_else(|| LoadError::MissingTensor {
                    component: manifest.component().to_string(),
                    name: name.clone(),
                })?;
            if &info.shape != expected {
                return Err(LoadError::ShapeMismatch {
                    name: name.clone(),
                    expected: expected.clone(),
                    got: info.shape.clone(),
                }
                .into());
            }
            match info.dtype {
                Some(dtype) if dtype.is_float() => {}
                other => {
                    return Err(LoadError::UnsupportedFormat {
                        path: self.files[info.file].clone(),
                        reason: format!("tensor '{name}' has non-float dtype {other:?}"),
                    }
                    .into())
                }
            }
        }
        tracing::debug!(
            "{}: {} tensors validated ({:.1}M parameters)",
            manifest.component(),
            manifest.len(),
            manifest.num_parameters() as f64 / 1e6
        );
        Ok(())
    }

    /// Build a `VarBuilder` reading from the mapped shards.
    pub fn var_builder(&self, dtype: DType, device: &Device, stage: Stage) -> Result<VarBuilder<'static>> {
        // SAFETY: the files are treated as immutable while the model is alive.
        unsafe { VarBuilder::from_mmaped_safetensors(&self.files, dtype, device) }.stage(stage)
    }
}
