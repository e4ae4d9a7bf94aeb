//! Error types for the FLUX.2-klein pipeline.
//!
//! Model code below the orchestrator works in `candle::Result`; failures are
//! tagged with the pipeline stage they came from when they cross into
//! [`FluxError`] through [`StageContext::stage`].

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Pipeline stage a numeric failure originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    TextEncoder,
    Transformer,
    Sampler,
    Vae,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::TextEncoder => "text encoder",
            Stage::Transformer => "transformer",
            Stage::Sampler => "sampler",
            Stage::Vae => "vae",
        };
        f.write_str(name)
    }
}

/// Failures raised while opening and validating a model directory.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("missing file: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("missing tensor '{name}' in {component}")]
    MissingTensor { component: String, name: String },

    #[error("shape mismatch for '{name}': expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("unsupported format in {}: {reason}", .path.display())]
    UnsupportedFormat { path: PathBuf, reason: String },
}

#[derive(Error, Debug)]
pub enum FluxError {
    #[error("load error: {0}")]
    Load(#[from] LoadError),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("numeric failure in {stage}: {source}")]
    Numeric {
        stage: Stage,
        #[source]
        source: candle::Error,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FluxError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, FluxError>;

/// Attach a pipeline stage to a candle failure.
pub trait StageContext<T> {
    fn stage(self, stage: Stage) -> Result<T>;
}

impl<T> StageContext<T> for candle::Result<T> {
    fn stage(self, stage: Stage) -> Result<T> {
        self.map_err(|source| FluxError::Numeric { stage, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_context_tags_numeric_failures() {
        let failing: candle::Result<()> = Err(candle::Error::Msg("boom".to_string()));
        let err = failing.stage(Stage::Vae).unwrap_err();
        assert!(matches!(err, FluxError::Numeric { stage: Stage::Vae, .. }));
        assert_eq!(err.to_string(), "numeric failure in vae: boom");
    }

    #[test]
    fn test_load_error_messages() {
        let err: FluxError = LoadError::ShapeMismatch {
            name: "proj_out.weight".to_string(),
            expected: vec![128, 3072],
            got: vec![64, 3072],
        }
        .into();
        assert_eq!(
            err.to_string(),
            "load error: shape mismatch for 'proj_out.weight': expected [128, 3072], got [64, 3072]"
        );
    }
}
