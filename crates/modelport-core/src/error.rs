//! Error type returned by predictors.
//!
//! Runtime implementations report failures with `anyhow`; those land in
//! [`PredictorError::Runtime`] at the predictor boundary.

use std::path::PathBuf;

use thiserror::Error;

use crate::DType;

#[derive(Error, Debug)]
pub enum PredictorError {
    /// predict, close or an accessor was called before a successful restore.
    #[error("the predictor has not yet been successfully restored")]
    NotLoaded,

    /// The loaded export carries no training step.
    #[error("the loaded model does not record a global step")]
    GlobalStepNotRecorded,

    #[error("{0} is not supported by saved model predictors")]
    Unsupported(&'static str),

    #[error("export path {} does not end in a numeric model version", .0.display())]
    InvalidVersion(PathBuf),

    #[error("invalid export metadata at {}: {reason}", path.display())]
    Metadata { path: PathBuf, reason: String },

    #[error("missing required feature `{0}`")]
    MissingFeature(String),

    #[error("feature `{0}` is not part of the feature specification")]
    UnknownFeature(String),

    #[error("feature `{name}` has dtype {actual}, expected {expected}")]
    DtypeMismatch {
        name: String,
        expected: DType,
        actual: DType,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

pub type PredictorResult<T> = Result<T, PredictorError>;
