use std::collections::BTreeMap;
use std::path::Path;

use anyhow::anyhow;
use modelport_core::{Array, PredictorResult, SpecStructure, Tensor, TensorMap};

/// Model outputs by name, converted to plain arrays.
pub type Predictions = BTreeMap<String, Array>;

/// Object-safe predictor interface.
///
/// Everything except [`Predictor::restore`] and [`Predictor::init_randomly`]
/// fails with [`modelport_core::PredictorError::NotLoaded`] until a restore has
/// succeeded.
pub trait Predictor: Send {
    /// Loads the latest model. `Ok(false)` means no export showed up in time;
    /// the call can be retried.
    fn restore(&mut self) -> PredictorResult<bool>;

    fn predict(&mut self, features: TensorMap) -> PredictorResult<Predictions>;

    /// Input features the loaded model expects.
    fn feature_specification(&self) -> PredictorResult<&SpecStructure>;

    /// Labels the model was trained against, for evaluation.
    fn label_specification(&self) -> PredictorResult<&SpecStructure>;

    fn init_randomly(&mut self) -> PredictorResult<()>;

    /// Releases the loaded model. A later restore loads it again.
    fn close(&mut self) -> PredictorResult<()>;

    fn model_version(&self) -> PredictorResult<i64>;

    fn global_step(&mut self) -> PredictorResult<i64>;

    fn model_path(&self) -> PredictorResult<&Path>;
}

pub(crate) fn to_predictions(
    outputs: impl IntoIterator<Item = (String, Tensor)>,
) -> PredictorResult<Predictions> {
    outputs
        .into_iter()
        .map(|(name, tensor)| Ok((name, tensor.to_array()?)))
        .collect()
}

pub(crate) fn step_from_tensor(step: &Tensor) -> PredictorResult<i64> {
    step.to_array()?.scalar_i64().ok_or_else(|| {
        anyhow!(
            "global step must be a scalar integer, got {}{}",
            step.dtype,
            step.shape
        )
        .into()
    })
}
