use std::path::{Path, PathBuf};
use std::time::Duration;

use modelport_core::{
    EagerModel, EagerRuntime, PredictorError, PredictorResult, SavedModelExport, SpecStructure,
    TensorMap,
};
use tracing::debug;

use crate::base::SavedModelBase;
use crate::config::PredictorConfig;
use crate::predictor::{step_from_tensor, to_predictions, Predictions, Predictor};

/// Predictor that calls the loaded export directly on every request.
///
/// The runtime hands back its own tensors; they are converted to plain
/// [`modelport_core::Array`]s before leaving the predictor.
pub struct EagerPredictor<R: EagerRuntime> {
    runtime: R,
    base: SavedModelBase<R::Model>,
}

impl<R: EagerRuntime> EagerPredictor<R> {
    pub fn new(runtime: R, saved_model_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            runtime,
            base: SavedModelBase::new(SavedModelExport::new(saved_model_path), timeout),
        }
    }

    pub fn from_config(runtime: R, config: &PredictorConfig) -> anyhow::Result<Self> {
        let base = SavedModelBase::new(config.export_source()?, config.timeout()?)
            .with_poll_interval(config.poll_interval()?);
        Ok(Self { runtime, base })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.base = self.base.with_poll_interval(poll_interval);
        self
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }
}

impl<R: EagerRuntime> Predictor for EagerPredictor<R> {
    fn restore(&mut self) -> PredictorResult<bool> {
        let runtime = &self.runtime;
        self.base.restore_with(|export, _| {
            debug!(runtime = runtime.name(), path = %export.path().display(), "loading export");
            Ok(runtime.load(export)?)
        })
    }

    fn predict(&mut self, features: TensorMap) -> PredictorResult<Predictions> {
        let features = self.base.prepare_features(features)?;
        let outputs = self.base.handle_mut()?.call(features)?;
        to_predictions(outputs)
    }

    fn feature_specification(&self) -> PredictorResult<&SpecStructure> {
        self.base.feature_specification()
    }

    fn label_specification(&self) -> PredictorResult<&SpecStructure> {
        self.base.label_specification()
    }

    fn init_randomly(&mut self) -> PredictorResult<()> {
        self.base.init_randomly()
    }

    fn close(&mut self) -> PredictorResult<()> {
        drop(self.base.close()?);
        Ok(())
    }

    fn model_version(&self) -> PredictorResult<i64> {
        self.base.model_version()
    }

    fn global_step(&mut self) -> PredictorResult<i64> {
        let step = self
            .base
            .handle_mut()?
            .global_step()?
            .ok_or(PredictorError::GlobalStepNotRecorded)?;
        step_from_tensor(&step)
    }

    fn model_path(&self) -> PredictorResult<&Path> {
        self.base.model_path()
    }
}
