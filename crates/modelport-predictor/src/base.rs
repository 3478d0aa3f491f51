//! State and behavior shared by the eager and graph predictors.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use modelport_core::{
    ExportAssets, ExportSource, PredictorError, PredictorResult, SavedModelExport, SpecStructure,
    TensorMap,
};
use tracing::{debug, info, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

struct Loaded<H> {
    export: SavedModelExport,
    feature_spec: SpecStructure,
    label_spec: SpecStructure,
    handle: H,
}

/// Export source, restore policy and, once restored, the export, its specs
/// and the runtime handle `H` of a predictor variant.
pub struct SavedModelBase<H> {
    source: ExportSource,
    timeout: Duration,
    poll_interval: Duration,
    loaded: Option<Loaded<H>>,
}

impl<H> SavedModelBase<H> {
    pub fn new(source: impl Into<ExportSource>, timeout: Duration) -> Self {
        Self {
            source: source.into(),
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            loaded: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn source(&self) -> &ExportSource {
        &self.source
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// Blocks until the source yields a complete export, checking again every
    /// poll interval. Returns `None` once `timeout` has elapsed without one.
    pub fn wait_for_export(&self) -> PredictorResult<Option<SavedModelExport>> {
        let start = Instant::now();
        while start.elapsed() < self.timeout {
            // The assets file is materialized last by the exporter.
            if let Some(export) = self.source.poll()? {
                return Ok(Some(export));
            }

            info!(source = %self.source, "waiting for a saved model to become available");
            let remaining = self.timeout.saturating_sub(start.elapsed());
            thread::sleep(self.poll_interval.min(remaining));
        }

        warn!(
            source = %self.source,
            timeout_secs = self.timeout.as_secs_f64(),
            "no saved model found before timeout"
        );
        Ok(None)
    }

    /// Waits for the export, reads its specs and hands both to `load` for the
    /// variant's handle. State only changes when every step succeeds.
    pub fn restore_with<F>(&mut self, load: F) -> PredictorResult<bool>
    where
        F: FnOnce(&SavedModelExport, &ExportAssets) -> PredictorResult<H>,
    {
        let Some(export) = self.wait_for_export()? else {
            return Ok(false);
        };

        let assets = export.load_assets()?;
        let handle = load(&export, &assets)?;

        info!(
            path = %export.path().display(),
            features = assets.feature_spec.len(),
            labels = assets.label_spec.len(),
            "saved model restored"
        );
        self.loaded = Some(Loaded {
            export,
            feature_spec: assets.feature_spec,
            label_spec: assets.label_spec,
            handle,
        });
        Ok(true)
    }

    fn loaded(&self) -> PredictorResult<&Loaded<H>> {
        self.loaded.as_ref().ok_or(PredictorError::NotLoaded)
    }

    pub fn handle_mut(&mut self) -> PredictorResult<&mut H> {
        self.loaded
            .as_mut()
            .map(|loaded| &mut loaded.handle)
            .ok_or(PredictorError::NotLoaded)
    }

    pub fn feature_specification(&self) -> PredictorResult<&SpecStructure> {
        Ok(&self.loaded()?.feature_spec)
    }

    pub fn label_specification(&self) -> PredictorResult<&SpecStructure> {
        Ok(&self.loaded()?.label_spec)
    }

    pub fn model_version(&self) -> PredictorResult<i64> {
        self.loaded()?.export.version()
    }

    /// Directory of the restored export.
    pub fn model_path(&self) -> PredictorResult<&Path> {
        Ok(self.loaded()?.export.path())
    }

    /// Validates a caller batch against the feature spec and adds the batch
    /// dimension to features that lack it.
    pub fn prepare_features(&self, features: TensorMap) -> PredictorResult<TensorMap> {
        expand_features(&self.loaded()?.feature_spec, features)
    }

    /// Drops back to the unloaded state and returns the handle so the variant
    /// can tear it down.
    pub fn close(&mut self) -> PredictorResult<H> {
        let loaded = self.loaded.take().ok_or(PredictorError::NotLoaded)?;
        debug!(path = %loaded.export.path().display(), "predictor closed");
        Ok(loaded.handle)
    }

    pub fn init_randomly(&self) -> PredictorResult<()> {
        Err(PredictorError::Unsupported("random initialization"))
    }
}

pub fn expand_features(spec: &SpecStructure, features: TensorMap) -> PredictorResult<TensorMap> {
    if let Some(missing) = spec.required().find(|key| !features.contains_key(*key)) {
        return Err(PredictorError::MissingFeature(missing.clone()));
    }

    features
        .into_iter()
        .map(|(name, tensor)| {
            let Some(tensor_spec) = spec.get(&name) else {
                return Err(PredictorError::UnknownFeature(name));
            };
            if tensor.dtype != tensor_spec.dtype {
                return Err(PredictorError::DtypeMismatch {
                    name,
                    expected: tensor_spec.dtype,
                    actual: tensor.dtype,
                });
            }
            let tensor = if tensor_spec.is_unbatched(&tensor.shape) {
                tensor.expand_dims0()
            } else {
                tensor
            };
            Ok((name, tensor))
        })
        .collect()
}
