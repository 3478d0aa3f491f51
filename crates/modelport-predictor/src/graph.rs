use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::anyhow;
use modelport_core::{
    GraphRuntime, GraphSession, NodeId, PredictorError, PredictorResult, SavedModelExport,
    SessionConfig, SessionScope, SpecStructure, TensorMap,
};
use tracing::debug;

use crate::base::SavedModelBase;
use crate::config::PredictorConfig;
use crate::predictor::{step_from_tensor, to_predictions, Predictions, Predictor};

struct GraphState<S> {
    session: S,
    placeholders: BTreeMap<String, NodeId>,
    predictions: BTreeMap<String, NodeId>,
    step: Option<NodeId>,
}

/// Predictor that owns an isolated runtime session.
///
/// Restore imports the export, declares one placeholder per feature, builds the
/// prediction outputs and the step node once and initializes variables. Each
/// call afterwards only feeds placeholders and runs pre-built nodes. The session is pinned as
/// the thread's default session for the duration of every call.
pub struct GraphPredictor<R: GraphRuntime> {
    runtime: R,
    session_config: SessionConfig,
    base: SavedModelBase<GraphState<R::Session>>,
}

impl<R: GraphRuntime> GraphPredictor<R> {
    pub fn new(
        runtime: R,
        saved_model_path: impl Into<PathBuf>,
        timeout: Duration,
        session_config: SessionConfig,
    ) -> Self {
        Self {
            runtime,
            session_config,
            base: SavedModelBase::new(SavedModelExport::new(saved_model_path), timeout),
        }
    }

    pub fn from_config(runtime: R, config: &PredictorConfig) -> anyhow::Result<Self> {
        let base = SavedModelBase::new(config.export_source()?, config.timeout()?)
            .with_poll_interval(config.poll_interval()?);
        Ok(Self {
            runtime,
            session_config: config.session.clone(),
            base,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.base = self.base.with_poll_interval(poll_interval);
        self
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }
}

impl<R: GraphRuntime> Predictor for GraphPredictor<R> {
    fn restore(&mut self) -> PredictorResult<bool> {
        let runtime = &self.runtime;
        let session_config = &self.session_config;
        self.base.restore_with(|export, assets| {
            let mut session = runtime.new_session(session_config)?;
            let _scope = SessionScope::enter(session.id());

            session.load(export)?;
            let placeholders = assets
                .feature_spec
                .iter()
                .map(|(name, spec)| Ok((name.clone(), session.placeholder(name, spec)?)))
                .collect::<anyhow::Result<BTreeMap<_, _>>>()?;
            let predictions = session.build_predictions(&placeholders)?;
            let step = session.global_step_node()?;
            // Importing the export creates variables; they are unusable until
            // initialized.
            session.initialize_variables()?;

            debug!(
                runtime = runtime.name(),
                session = %session.id(),
                placeholders = placeholders.len(),
                outputs = predictions.len(),
                has_step = step.is_some(),
                "prediction graph built"
            );
            Ok(GraphState {
                session,
                placeholders,
                predictions,
                step,
            })
        })
    }

    fn predict(&mut self, features: TensorMap) -> PredictorResult<Predictions> {
        let features = self.base.prepare_features(features)?;
        let state = self.base.handle_mut()?;
        let _scope = SessionScope::enter(state.session.id());

        let feeds = features
            .into_iter()
            .map(|(name, tensor)| match state.placeholders.get(&name) {
                Some(node) => Ok((*node, tensor)),
                None => Err(PredictorError::UnknownFeature(name)),
            })
            .collect::<PredictorResult<Vec<_>>>()?;
        let (names, fetches): (Vec<String>, Vec<NodeId>) = state
            .predictions
            .iter()
            .map(|(name, node)| (name.clone(), *node))
            .unzip();

        let outputs = state.session.run(&fetches, feeds)?;
        if outputs.len() != fetches.len() {
            return Err(anyhow!(
                "session returned {} values for {} fetches",
                outputs.len(),
                fetches.len()
            )
            .into());
        }
        to_predictions(names.into_iter().zip(outputs))
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
        let state = self.base.close()?;
        debug!(session = %state.session.id(), "releasing graph session");
        drop(state);
        Ok(())
    }

    fn model_version(&self) -> PredictorResult<i64> {
        self.base.model_version()
    }

    fn global_step(&mut self) -> PredictorResult<i64> {
        let state = self.base.handle_mut()?;
        let node = state.step.ok_or(PredictorError::GlobalStepNotRecorded)?;
        let _scope = SessionScope::enter(state.session.id());

        let step = state
            .session
            .run(&[node], Vec::new())?
            .pop()
            .ok_or_else(|| anyhow!("session returned no value for the global step"))?;
        step_from_tensor(&step)
    }

    fn model_path(&self) -> PredictorResult<&Path> {
        self.base.model_path()
    }
}
