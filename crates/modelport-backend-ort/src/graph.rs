use std::collections::{BTreeMap, HashSet};

use anyhow::{bail, ensure, Context, Result};
use modelport_core::{
    scope, GraphRuntime, GraphSession, NodeId, SavedModelExport, SessionConfig, SessionId, Tensor,
    TensorMap, TensorSpec,
};
use ort::session::{Session, SessionInputValue};
use tracing::{debug, info};

use crate::{
    io_specs, open_session, ort_value_to_tensor, recorded_global_step, tensor_to_ort_value,
    OrtRuntime,
};

enum Node {
    Placeholder { input: String, spec: TensorSpec },
    Output(String),
    GlobalStep,
}

/// An ONNX Runtime session driven through the graph-session protocol.
///
/// The ONNX graph is fixed at load time, so placeholders bind features to the
/// model's declared inputs and prediction nodes name its outputs. All checks
/// happen while the graph is built; `run` only converts and executes.
pub struct OrtGraphSession {
    id: SessionId,
    config: SessionConfig,
    session: Option<Session>,
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
    global_step: Option<i64>,
    nodes: Vec<Node>,
    initialized: bool,
}

impl GraphRuntime for OrtRuntime {
    type Session = OrtGraphSession;

    fn name(&self) -> &'static str {
        "onnxruntime"
    }

    fn new_session(&self, config: &SessionConfig) -> Result<Self::Session> {
        Ok(OrtGraphSession {
            id: SessionId::next(),
            config: config.clone(),
            session: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            global_step: None,
            nodes: Vec::new(),
            initialized: false,
        })
    }
}

impl OrtGraphSession {
    fn ensure_active(&self) -> Result<()> {
        ensure!(
            scope::active() == Some(self.id),
            "{} is not the default session on this thread",
            self.id
        );
        Ok(())
    }

    fn ensure_loaded(&self) -> Result<()> {
        ensure!(self.session.is_some(), "no export loaded into {}", self.id);
        Ok(())
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }
}

impl GraphSession for OrtGraphSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn load(&mut self, export: &SavedModelExport) -> Result<()> {
        self.ensure_active()?;
        ensure!(self.session.is_none(), "{} already holds a model", self.id);

        let session = open_session(export, &self.config)?;
        let (inputs, outputs) = io_specs(&session)?;
        self.global_step = recorded_global_step(&session, export)?;
        self.inputs = inputs;
        self.outputs = outputs;
        self.session = Some(session);

        info!(
            session = %self.id,
            path = %export.path().display(),
            device = %self.config.device,
            "ONNX model imported into graph session"
        );
        Ok(())
    }

    fn placeholder(&mut self, name: &str, spec: &TensorSpec) -> Result<NodeId> {
        self.ensure_active()?;
        self.ensure_loaded()?;

        let declared = self
            .inputs
            .iter()
            .find(|input| input.name.0 == name)
            .with_context(|| format!("model has no input named `{name}`"))?;
        ensure!(
            declared.dtype == spec.dtype,
            "feature `{name}` is {}, model input is {}",
            spec.dtype,
            declared.dtype
        );

        let dims = spec.batched_dims();
        ensure!(
            declared.rank() == dims.len(),
            "placeholder `{name}` has rank {}, model input has rank {}",
            dims.len(),
            declared.rank()
        );
        for (axis, (want, have)) in dims.iter().zip(&declared.dims).enumerate() {
            if let (Some(want), Some(have)) = (want, have) {
                ensure!(
                    want == have,
                    "feature `{name}` axis {axis} is {want}, model input expects {have}"
                );
            }
        }

        debug!(session = %self.id, feature = name, dims = ?dims, "placeholder declared");
        Ok(self.push(Node::Placeholder {
            input: name.to_string(),
            spec: spec.clone(),
        }))
    }

    fn build_predictions(
        &mut self,
        inputs: &BTreeMap<String, NodeId>,
    ) -> Result<BTreeMap<String, NodeId>> {
        self.ensure_active()?;
        self.ensure_loaded()?;

        {
            let bound: HashSet<&str> = inputs
                .values()
                .filter_map(|node| match self.nodes.get(node.0) {
                    Some(Node::Placeholder { input, .. }) => Some(input.as_str()),
                    _ => None,
                })
                .collect();
            for declared in &self.inputs {
                ensure!(
                    bound.contains(declared.name.0.as_str()),
                    "model input `{}` has no placeholder",
                    declared.name.0
                );
            }
        }

        let names: Vec<String> = self.outputs.iter().map(|o| o.name.0.clone()).collect();
        let mut predictions = BTreeMap::new();
        for name in names {
            let node = self.push(Node::Output(name.clone()));
            predictions.insert(name, node);
        }
        Ok(predictions)
    }

    fn global_step_node(&mut self) -> Result<Option<NodeId>> {
        self.ensure_active()?;
        self.ensure_loaded()?;
        if self.global_step.is_none() {
            return Ok(None);
        }
        Ok(Some(self.push(Node::GlobalStep)))
    }

    fn initialize_variables(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.ensure_loaded()?;
        // ONNX initializers are materialized when the session is committed.
        self.initialized = true;
        Ok(())
    }

    fn run(&mut self, fetches: &[NodeId], feeds: Vec<(NodeId, Tensor)>) -> Result<Vec<Tensor>> {
        self.ensure_active()?;
        ensure!(
            self.initialized,
            "variables of {} have not been initialized",
            self.id
        );

        let mut ort_inputs = Vec::with_capacity(feeds.len());
        for (node, tensor) in feeds {
            let Some(Node::Placeholder { input, spec }) = self.nodes.get(node.0) else {
                bail!("{node:?} is not a placeholder");
            };
            ensure!(
                tensor.dtype == spec.dtype,
                "feed for `{input}` has dtype {}, expected {}",
                tensor.dtype,
                spec.dtype
            );
            ensure!(
                tensor.shape.rank() == spec.rank() + 1,
                "feed for `{input}` has shape {}, expected a batch of {:?}",
                tensor.shape,
                spec.dims
            );
            let value = tensor_to_ort_value(tensor)?;
            ort_inputs.push((input.clone(), SessionInputValue::from(value)));
        }

        let needs_session = fetches
            .iter()
            .any(|fetch| matches!(self.nodes.get(fetch.0), Some(Node::Output(_))));
        let mut produced = TensorMap::new();
        if needs_session {
            let session = self
                .session
                .as_mut()
                .with_context(|| format!("no export loaded into {}", self.id))?;
            let outputs = session.run(ort_inputs)?;
            for (name, value) in outputs.iter() {
                produced.insert(name.to_string(), ort_value_to_tensor(&value)?);
            }
        }

        fetches
            .iter()
            .map(|fetch| match self.nodes.get(fetch.0) {
                Some(Node::Output(name)) => produced
                    .get(name)
                    .cloned()
                    .with_context(|| format!("session produced no output `{name}`")),
                Some(Node::GlobalStep) => self
                    .global_step
                    .map(Tensor::scalar)
                    .context("export does not record a global step"),
                Some(Node::Placeholder { input, .. }) => {
                    bail!("cannot fetch placeholder `{input}`")
                }
                None => bail!("unknown node {fetch:?}"),
            })
            .collect()
    }
}
