#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{bail, ensure, Context, Result};
use modelport_core::{
    scope, DType, EagerModel, EagerRuntime, ExportAssets, GraphRuntime, GraphSession, NodeId,
    SavedModelExport, SessionConfig, SessionId, SpecStructure, Tensor, TensorMap, TensorSpec,
};

pub const GLOBAL_STEP: i64 = 1234;

pub fn assets() -> ExportAssets {
    ExportAssets {
        feature_spec: SpecStructure::new()
            .with("x", TensorSpec::new("x", DType::F32, vec![Some(3)])),
        label_spec: SpecStructure::new()
            .with("y", TensorSpec::new("y", DType::F32, vec![Some(3)])),
        global_step: Some(GLOBAL_STEP),
    }
}

/// Writes a complete export: model file first, assets marker last.
pub fn write_export(root: &Path, version: &str) -> SavedModelExport {
    write_export_with(root, version, &assets())
}

pub fn write_export_with(root: &Path, version: &str, assets: &ExportAssets) -> SavedModelExport {
    let export = SavedModelExport::new(root.join(version));
    write_model_file(&export);
    export.write_assets(assets).unwrap();
    export
}

pub fn write_model_file(export: &SavedModelExport) {
    std::fs::create_dir_all(export.path()).unwrap();
    std::fs::write(export.model_file(), b"fake-model").unwrap();
}

pub fn features(dims: &[usize], values: &[f32]) -> TensorMap {
    TensorMap::from([("x".to_string(), Tensor::from_vec(dims, values).unwrap())])
}

fn scale(tensor: &Tensor, factor: f32) -> Result<Tensor> {
    let values: Vec<f32> = tensor.to_vec::<f32>()?.iter().map(|v| v * factor).collect();
    Tensor::from_vec(tensor.shape.dims(), &values)
}

fn recorded_step(export: &SavedModelExport) -> Result<Option<i64>> {
    Ok(export.load_assets()?.global_step)
}

/// Eager runtime whose models multiply every input by `factor` and return it
/// as `<name>_scaled`.
#[derive(Clone)]
pub struct ScalingRuntime {
    pub factor: f32,
    pub calls: Arc<Mutex<Vec<TensorMap>>>,
}

impl ScalingRuntime {
    pub fn new(factor: f32) -> Self {
        Self {
            factor,
            calls: Arc::default(),
        }
    }
}

pub struct ScalingModel {
    factor: f32,
    global_step: Option<i64>,
    calls: Arc<Mutex<Vec<TensorMap>>>,
}

impl EagerRuntime for ScalingRuntime {
    type Model = ScalingModel;

    fn name(&self) -> &'static str {
        "scaling"
    }

    fn load(&self, export: &SavedModelExport) -> Result<Self::Model> {
        ensure!(
            export.model_file().is_file(),
            "no model file in {}",
            export.path().display()
        );
        Ok(ScalingModel {
            factor: self.factor,
            global_step: recorded_step(export)?,
            calls: self.calls.clone(),
        })
    }
}

impl EagerModel for ScalingModel {
    fn call(&mut self, inputs: TensorMap) -> Result<TensorMap> {
        self.calls.lock().unwrap().push(inputs.clone());
        inputs
            .iter()
            .map(|(name, tensor)| Ok((format!("{name}_scaled"), scale(tensor, self.factor)?)))
            .collect()
    }

    fn global_step(&mut self) -> Result<Option<Tensor>> {
        Ok(self.global_step.map(Tensor::scalar))
    }
}

/// Graph runtime with the same math as [`ScalingRuntime`], recording every
/// session operation and the default session seen while performing it.
#[derive(Clone, Default)]
pub struct ScalingGraphRuntime {
    pub events: Arc<Mutex<Vec<String>>>,
    pub configs: Arc<Mutex<Vec<SessionConfig>>>,
    pub active_sessions: Arc<Mutex<Vec<(SessionId, Option<SessionId>)>>>,
}

enum Node {
    Placeholder(String),
    Scaled(NodeId),
    Step,
}

pub struct ScalingSession {
    id: SessionId,
    runtime: ScalingGraphRuntime,
    global_step: Option<i64>,
    nodes: Vec<Node>,
    initialized: bool,
}

impl ScalingSession {
    fn record(&self, event: impl Into<String>) -> Result<()> {
        let active = scope::active();
        self.runtime
            .active_sessions
            .lock()
            .unwrap()
            .push((self.id, active));
        ensure!(active == Some(self.id), "{} is not the default session", self.id);
        self.runtime.events.lock().unwrap().push(event.into());
        Ok(())
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }
}

impl GraphRuntime for ScalingGraphRuntime {
    type Session = ScalingSession;

    fn name(&self) -> &'static str {
        "scaling-graph"
    }

    fn new_session(&self, config: &SessionConfig) -> Result<Self::Session> {
        self.configs.lock().unwrap().push(config.clone());
        Ok(ScalingSession {
            id: SessionId::next(),
            runtime: self.clone(),
            global_step: None,
            nodes: Vec::new(),
            initialized: false,
        })
    }
}

impl GraphSession for ScalingSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn load(&mut self, export: &SavedModelExport) -> Result<()> {
        self.record("load")?;
        ensure!(export.model_file().is_file(), "no model file");
        self.global_step = recorded_step(export)?;
        Ok(())
    }

    fn placeholder(&mut self, name: &str, spec: &TensorSpec) -> Result<NodeId> {
        self.record(format!("placeholder:{name}"))?;
        ensure!(spec.batched_dims()[0].is_none(), "batch dim must be dynamic");
        Ok(self.push(Node::Placeholder(name.to_string())))
    }

    fn build_predictions(
        &mut self,
        inputs: &BTreeMap<String, NodeId>,
    ) -> Result<BTreeMap<String, NodeId>> {
        self.record("build")?;
        let mut outputs = BTreeMap::new();
        for (name, node) in inputs {
            let id = self.push(Node::Scaled(*node));
            outputs.insert(format!("{name}_scaled"), id);
        }
        Ok(outputs)
    }

    fn global_step_node(&mut self) -> Result<Option<NodeId>> {
        self.record("global_step")?;
        if self.global_step.is_none() {
            return Ok(None);
        }
        Ok(Some(self.push(Node::Step)))
    }

    fn initialize_variables(&mut self) -> Result<()> {
        self.record("init")?;
        self.initialized = true;
        Ok(())
    }

    fn run(&mut self, fetches: &[NodeId], feeds: Vec<(NodeId, Tensor)>) -> Result<Vec<Tensor>> {
        self.record("run")?;
        ensure!(self.initialized, "variables have not been initialized");
        let feeds: BTreeMap<NodeId, Tensor> = feeds.into_iter().collect();

        fetches
            .iter()
            .map(|fetch| match self.nodes.get(fetch.0) {
                Some(Node::Scaled(input)) => {
                    let fed = feeds.get(input).context("placeholder was not fed")?;
                    scale(fed, 2.0)
                }
                Some(Node::Step) => Ok(Tensor::scalar(
                    self.global_step.context("nothing loaded")?,
                )),
                Some(Node::Placeholder(name)) => bail!("cannot fetch placeholder {name}"),
                None => bail!("unknown node {fetch:?}"),
            })
            .collect()
    }
}
