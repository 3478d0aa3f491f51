use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{Device, SavedModelExport, SessionId, Tensor, TensorSpec};

/// Tensors keyed by feature or output name.
pub type TensorMap = BTreeMap<String, Tensor>;

/// A runtime that executes a loaded export directly, call by call.
pub trait EagerRuntime: Send + Sync + 'static {
    type Model: EagerModel;

    fn name(&self) -> &'static str;
    fn load(&self, export: &SavedModelExport) -> Result<Self::Model>;
}

pub trait EagerModel: Send + 'static {
    /// Inputs are already batched.
    fn call(&mut self, inputs: TensorMap) -> Result<TensorMap>;

    /// Training step the export was written at, as a scalar tensor. `None`
    /// when the export does not record one.
    fn global_step(&mut self) -> Result<Option<Tensor>>;
}

/// Handle to a node in a graph session: a placeholder, a prediction output or
/// a step counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationLevel {
    Disable,
    Level1,
    Level2,
    #[default]
    Level3,
}

/// Options applied when a graph session is created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub device: Device,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
    #[serde(default)]
    pub optimization: OptimizationLevel,
}

fn default_intra_threads() -> usize {
    1
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device: Device::default(),
            intra_threads: default_intra_threads(),
            optimization: OptimizationLevel::default(),
        }
    }
}

/// A runtime that imports an export into its own graph and executes it through
/// a session.
pub trait GraphRuntime: Send + Sync + 'static {
    type Session: GraphSession;

    fn name(&self) -> &'static str;
    fn new_session(&self, config: &SessionConfig) -> Result<Self::Session>;
}

/// Graph-building and execution operations are only valid while the session is
/// the active default (see [`crate::scope`]).
pub trait GraphSession: Send + 'static {
    fn id(&self) -> SessionId;

    /// Imports the export's graph and weights.
    fn load(&mut self, export: &SavedModelExport) -> Result<()>;

    /// Declares an input for feature `name`. The placeholder accepts any batch
    /// size in front of `spec`'s dims.
    fn placeholder(&mut self, name: &str, spec: &TensorSpec) -> Result<NodeId>;

    /// Wires the placeholders into the imported graph and returns its outputs.
    fn build_predictions(
        &mut self,
        inputs: &BTreeMap<String, NodeId>,
    ) -> Result<BTreeMap<String, NodeId>>;

    /// Node evaluating to the recorded training step, or `None` when the
    /// export does not record one.
    fn global_step_node(&mut self) -> Result<Option<NodeId>>;

    fn initialize_variables(&mut self) -> Result<()>;

    /// Evaluates `fetches` in order, feeding placeholder values from `feeds`.
    fn run(&mut self, fetches: &[NodeId], feeds: Vec<(NodeId, Tensor)>) -> Result<Vec<Tensor>>;
}
