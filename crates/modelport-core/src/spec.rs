use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{DType, Shape};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IOName(pub String);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: IOName,
    pub dtype: DType,
    #[serde(rename = "shape")]
    pub dims: Vec<Option<usize>>, // None = dynamic
    #[serde(default)]
    pub is_optional: bool,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, dtype: DType, dims: Vec<Option<usize>>) -> Self {
        Self {
            name: IOName(name.into()),
            dtype,
            dims,
            is_optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.is_optional = true;
        self
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Whether `shape` is exactly this spec's per-example shape, i.e. it carries
    /// no batch dimension yet.
    pub fn is_unbatched(&self, shape: &Shape) -> bool {
        shape.rank() == self.rank()
            && self
                .dims
                .iter()
                .zip(shape.dims())
                .all(|(want, got)| want.map_or(true, |w| w == *got))
    }

    /// The spec's dims behind a dynamic leading batch dimension.
    pub fn batched_dims(&self) -> Vec<Option<usize>> {
        std::iter::once(None)
            .chain(self.dims.iter().copied())
            .collect()
    }
}

/// Ordered mapping from field path (e.g. `state/image`) to its tensor spec.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecStructure(BTreeMap<String, TensorSpec>);

impl SpecStructure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, spec: TensorSpec) -> Option<TensorSpec> {
        self.0.insert(key.into(), spec)
    }

    pub fn with(mut self, key: impl Into<String>, spec: TensorSpec) -> Self {
        self.insert(key, spec);
        self
    }

    pub fn get(&self, key: &str) -> Option<&TensorSpec> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TensorSpec)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keys of entries a caller must always provide.
    pub fn required(&self) -> impl Iterator<Item = &String> {
        self.0
            .iter()
            .filter(|(_, spec)| !spec.is_optional)
            .map(|(key, _)| key)
    }
}
