//! Predictors over versioned model exports.
//!
//! [`EagerPredictor`] and [`GraphPredictor`] implement the same [`Predictor`]
//! interface on top of a shared [`SavedModelBase`]; they differ only in how
//! they drive the runtime.

pub mod base;
pub mod config;
pub mod eager;
pub mod graph;
pub mod predictor;

pub use base::*;
pub use config::*;
pub use eager::*;
pub use graph::*;
pub use predictor::{Predictions, Predictor};
