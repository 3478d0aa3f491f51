pub mod error;
pub mod export;
pub mod runtime;
pub mod scope;
pub mod spec;
pub mod tensor;

pub use error::*;
pub use export::*;
pub use runtime::*;
pub use scope::{SessionId, SessionScope};
pub use spec::*;
pub use tensor::*;
