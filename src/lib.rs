// Library exports for planwright
// The binary and the integration tests both build on these modules

pub mod capability;
pub mod config;
pub mod error;
pub mod execution;
pub mod llm;
pub mod persistence;
pub mod planning;

pub use error::{EngineError, Result};
