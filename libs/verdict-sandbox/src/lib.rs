pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod isolate;
pub mod report;
pub mod sandbox;
pub mod slots;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;


pub use error::{Result, SandboxError};
