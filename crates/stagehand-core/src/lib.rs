//! Stagehand Core
//!
//! Domain types, port traits, and error handling for the Stagehand pipeline
//! orchestrator. This crate has minimal dependencies and defines the shared
//! vocabulary used by the engine and by every adapter.

pub mod error;
pub mod events;
pub mod ids;
pub mod instance;
pub mod pipeline;
pub mod ports;

pub use error::{Error, Result};
pub use ids::*;
