//! Kiln Core
//!
//! Domain types, port traits, and error handling shared by the build
//! orchestrator and the failure triage engine. Everything else in the
//! workspace speaks this vocabulary.

pub mod build;
pub mod error;
pub mod events;
pub mod ids;
pub mod ports;
pub mod slot;
pub mod triage;

pub use error::{Error, Result};
pub use ids::*;
