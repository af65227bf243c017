//! `cadence-core`: configuration and shared error types for the Cadence
//! job scheduler workspace.

pub mod config;
pub mod error;

pub use config::CadenceConfig;
pub use error::{CadenceError, Result};
