//! Lifecycle engine for the customer persona clustering model.
//!
//! Search for the best cluster count, promote it through the registry, serve
//! and batch-score with it, and retrain when incoming data drifts.

pub mod api;
pub mod common;
pub mod data;
pub mod evaluation;
pub mod inference;
pub mod orchestration;
pub mod registry;
pub mod training;

pub use common::error::{ErrorCode, PersonaError, Result};
