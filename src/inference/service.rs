//! Resolving the production model into a serving handle.

use tracing::info;

use crate::common::error::{PersonaError, Result};
use crate::registry::domain::ModelRegistry;
use crate::registry::service::require_active;
use crate::training::domain::RunHistory;

use super::domain::{ActiveModel, LoadedModel};

/// Load the model behind the current Production entry of `model_name`.
pub fn load_active(
    registry: &dyn ModelRegistry,
    history: &dyn RunHistory,
    model_name: &str,
) -> Result<LoadedModel> {
    let entry = require_active(registry, model_name)?;
    let record = history
        .get(&entry.source_run_id)?
        .ok_or_else(|| PersonaError::not_found("source run", &entry.source_run_id))?;
    info!(
        model_name,
        version = entry.version,
        run_id = %entry.source_run_id,
        k = record.candidate.cluster_count(),
        "production model loaded"
    );
    Ok(LoadedModel {
        model_name: entry.model_name,
        version: entry.version,
        run_id: entry.source_run_id,
        model: record.candidate.model().clone(),
    })
}

/// Re-resolve Production and swap it into `handle`.
///
/// On failure the handle keeps serving what it had.
pub fn reload(
    handle: &ActiveModel,
    registry: &dyn ModelRegistry,
    history: &dyn RunHistory,
    model_name: &str,
) -> Result<u32> {
    let model = load_active(registry, history, model_name)?;
    let version = model.version;
    let previous = handle.replace(model);
    info!(
        model_name,
        version,
        previous = ?previous.map(|m| m.version),
        "active model swapped"
    );
    Ok(version)
}
