//! Registry workflows built on the store contract.

use tracing::info;

use crate::common::error::{PersonaError, Result};
use crate::common::ids::RunId;

use super::domain::{ModelRegistry, PromotionResult, RegistryEntry};

/// Register `run_id` as a new version and promote it.
///
/// If the current Production entry already came from `run_id` nothing is
/// registered and the active entry comes back as `AlreadyActive`, so repeated
/// or racing calls with the same winning run never stack up versions.
pub fn register_and_promote(
    registry: &dyn ModelRegistry,
    model_name: &str,
    run_id: &RunId,
) -> Result<PromotionResult> {
    let result = registry.publish(model_name, run_id)?;
    match &result {
        PromotionResult::Promoted { entry, archived } => info!(
            model_name,
            version = entry.version,
            run_id = %run_id,
            archived = ?archived,
            "model version registered and promoted to production"
        ),
        PromotionResult::AlreadyActive { entry } => {
            info!(model_name, version = entry.version, run_id = %run_id, "run already in production")
        }
    }
    Ok(result)
}

/// Promote an existing version, logging the transition.
pub fn promote(registry: &dyn ModelRegistry, model_name: &str, version: u32) -> Result<PromotionResult> {
    let result = registry.promote(model_name, version)?;
    match &result {
        PromotionResult::Promoted { archived, .. } => {
            info!(model_name, version, archived = ?archived, "model version promoted to production")
        }
        PromotionResult::AlreadyActive { .. } => {
            info!(model_name, version, "version already in production")
        }
    }
    Ok(result)
}

/// Active entry, or `NotFound` when nothing serves yet.
pub fn require_active(registry: &dyn ModelRegistry, model_name: &str) -> Result<RegistryEntry> {
    registry
        .get_active(model_name)?
        .ok_or_else(|| PersonaError::not_found("production model", model_name))
}
