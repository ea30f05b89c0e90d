//! Registry entries and the promotion state machine's stages.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::error::{PersonaError, Result};
use crate::common::ids::RunId;

/// Lifecycle stage of one registered version.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Registered, not serving.
    None,
    /// The single serving version of its model name.
    Production,
    /// Terminal. Kept for audit and rollback by re-registration.
    Archived,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::None => "None",
            Stage::Production => "Production",
            Stage::Archived => "Archived",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "None" => Ok(Stage::None),
            "Production" => Ok(Stage::Production),
            "Archived" => Ok(Stage::Archived),
            other => Err(PersonaError::invalid(format!("unknown stage '{other}'"))),
        }
    }

    /// Whether a promotion request may move an entry out of this stage.
    pub fn can_promote(&self) -> bool {
        !matches!(self, Stage::Archived)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registered model version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub model_name: String,
    pub version: u32,
    pub stage: Stage,
    pub source_run_id: RunId,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a promotion request.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PromotionResult {
    Promoted {
        entry: RegistryEntry,
        /// Version moved from Production to Archived, if any.
        archived: Option<u32>,
    },
    /// The version already served; nothing changed.
    AlreadyActive { entry: RegistryEntry },
}

impl PromotionResult {
    pub fn entry(&self) -> &RegistryEntry {
        match self {
            PromotionResult::Promoted { entry, .. } | PromotionResult::AlreadyActive { entry } => entry,
        }
    }
}

/// Registry store contract.
///
/// Implementations serialise promotions per model name; at no point may two
/// entries of the same name be at `Production`.
pub trait ModelRegistry: Send + Sync {
    /// New entry at `max(version) + 1`, stage `None`.
    fn register(&self, model_name: &str, source_run_id: &RunId) -> Result<RegistryEntry>;
    /// Move `version` to `Production`, archiving the previous holder in the
    /// same atomic step.
    fn promote(&self, model_name: &str, version: u32) -> Result<PromotionResult>;
    /// Register `source_run_id` and promote it, unless the Production entry
    /// already comes from that run. Check, register and promote happen under
    /// one writer lock, so racing callers with the same run add one version.
    fn publish(&self, model_name: &str, source_run_id: &RunId) -> Result<PromotionResult>;
    fn get_active(&self, model_name: &str) -> Result<Option<RegistryEntry>>;
    /// All versions, ascending.
    fn list_versions(&self, model_name: &str) -> Result<Vec<RegistryEntry>>;
}

/// Apply a promotion to an in-memory version list.
///
/// Shared by the stores so the transition rules live in one place. On error
/// `entries` is left untouched.
pub fn apply_promotion(
    model_name: &str,
    entries: &mut [RegistryEntry],
    version: u32,
) -> Result<PromotionResult> {
    let target = entries
        .iter()
        .position(|e| e.version == version)
        .ok_or_else(|| PersonaError::not_found("model version", format!("{model_name} v{version}")))?;

    match entries[target].stage {
        Stage::Production => {
            return Ok(PromotionResult::AlreadyActive {
                entry: entries[target].clone(),
            })
        }
        Stage::Archived => {
            return Err(PersonaError::InvalidTransition {
                model_name: model_name.to_string(),
                version,
                from: Stage::Archived,
                to: Stage::Production,
            })
        }
        Stage::None => {}
    }

    let mut archived = None;
    for entry in entries.iter_mut().filter(|e| e.stage == Stage::Production) {
        entry.stage = Stage::Archived;
        archived = Some(entry.version);
    }
    entries[target].stage = Stage::Production;
    Ok(PromotionResult::Promoted {
        entry: entries[target].clone(),
        archived,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::time::now_utc;

    fn entries(stages: &[Stage]) -> Vec<RegistryEntry> {
        stages
            .iter()
            .enumerate()
            .map(|(i, stage)| RegistryEntry {
                model_name: "m".into(),
                version: i as u32 + 1,
                stage: *stage,
                source_run_id: RunId::new(format!("run{i}")),
                created_at: now_utc(),
            })
            .collect()
    }

    #[test]
    fn promotion_archives_previous_holder() {
        let mut list = entries(&[Stage::Production, Stage::None]);
        let result = apply_promotion("m", &mut list, 2).unwrap();
        assert!(matches!(result, PromotionResult::Promoted { archived: Some(1), .. }));
        assert_eq!(list[0].stage, Stage::Archived);
        assert_eq!(list[1].stage, Stage::Production);
    }

    #[test]
    fn archived_cannot_return() {
        let mut list = entries(&[Stage::Archived, Stage::Production]);
        let err = apply_promotion("m", &mut list, 1).unwrap_err();
        assert!(matches!(err, PersonaError::InvalidTransition { version: 1, .. }));
        assert_eq!(list[1].stage, Stage::Production);
    }

    #[test]
    fn stage_names_round_trip() {
        for stage in [Stage::None, Stage::Production, Stage::Archived] {
            assert_eq!(Stage::parse(stage.as_str()).unwrap(), stage);
        }
        assert!(Stage::parse("Staging").is_err());
    }
}
