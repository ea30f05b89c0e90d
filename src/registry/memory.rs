//! In-process registry with a single-writer lock per model name.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::error::Result;
use crate::common::ids::RunId;
use crate::common::time::now_utc;

use super::domain::{apply_promotion, ModelRegistry, PromotionResult, RegistryEntry, Stage};

type Versions = Arc<Mutex<Vec<RegistryEntry>>>;

#[derive(Default)]
pub struct MemoryRegistry {
    models: Mutex<HashMap<String, Versions>>,
}

impl MemoryRegistry {
    /// Lock slot for one model name; the outer map lock is held only to look
    /// it up.
    fn versions(&self, model_name: &str) -> Versions {
        self.models
            .lock()
            .entry(model_name.to_string())
            .or_default()
            .clone()
    }
}

fn push_version(versions: &mut Vec<RegistryEntry>, model_name: &str, source_run_id: &RunId) -> RegistryEntry {
    let next = versions.iter().map(|e| e.version).max().unwrap_or(0) + 1;
    let entry = RegistryEntry {
        model_name: model_name.to_string(),
        version: next,
        stage: Stage::None,
        source_run_id: source_run_id.clone(),
        created_at: now_utc(),
    };
    versions.push(entry.clone());
    entry
}

impl ModelRegistry for MemoryRegistry {
    fn register(&self, model_name: &str, source_run_id: &RunId) -> Result<RegistryEntry> {
        let slot = self.versions(model_name);
        let mut versions = slot.lock();
        Ok(push_version(&mut versions, model_name, source_run_id))
    }

    fn publish(&self, model_name: &str, source_run_id: &RunId) -> Result<PromotionResult> {
        let slot = self.versions(model_name);
        let mut versions = slot.lock();
        if let Some(active) = versions
            .iter()
            .find(|e| e.stage == Stage::Production && &e.source_run_id == source_run_id)
        {
            return Ok(PromotionResult::AlreadyActive {
                entry: active.clone(),
            });
        }
        let entry = push_version(&mut versions, model_name, source_run_id);
        apply_promotion(model_name, &mut versions, entry.version)
    }

    fn promote(&self, model_name: &str, version: u32) -> Result<PromotionResult> {
        let slot = self.versions(model_name);
        let mut versions = slot.lock();
        apply_promotion(model_name, &mut versions, version)
    }

    fn get_active(&self, model_name: &str) -> Result<Option<RegistryEntry>> {
        let slot = self.versions(model_name);
        let versions = slot.lock();
        Ok(versions.iter().find(|e| e.stage == Stage::Production).cloned())
    }

    fn list_versions(&self, model_name: &str) -> Result<Vec<RegistryEntry>> {
        let slot = self.versions(model_name);
        let versions = slot.lock();
        Ok(versions.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    #[derive(Clone, Debug)]
    enum Op {
        Register,
        Promote(u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Register), (1u32..8).prop_map(Op::Promote)]
    }

    proptest! {
        #[test]
        fn at_most_one_production(ops in prop::collection::vec(op(), 1..40)) {
            let registry = MemoryRegistry::default();
            for op in ops {
                match op {
                    Op::Register => {
                        registry.register("m", &RunId::generate()).unwrap();
                    }
                    Op::Promote(v) => {
                        let _ = registry.promote("m", v);
                    }
                }
                let live = registry
                    .list_versions("m")
                    .unwrap()
                    .iter()
                    .filter(|e| e.stage == Stage::Production)
                    .count();
                prop_assert!(live <= 1);
            }
        }
    }

    #[test]
    fn repeat_promotion_is_a_no_op() {
        let registry = MemoryRegistry::default();
        registry.register("m", &RunId::new("a")).unwrap();
        registry.promote("m", 1).unwrap();
        let again = registry.promote("m", 1).unwrap();
        assert!(matches!(again, PromotionResult::AlreadyActive { .. }));
        let stages: Vec<Stage> = registry.list_versions("m").unwrap().iter().map(|e| e.stage).collect();
        assert_eq!(stages, vec![Stage::Production]);
    }

    #[test]
    fn concurrent_promotions_leave_one_winner() {
        let registry = Arc::new(MemoryRegistry::default());
        for _ in 0..8 {
            registry.register("m", &RunId::generate()).unwrap();
        }
        let handles: Vec<_> = (1..=8)
            .map(|v| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.promote("m", v))
            })
            .collect();
        for handle in handles {
            let _ = handle.join().unwrap();
        }
        let versions = registry.list_versions("m").unwrap();
        assert_eq!(versions.iter().filter(|e| e.stage == Stage::Production).count(), 1);
    }

    #[test]
    fn racing_publishers_of_one_run_add_one_version() {
        let registry = Arc::new(MemoryRegistry::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.publish("m", &RunId::new("winner")))
            })
            .collect();
        let promoted = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .filter(|r| matches!(r, PromotionResult::Promoted { .. }))
            .count();
        assert_eq!(promoted, 1);
        let versions = registry.list_versions("m").unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].stage, Stage::Production);
    }

    #[test]
    fn names_are_independent() {
        let registry = MemoryRegistry::default();
        let a = registry.register("a", &RunId::new("x")).unwrap();
        let b = registry.register("b", &RunId::new("y")).unwrap();
        assert_eq!((a.version, b.version), (1, 1));
        registry.promote("a", 1).unwrap();
        assert!(registry.get_active("b").unwrap().is_none());
    }
}
