//! In-process run history, for tests and one-shot CLI runs.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::common::error::Result;
use crate::common::ids::RunId;

use super::domain::{RunHistory, RunRecord, SearchRun, SkippedCandidate};
use super::service::rank;

#[derive(Default)]
struct Inner {
    searches: Vec<SearchRun>,
    records: Vec<RunRecord>,
    skipped: HashMap<RunId, Vec<SkippedCandidate>>,
}

#[derive(Default)]
pub struct MemoryRunHistory {
    inner: RwLock<Inner>,
}

impl MemoryRunHistory {
    /// Skips recorded under one search.
    pub fn skipped(&self, parent: &RunId) -> Vec<SkippedCandidate> {
        self.inner.read().skipped.get(parent).cloned().unwrap_or_default()
    }

    pub fn searches(&self) -> Vec<SearchRun> {
        self.inner.read().searches.clone()
    }
}

impl RunHistory for MemoryRunHistory {
    fn open_search(&self, run: &SearchRun) -> Result<()> {
        self.inner.write().searches.push(run.clone());
        Ok(())
    }

    fn append(&self, record: &RunRecord) -> Result<()> {
        self.inner.write().records.push(record.clone());
        Ok(())
    }

    fn record_skip(&self, parent: &RunId, skipped: &SkippedCandidate) -> Result<()> {
        self.inner
            .write()
            .skipped
            .entry(parent.clone())
            .or_default()
            .push(skipped.clone());
        Ok(())
    }

    fn top_by_score(&self, experiment: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let mut hits: Vec<RunRecord> = self
            .inner
            .read()
            .records
            .iter()
            .filter(|r| r.experiment == experiment)
            .cloned()
            .collect();
        hits.sort_by(rank);
        hits.truncate(limit);
        Ok(hits)
    }

    fn get(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        Ok(self
            .inner
            .read()
            .records
            .iter()
            .find(|r| &r.run_id == run_id)
            .cloned())
    }
}
