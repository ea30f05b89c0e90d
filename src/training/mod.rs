//! Candidate training, scoring, run history and best-run selection.

pub mod domain;
pub mod kmeans;
pub mod memory;
pub mod repo_sqlite;
pub mod score;
pub mod service;
pub mod workers;

pub use domain::{Candidate, ClusterModel, Clusterer, RunHistory, RunRecord, SearchResult, SearchRun};
pub use kmeans::KMeans;
pub use service::{search, select_best, select_best_from_history, SearchSpec};
