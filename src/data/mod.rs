//! Data domain: datasets, time windows, ingestion and feature tables.

pub mod domain;
pub mod repo_sqlite;
pub mod service;
pub mod synth;

pub use domain::{
    Dataset, DatasetId, FeatureVector, KeyStrategy, Record, RowKey, ScoringRow, ScoringTable,
    TimeWindow, FEATURE_COLUMNS, N_FEATURES,
};
pub use repo_sqlite::SqliteFeatureTable;
