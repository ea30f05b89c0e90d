//! Drift detection: dataset comparison behind a pluggable test.

pub mod domain;
pub mod service;
pub mod stattest;

pub use domain::{ColumnDrift, DriftMethod, DriftReport, DriftTest, DriftVerdict};
pub use service::detect;
pub use stattest::StatTestDrift;
