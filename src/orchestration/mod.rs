//! Retraining orchestration and its notification side effect.

pub mod notify;
pub mod service;

pub use notify::{LogNotifier, Notifier, TelegramNotifier};
pub use service::{RetrainOutcome, RetrainingOrchestrator};
