//! External entry points: the HTTP prediction service.

pub mod http;

pub use http::{router, serve, AppState};
