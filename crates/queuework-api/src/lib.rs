//! Queuework API Library
//!
//! HTTP handlers, application state and setup for the upload and archive
//! service. The binary in `main.rs` only loads configuration and starts it.

pub mod api_doc;
pub mod constants;
pub mod error;
pub mod handlers;
pub mod setup;
pub mod state;
pub mod telemetry;

pub use error::{ErrorResponse, HttpAppError};
pub use state::AppState;
