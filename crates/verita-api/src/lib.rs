//! Verita API
//!
//! HTTP surface for the analysis engine: per-media analysis status and start,
//! processor resets, and provider webhooks.

pub mod constants;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod setup;
pub mod state;

pub use error::{ErrorResponse, HttpAppError};
pub use state::AppState;
