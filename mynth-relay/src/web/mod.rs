//! Web server module.
//!
//! Both services expose `GET /health`. The web service additionally accepts
//! `POST /send` and publishes the JSON body to the configured queue.

pub mod handlers;

pub use handlers::{health, send, AppState, HealthResponse, SendResponse};
