//! HTTP ingress surface. See SPEC_FULL.md §1 "SUPPLEMENTAL — auth and
//! admin surface" and §4.2 for the per-protocol forwarding routes.
//!
//! Generalizes the original `api::router`/`api::proxy` HTTP layer (axum
//! `Router`, `tower_http` trace/CORS layers, `Arc<AppState>`) from the
//! orchestrator's single OpenAI-compatible surface to the full
//! Anthropic/OpenAI/Gemini inbound matrix plus the admin CRUD surface.

mod anthropic;
mod auth;
mod error_response;
mod forward_response;
mod gemini;
mod openai;
mod ops;
mod routes;
mod session;

pub use routes::{serve, AppState};
