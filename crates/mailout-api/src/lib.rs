//! Mailout API - HTTP surface
//!
//! This crate provides the public unsubscribe endpoint that mass mail links
//! point at, and the health checks used by the deployment.

pub mod handlers;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::AppState;
