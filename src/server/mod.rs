//! HTTP server for tellus.
//!
//! A thin axum surface over the registry: go-link redirects, tell CRUD,
//! queries, source controls, and user info. Session and authentication
//! plumbing live in the fronting proxy; the server only reads the identity
//! header it forwards.

pub mod routes;

pub use routes::{app_router, AppState, Readiness};
