//! # Greeter Gateway
//!
//! Read-only HTTP views over the pipeline for operators: health, per-scheduler
//! run stats, message counts, queue depth and breaker state.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
