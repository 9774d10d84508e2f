//! Read-only HTTP observer for a running scheduler.

pub mod routes;
pub mod server;

pub use server::{ApiState, bind, build_router, serve};
