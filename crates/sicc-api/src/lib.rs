//! HTTP shell for the SICC core.
//!
//! Thin axum routes over [`sicc_kernel::SiccKernel`]: every handler parses
//! its inputs, calls one kernel facade and maps `SiccError` kinds onto
//! status codes.

pub mod error;
pub mod rate_limiter;
pub mod routes;
pub mod server;

pub use server::{build_router, run_server};
