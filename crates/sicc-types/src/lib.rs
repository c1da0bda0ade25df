//! Core types for the SICC (Sub-Intelligent Continuous Corporation) core.
//!
//! This crate defines the shared data model used by the memory store, the
//! embedding runtime, the kernel and the HTTP shell. It contains no storage
//! or scheduling logic.

pub mod agent;
pub mod config;
pub mod error;
pub mod learning;
pub mod memory;
pub mod metrics;
pub mod niche;
pub mod pattern;
pub mod prompt;
pub mod snapshot;
pub mod transcript;
