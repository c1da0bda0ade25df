//! Core kernel of the SICC learning loop.
//!
//! Ties the durable stores and the embedding service together: layered
//! knowledge resolution, prompt enrichment, niche propagation, transcript
//! analysis and the background workers that keep agents within quota.

pub mod background;
pub mod blocking;
pub mod config;
pub mod error;
pub mod kernel;
pub mod layers;
pub mod learning;
pub mod locks;
pub mod orchestrator;
pub mod propagation;

pub use kernel::SiccKernel;
