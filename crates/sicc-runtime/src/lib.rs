//! Embedding runtime for the SICC core.
//!
//! Text normalization, the built-in hashed models, HTTP embedding drivers
//! and the cached [`embedding_service::EmbeddingService`].

pub mod embedding;
pub mod embedding_service;
pub mod hashed;
pub mod text;
