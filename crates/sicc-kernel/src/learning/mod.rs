//! Transcript analysis and learning review.

pub mod heuristics;
pub mod pipeline;

pub use pipeline::{LearningPipeline, TranscriptSource, LOW_CONFIDENCE_NOTE};
