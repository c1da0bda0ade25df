//! Memory substrate for the SICC core.
//!
//! Every durable entity lives in one SQLite database shared by a set of
//! small stores:
//! - **Memory store**: memory chunks with embeddings, similarity search, usage counters
//! - **Behavior store**: behavioral patterns with trigger matching and success tracking
//! - **Learning store**: candidate learnings and their review trail
//! - **Metrics store**: per-agent, per-day counters
//! - **Snapshot store**: frozen copies of an agent's knowledge
//! - **Niche store**: base knowledge bundles and the propagation ledger
//! - **Agent and conversation stores**: registry and transcripts
//!
//! Stores are synchronous and cheap to clone; [`SiccSubstrate`] wires them
//! together over a single connection.

pub mod behavior;
pub mod consolidation;
pub mod learning;
pub mod metrics;
pub mod migration;
pub mod niche;
pub mod registry;
pub mod semantic;
pub mod session;
pub mod snapshot;

mod sql;
mod substrate;
pub use substrate::SiccSubstrate;
