//! Clap CLI definitions for SICC.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  sicc init                                  Write a default config file
  sicc start                                 Serve the HTTP API
  sicc agent register --client acme --niche clinica
  sicc memory add <AGENT> \"Consultas duram 30 minutos\" --type process
  sicc enrich <AGENT> \"Quanto duram as consultas?\"
  sicc learning analyze <AGENT>              Mine recent conversations
  sicc learning approve <LEARNING>...        Consolidate candidates
  sicc niche create bundle.json              Create a niche version
  sicc niche propagate <VERSION>             Push it to every niche agent";

/// SICC: continuous learning core for conversational agents.
#[derive(Parser)]
#[command(
    name = "sicc",
    version,
    about = "SICC: continuous learning core for conversational agents",
    after_help = AFTER_HELP,
)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print JSON instead of tables.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default config file (keeps an existing one).
    Init {
        /// Overwrite an existing config file.
        #[arg(long)]
        force: bool,
    },
    /// Serve the HTTP API with the background workers.
    Start,
    /// Manage agents [*].
    #[command(subcommand)]
    Agent(AgentCommands),
    /// Manage memories [*].
    #[command(subcommand)]
    Memory(MemoryCommands),
    /// Enrich a message with the agent's knowledge and print the prompt.
    Enrich {
        /// Agent ID.
        agent_id: String,
        /// Message to enrich.
        message: String,
        /// Base system prompt.
        #[arg(long)]
        base_prompt: Option<String>,
        /// Company whose knowledge applies.
        #[arg(long)]
        company: Option<String>,
    },
    /// Conversation analysis and learning review [*].
    #[command(subcommand)]
    Learning(LearningCommands),
    /// Show aggregated metrics and learning velocity.
    Metrics {
        /// Agent ID.
        agent_id: String,
        /// Days to aggregate, ending today.
        #[arg(long, default_value_t = 30)]
        days: u32,
        /// Window for learning velocity.
        #[arg(long, default_value_t = 7)]
        velocity_window: u32,
    },
    /// Niche versions and propagation [*].
    #[command(subcommand)]
    Niche(NicheCommands),
    /// Agent snapshots [*].
    #[command(subcommand)]
    Snapshot(SnapshotCommands),
}

#[derive(Subcommand)]
pub enum AgentCommands {
    /// Register an agent.
    Register {
        /// Owning client.
        #[arg(long)]
        client: String,
        /// Niche tag used for propagation.
        #[arg(long)]
        niche: Option<String>,
        /// Company the agent serves.
        #[arg(long)]
        company: Option<String>,
        /// Use this agent ID instead of a fresh one.
        #[arg(long)]
        id: Option<String>,
    },
    /// List registered agents.
    List {
        /// Only agents of this niche.
        #[arg(long)]
        niche: Option<String>,
    },
    /// Delete an agent and everything it owns.
    Delete {
        /// Agent ID.
        agent_id: String,
    },
}

#[derive(Subcommand)]
pub enum MemoryCommands {
    /// Embed and store a memory.
    Add {
        /// Agent ID.
        agent_id: String,
        /// Memory content.
        content: String,
        /// Chunk type (faq, product, process, business_term, ...).
        #[arg(long = "type", default_value = "faq")]
        chunk_type: String,
        /// Store at the company layer for this company.
        #[arg(long)]
        company: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum LearningCommands {
    /// Analyze recent conversations and record candidates.
    Analyze {
        /// Agent ID.
        agent_id: String,
        /// Look-back window in hours.
        #[arg(long)]
        hours: Option<u32>,
        /// Skip conversations shorter than this.
        #[arg(long)]
        min_messages: Option<usize>,
    },
    /// List learning logs.
    List {
        /// Agent ID.
        agent_id: String,
        /// Only this status (pending, approved, rejected, applied).
        #[arg(long)]
        status: Option<String>,
        /// Page size.
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Page offset.
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Approve and consolidate learnings.
    Approve {
        /// Learning IDs.
        #[arg(required = true)]
        ids: Vec<String>,
        /// Reviewer recorded on the log.
        #[arg(long, default_value = "cli")]
        reviewer: String,
    },
    /// Reject learnings.
    Reject {
        /// Learning IDs.
        #[arg(required = true)]
        ids: Vec<String>,
        /// Rejection reason.
        #[arg(long, default_value = "")]
        reason: String,
        /// Reviewer recorded on the log.
        #[arg(long, default_value = "cli")]
        reviewer: String,
    },
}

#[derive(Subcommand)]
pub enum NicheCommands {
    /// Create a niche version from a JSON bundle file.
    Create {
        /// File with `niche_type`, `version_name`, `memories` and `patterns`.
        file: PathBuf,
    },
    /// List niche versions.
    List {
        /// Only versions of this niche.
        #[arg(long)]
        niche: Option<String>,
    },
    /// Propagate a version to its niche's agents.
    Propagate {
        /// Version ID.
        version_id: String,
        /// Target agents (defaults to every agent of the niche).
        #[arg(long = "agent")]
        agents: Vec<String>,
        /// Skip the pre-propagation snapshots.
        #[arg(long)]
        no_snapshots: bool,
    },
    /// Roll a version back.
    Rollback {
        /// Version ID.
        version_id: String,
        /// Target agents (defaults to every agent that received it).
        #[arg(long = "agent")]
        agents: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum SnapshotCommands {
    /// Capture an agent's active knowledge.
    Create {
        /// Agent ID.
        agent_id: String,
        /// Snapshot name.
        name: String,
    },
    /// List an agent's snapshots.
    List {
        /// Agent ID.
        agent_id: String,
    },
    /// Restore a snapshot.
    Restore {
        /// Snapshot ID.
        snapshot_id: String,
    },
}
