//! SICC CLI: command-line interface for the SICC learning core.
//!
//! `sicc start` serves the HTTP API. Every other command boots an
//! in-process kernel against the configured database (single-shot mode).

mod cli;
mod commands;
mod ui;

use crate::cli::*;
use clap::Parser;
use sicc_kernel::config::load_config;
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins; otherwise the configured level.
fn init_tracing_stderr(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        init_tracing_stderr("warn");
        exit_on_error(commands::cmd_init(cli.config, force));
        return;
    }

    // Logging starts before the config load so include warnings are visible.
    let level = match cli.command {
        Commands::Start => None,
        _ => Some("warn"),
    };
    let config = {
        let peek = load_config_quiet(cli.config.as_deref());
        init_tracing_stderr(level.unwrap_or(peek.log_level.as_str()));
        load_config(cli.config.as_deref())
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            ui::error(&format!("cannot start async runtime: {e}"));
            std::process::exit(1);
        }
    };

    let json = cli.json;
    let result = runtime.block_on(async move {
        match cli.command {
            Commands::Init { .. } => Ok(()),
            Commands::Start => commands::cmd_start(config).await,
            Commands::Agent(sub) => commands::cmd_agent(config, json, sub).await,
            Commands::Memory(sub) => commands::cmd_memory(config, json, sub).await,
            Commands::Enrich {
                agent_id,
                message,
                base_prompt,
                company,
            } => commands::cmd_enrich(config, json, &agent_id, message, base_prompt, company).await,
            Commands::Learning(sub) => commands::cmd_learning(config, json, sub).await,
            Commands::Metrics {
                agent_id,
                days,
                velocity_window,
            } => commands::cmd_metrics(config, json, &agent_id, days, velocity_window).await,
            Commands::Niche(sub) => commands::cmd_niche(config, json, sub).await,
            Commands::Snapshot(sub) => commands::cmd_snapshot(config, json, sub).await,
        }
    });
    exit_on_error(result);
}

/// Read only `log_level`, without logging, so the subscriber can be
/// configured before the real load.
fn load_config_quiet(path: Option<&std::path::Path>) -> sicc_types::config::SiccConfig {
    let path = path
        .map(std::path::Path::to_path_buf)
        .unwrap_or_else(sicc_kernel::config::default_config_path);
    std::fs::read_to_string(&path)
        .ok()
        .and_then(|raw| toml::from_str(&raw).ok())
        .unwrap_or_default()
}

fn exit_on_error(result: commands::CmdResult) {
    if let Err(e) = result {
        ui::error(&e);
        std::process::exit(1);
    }
}
