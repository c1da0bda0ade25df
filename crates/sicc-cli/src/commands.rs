//! Command implementations. Each command boots an in-process kernel against
//! the configured database, runs one facade call and prints the result.

use crate::cli::*;
use crate::ui;
use chrono::{Duration, Utc};
use serde::Deserialize;
use sicc_kernel::config::{default_config_path, load_config};
use sicc_kernel::SiccKernel;
use sicc_types::agent::AgentId;
use sicc_types::config::SiccConfig;
use sicc_types::learning::{LearningId, LearningStatus, ReviewResult};
use sicc_types::memory::ChunkType;
use sicc_types::niche::{BundleMemory, BundlePattern, NicheVersionId};
use sicc_types::prompt::EnrichRequest;
use sicc_types::snapshot::SnapshotId;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

pub type CmdResult = Result<(), String>;

fn parse<T: FromStr>(entity: &str, raw: &str) -> Result<T, String> {
    raw.parse().map_err(|_| format!("invalid {entity} id: {raw}"))
}

fn parse_all<T: FromStr>(entity: &str, raw: &[String]) -> Result<Vec<T>, String> {
    raw.iter().map(|r| parse(entity, r)).collect()
}

async fn boot(config: SiccConfig) -> Result<SiccKernel, String> {
    SiccKernel::boot(config)
        .await
        .map_err(|e| format!("kernel boot failed: {e}"))
}

fn short(id: &impl ToString) -> String {
    id.to_string().chars().take(8).collect()
}

pub fn cmd_init(config_path: Option<PathBuf>, force: bool) -> CmdResult {
    let path = config_path.unwrap_or_else(default_config_path);
    if path.exists() && !force {
        ui::kv("Config", &path.display().to_string());
        ui::hint("config already exists; pass --force to overwrite");
        return Ok(());
    }
    write_default_config(&path)?;
    ui::success(&format!("Wrote {}", path.display()));
    Ok(())
}

fn write_default_config(path: &Path) -> CmdResult {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("create {}: {e}", parent.display()))?;
    }
    let body = toml::to_string_pretty(&SiccConfig::default()).map_err(|e| e.to_string())?;
    std::fs::write(path, body).map_err(|e| format!("write {}: {e}", path.display()))
}

pub async fn cmd_start(config: SiccConfig) -> CmdResult {
    let kernel = Arc::new(boot(config).await?);
    ui::section("SICC API");
    ui::kv("Listening", &kernel.config.api.listen_addr);
    ui::kv("Database", &kernel.config.database_path().display().to_string());
    sicc_api::run_server(kernel)
        .await
        .map_err(|e| format!("server failed: {e}"))
}

pub async fn cmd_agent(config: SiccConfig, json: bool, sub: AgentCommands) -> CmdResult {
    let kernel = boot(config).await?;
    match sub {
        AgentCommands::Register {
            client,
            niche,
            company,
            id,
        } => {
            let agent_id = match id {
                Some(raw) => parse::<AgentId>("agent", &raw)?,
                None => AgentId::new(),
            };
            let record = kernel
                .register_agent(agent_id, client, niche, company)
                .await
                .map_err(|e| e.to_string())?;
            if json {
                ui::json(&record);
            } else {
                ui::success(&format!("Registered agent {}", record.agent_id));
            }
        }
        AgentCommands::List { niche } => {
            let agents = kernel.list_agents(niche).await.map_err(|e| e.to_string())?;
            if json {
                ui::json(&agents);
            } else {
                let rows: Vec<Vec<String>> = agents
                    .iter()
                    .map(|a| {
                        vec![
                            a.agent_id.to_string(),
                            a.client_id.clone(),
                            a.niche_type.clone().unwrap_or_default(),
                            a.company_id.clone().unwrap_or_default(),
                        ]
                    })
                    .collect();
                ui::rows(&["AGENT", "CLIENT", "NICHE", "COMPANY"], &rows);
            }
        }
        AgentCommands::Delete { agent_id } => {
            let agent_id: AgentId = parse("agent", &agent_id)?;
            kernel.delete_agent(agent_id).await.map_err(|e| e.to_string())?;
            ui::success(&format!("Deleted agent {agent_id}"));
        }
    }
    kernel.shutdown().await;
    Ok(())
}

pub async fn cmd_memory(config: SiccConfig, json: bool, sub: MemoryCommands) -> CmdResult {
    let kernel = boot(config).await?;
    match sub {
        MemoryCommands::Add {
            agent_id,
            content,
            chunk_type,
            company,
        } => {
            let agent_id: AgentId = parse("agent", &agent_id)?;
            let chunk_type = ChunkType::from_str(&chunk_type)?;
            let id = kernel
                .add_memory(agent_id, content, chunk_type, company)
                .await
                .map_err(|e| e.to_string())?;
            if json {
                ui::json(&serde_json::json!({ "id": id }));
            } else {
                ui::success(&format!("Stored memory {id}"));
            }
        }
    }
    kernel.shutdown().await;
    Ok(())
}

pub async fn cmd_enrich(
    config: SiccConfig,
    json: bool,
    agent_id: &str,
    message: String,
    base_prompt: Option<String>,
    company: Option<String>,
) -> CmdResult {
    let agent_id: AgentId = parse("agent", agent_id)?;
    let kernel = boot(config).await?;
    let mut request = EnrichRequest {
        message,
        base_prompt,
        ..Default::default()
    };
    if let Some(company) = company {
        request
            .context
            .insert("company_id".to_string(), serde_json::Value::String(company));
    }
    let enriched = kernel.enrich_prompt(agent_id, request).await;
    if json {
        ui::json(&enriched);
    } else {
        println!("{}", enriched.enriched_prompt);
        ui::hint(&format!(
            "{} memories, {} patterns, ~{} tokens",
            enriched.memories_used.len(),
            enriched.patterns_applied.len(),
            enriched.token_count
        ));
    }
    kernel.shutdown().await;
    Ok(())
}

fn print_reviews(results: &[ReviewResult]) {
    let rows: Vec<Vec<String>> = results
        .iter()
        .map(|r| {
            vec![
                r.id.to_string(),
                if r.success { "ok".into() } else { "failed".into() },
                r.status.map(|s| s.to_string()).unwrap_or_default(),
                r.error.map(|e| e.to_string()).unwrap_or_default(),
            ]
        })
        .collect();
    ui::rows(&["LEARNING", "RESULT", "STATUS", "ERROR"], &rows);
}

pub async fn cmd_learning(config: SiccConfig, json: bool, sub: LearningCommands) -> CmdResult {
    let kernel = boot(config).await?;
    match sub {
        LearningCommands::Analyze {
            agent_id,
            hours,
            min_messages,
        } => {
            let agent_id: AgentId = parse("agent", &agent_id)?;
            let report = kernel
                .analyze_conversations(agent_id, hours, min_messages)
                .await
                .map_err(|e| e.to_string())?;
            if json {
                ui::json(&report);
            } else {
                ui::section("Analysis");
                ui::kv("Conversations", &report.conversations_analyzed.to_string());
                let rows: Vec<Vec<String>> = report
                    .candidates
                    .iter()
                    .map(|c| {
                        vec![
                            c.learning_id.map(|id| id.to_string()).unwrap_or_default(),
                            c.learning_type.to_string(),
                            c.detected_pattern.clone(),
                            format!("{:.2}", c.confidence),
                            c.status.map(|s| s.to_string()).unwrap_or_default(),
                        ]
                    })
                    .collect();
                ui::rows(&["LEARNING", "TYPE", "PATTERN", "CONF", "STATUS"], &rows);
            }
        }
        LearningCommands::List {
            agent_id,
            status,
            limit,
            offset,
        } => {
            let agent_id: AgentId = parse("agent", &agent_id)?;
            let status = status
                .as_deref()
                .map(LearningStatus::from_str)
                .transpose()?;
            let logs = kernel
                .list_learnings(agent_id, status, limit, offset)
                .await
                .map_err(|e| e.to_string())?;
            if json {
                ui::json(&logs);
            } else {
                let rows: Vec<Vec<String>> = logs
                    .iter()
                    .map(|l| {
                        vec![
                            l.id.to_string(),
                            l.learning_type.to_string(),
                            l.status.to_string(),
                            format!("{:.2}", l.confidence),
                            l.source_data.excerpt.chars().take(48).collect(),
                        ]
                    })
                    .collect();
                ui::rows(&["LEARNING", "TYPE", "STATUS", "CONF", "EXCERPT"], &rows);
            }
        }
        LearningCommands::Approve { ids, reviewer } => {
            let ids: Vec<LearningId> = parse_all("learning", &ids)?;
            let results = kernel.batch_approve(&ids, &reviewer).await;
            if json {
                ui::json(&results);
            } else {
                print_reviews(&results);
            }
        }
        LearningCommands::Reject {
            ids,
            reason,
            reviewer,
        } => {
            let ids: Vec<LearningId> = parse_all("learning", &ids)?;
            let results = kernel.batch_reject(&ids, &reviewer, &reason).await;
            if json {
                ui::json(&results);
            } else {
                print_reviews(&results);
            }
        }
    }
    kernel.shutdown().await;
    Ok(())
}

pub async fn cmd_metrics(
    config: SiccConfig,
    json: bool,
    agent_id: &str,
    days: u32,
    velocity_window: u32,
) -> CmdResult {
    let agent_id: AgentId = parse("agent", agent_id)?;
    let kernel = boot(config).await?;
    let to = Utc::now().date_naive();
    let from = to - Duration::days(i64::from(days.max(1)) - 1);
    let aggregated = kernel
        .metrics(agent_id, from, to)
        .await
        .map_err(|e| e.to_string())?;
    let velocity = kernel
        .learning_velocity(agent_id, velocity_window)
        .await
        .map_err(|e| e.to_string())?;
    if json {
        ui::json(&serde_json::json!({
            "from": from,
            "to": to,
            "aggregated": aggregated,
            "learning_velocity": velocity,
        }));
    } else {
        ui::section(&format!("Metrics {from} .. {to}"));
        ui::kv("Interactions", &aggregated.total_interactions.to_string());
        ui::kv("Success rate", &format!("{:.1}%", aggregated.success_rate * 100.0));
        ui::kv("Memories used", &aggregated.memory_chunks_used.to_string());
        ui::kv("Patterns", &aggregated.patterns_applied.to_string());
        ui::kv("Learnings", &aggregated.new_learnings.to_string());
        ui::kv("Avg reply", &format!("{:.0} ms", aggregated.avg_response_time_ms));
        if let Some(satisfaction) = aggregated.avg_satisfaction {
            ui::kv("Satisfaction", &format!("{satisfaction:.2}"));
        }
        ui::kv(
            "Velocity",
            &format!("{velocity:.3} learnings/interaction ({velocity_window}d)"),
        );
    }
    kernel.shutdown().await;
    Ok(())
}

/// JSON bundle accepted by `sicc niche create`.
#[derive(Debug, Deserialize)]
struct BundleFile {
    niche_type: String,
    #[serde(default)]
    version_name: Option<String>,
    #[serde(default)]
    memories: Vec<BundleMemory>,
    #[serde(default)]
    patterns: Vec<BundlePattern>,
}

fn read_bundle(path: &Path) -> Result<BundleFile, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| format!("read {}: {e}", path.display()))?;
    serde_json::from_str(&raw).map_err(|e| format!("parse {}: {e}", path.display()))
}

fn targets(agents: &[String]) -> Result<Option<Vec<AgentId>>, String> {
    if agents.is_empty() {
        Ok(None)
    } else {
        parse_all("agent", agents).map(Some)
    }
}

pub async fn cmd_niche(config: SiccConfig, json: bool, sub: NicheCommands) -> CmdResult {
    // Parse inputs before booting so a bad file never opens the database.
    let bundle = match &sub {
        NicheCommands::Create { file } => Some(read_bundle(file)?),
        _ => None,
    };
    let kernel = boot(config).await?;
    match sub {
        NicheCommands::Create { .. } => {
            let Some(bundle) = bundle else {
                return Err("missing bundle".to_string());
            };
            let version = kernel
                .create_niche_version(
                    bundle.niche_type,
                    bundle.version_name,
                    bundle.memories,
                    bundle.patterns,
                )
                .await
                .map_err(|e| e.to_string())?;
            if json {
                ui::json(&version);
            } else {
                ui::success(&format!(
                    "Created {} version {} ({})",
                    version.niche_type, version.version_name, version.id
                ));
            }
        }
        NicheCommands::List { niche } => {
            let versions = kernel
                .list_niche_versions(niche)
                .await
                .map_err(|e| e.to_string())?;
            if json {
                ui::json(&versions);
            } else {
                let rows: Vec<Vec<String>> = versions
                    .iter()
                    .map(|v| {
                        vec![
                            v.id.to_string(),
                            v.niche_type.clone(),
                            v.version_name.clone(),
                            ui::label(&v.status),
                            if v.is_active { "*".into() } else { String::new() },
                            format!("{}/{}", v.memories.len(), v.patterns.len()),
                        ]
                    })
                    .collect();
                ui::rows(&["VERSION", "NICHE", "NAME", "STATUS", "ACTIVE", "MEM/PAT"], &rows);
            }
        }
        NicheCommands::Propagate {
            version_id,
            agents,
            no_snapshots,
        } => {
            let version_id: NicheVersionId = parse("niche version", &version_id)?;
            let report = kernel
                .propagate(version_id, targets(&agents)?, !no_snapshots)
                .await
                .map_err(|e| e.to_string())?;
            if json {
                ui::json(&report);
            } else {
                let rows: Vec<Vec<String>> = report
                    .agents
                    .iter()
                    .map(|a| {
                        vec![
                            a.agent_id.to_string(),
                            ui::label(&a.status),
                            a.snapshot_id.as_ref().map(short).unwrap_or_default(),
                            a.error.clone().unwrap_or_default(),
                        ]
                    })
                    .collect();
                ui::rows(&["AGENT", "STATUS", "SNAPSHOT", "ERROR"], &rows);
            }
        }
        NicheCommands::Rollback { version_id, agents } => {
            let version_id: NicheVersionId = parse("niche version", &version_id)?;
            let report = kernel
                .rollback(version_id, targets(&agents)?)
                .await
                .map_err(|e| e.to_string())?;
            if json {
                ui::json(&report);
            } else {
                let rows: Vec<Vec<String>> = report
                    .agents
                    .iter()
                    .map(|a| {
                        vec![
                            a.agent_id.to_string(),
                            ui::label(&a.status),
                            a.restored_snapshot.to_string(),
                            a.rows_deleted.to_string(),
                            a.error.clone().unwrap_or_default(),
                        ]
                    })
                    .collect();
                ui::rows(&["AGENT", "STATUS", "RESTORED", "DELETED", "ERROR"], &rows);
            }
        }
    }
    kernel.shutdown().await;
    Ok(())
}

pub async fn cmd_snapshot(config: SiccConfig, json: bool, sub: SnapshotCommands) -> CmdResult {
    let kernel = boot(config).await?;
    match sub {
        SnapshotCommands::Create { agent_id, name } => {
            let agent_id: AgentId = parse("agent", &agent_id)?;
            let snapshot = kernel
                .create_snapshot(agent_id, name, Default::default())
                .await
                .map_err(|e| e.to_string())?;
            if json {
                ui::json(&snapshot);
            } else {
                ui::success(&format!(
                    "Snapshot {} ({} memories, {} patterns)",
                    snapshot.id, snapshot.memory_count, snapshot.pattern_count
                ));
            }
        }
        SnapshotCommands::List { agent_id } => {
            let agent_id: AgentId = parse("agent", &agent_id)?;
            let snapshots = kernel
                .list_snapshots(agent_id)
                .await
                .map_err(|e| e.to_string())?;
            if json {
                ui::json(&snapshots);
            } else {
                let rows: Vec<Vec<String>> = snapshots
                    .iter()
                    .map(|s| {
                        vec![
                            s.id.to_string(),
                            s.name.clone(),
                            s.kind().unwrap_or("manual").to_string(),
                            format!("{}/{}", s.memory_count, s.pattern_count),
                            s.created_at.format("%Y-%m-%d %H:%M").to_string(),
                        ]
                    })
                    .collect();
                ui::rows(&["SNAPSHOT", "NAME", "TYPE", "MEM/PAT", "CREATED"], &rows);
            }
        }
        SnapshotCommands::Restore { snapshot_id } => {
            let snapshot_id: SnapshotId = parse("snapshot", &snapshot_id)?;
            let report = kernel
                .restore_snapshot(snapshot_id)
                .await
                .map_err(|e| e.to_string())?;
            if json {
                ui::json(&report);
            } else {
                ui::success(&format!(
                    "Restored {} memories and {} patterns for agent {}",
                    report.memories_restored, report.patterns_restored, report.agent_id
                ));
            }
        }
    }
    kernel.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_writes_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        cmd_init(Some(path.clone()), false).unwrap();
        assert!(path.exists());
        assert_eq!(load_config(Some(path.as_path())), SiccConfig::default());

        std::fs::write(&path, "log_level = \"debug\"\n").unwrap();
        cmd_init(Some(path.clone()), false).unwrap();
        assert_eq!(load_config(Some(path.as_path())).log_level, "debug");
    }

    #[test]
    fn test_targets_default_to_none() {
        assert_eq!(targets(&[]).unwrap(), None);
        assert!(targets(&["nope".to_string()]).is_err());
    }

    #[test]
    fn test_bundle_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.json");
        std::fs::write(
            &path,
            r#"{ "niche_type": "mmn", "memories": [{ "content": "Bônus todo dia 10" }] }"#,
        )
        .unwrap();
        let bundle = read_bundle(&path).unwrap();
        assert_eq!(bundle.niche_type, "mmn");
        assert_eq!(bundle.memories.len(), 1);
        assert!(bundle.patterns.is_empty());
        assert!(bundle.version_name.is_none());
    }
}
