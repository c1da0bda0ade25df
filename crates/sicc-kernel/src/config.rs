//! Configuration loading from `~/.sicc/config.toml` with defaults.
//!
//! A file may list other TOML files under `include = [...]`. Includes are
//! merged in order and the including file overrides them. Include paths are
//! relative to the including file, never absolute, never contain `..`, and
//! may nest at most [`MAX_INCLUDE_DEPTH`] levels without cycles.

use sicc_types::config::{sicc_home, SiccConfig};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

/// Maximum include nesting depth.
pub const MAX_INCLUDE_DEPTH: u32 = 10;

const INCLUDE_KEY: &str = "include";

/// Load configuration, falling back to defaults when the file is missing
/// or cannot be used. A broken include drops the includes, not the root file.
pub fn load_config(path: Option<&Path>) -> SiccConfig {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        info!(path = %path.display(), "Config file not found, using defaults");
        return SiccConfig::default();
    }
    match read_config(&path) {
        Ok(config) => {
            info!(path = %path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unusable config file, using defaults");
            SiccConfig::default()
        }
    }
}

fn read_config(path: &Path) -> Result<SiccConfig, String> {
    let mut root = parse_file(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let mut visited = HashSet::from([canonical]);
    if let Err(e) = merge_includes(&mut root, &dir, &mut visited, 0) {
        warn!(error = %e, "Config include resolution failed, using root config only");
    }
    strip_includes(&mut root);
    root.try_into::<SiccConfig>().map_err(|e| e.to_string())
}

fn parse_file(path: &Path) -> Result<toml::Value, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| format!("read {}: {e}", path.display()))?;
    toml::from_str(&raw).map_err(|e| format!("parse {}: {e}", path.display()))
}

fn strip_includes(value: &mut toml::Value) {
    if let toml::Value::Table(table) = value {
        table.remove(INCLUDE_KEY);
    }
}

fn include_list(value: &toml::Value) -> Vec<String> {
    value
        .get(INCLUDE_KEY)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Resolve one include entry to a canonical path inside `dir`.
fn resolve_include(dir: &Path, entry: &str) -> Result<PathBuf, String> {
    let relative = Path::new(entry);
    if relative.is_absolute() {
        return Err(format!("include '{entry}' is an absolute path"));
    }
    if relative.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(format!("include '{entry}' leaves the config directory"));
    }
    let resolved = std::fs::canonicalize(dir.join(relative))
        .map_err(|e| format!("include '{entry}' cannot be resolved: {e}"))?;
    let root = std::fs::canonicalize(dir).map_err(|e| format!("config dir: {e}"))?;
    if !resolved.starts_with(&root) {
        return Err(format!("include '{entry}' leaves the config directory"));
    }
    Ok(resolved)
}

/// Replace `value` with its includes merged underneath it.
fn merge_includes(
    value: &mut toml::Value,
    dir: &Path,
    visited: &mut HashSet<PathBuf>,
    depth: u32,
) -> Result<(), String> {
    let includes = include_list(value);
    if includes.is_empty() {
        return Ok(());
    }
    if depth >= MAX_INCLUDE_DEPTH {
        return Err(format!("includes nest deeper than {MAX_INCLUDE_DEPTH} levels"));
    }

    let mut merged = toml::Value::Table(toml::map::Map::new());
    for entry in &includes {
        let path = resolve_include(dir, entry)?;
        if !visited.insert(path.clone()) {
            return Err(format!("include cycle through '{entry}'"));
        }
        info!(include = %entry, "Loading config include");
        let mut included = parse_file(&path)?;
        let include_dir = path.parent().unwrap_or(dir).to_path_buf();
        merge_includes(&mut included, &include_dir, visited, depth + 1)?;
        strip_includes(&mut included);
        deep_merge_toml(&mut merged, &included);
    }

    strip_includes(value);
    deep_merge_toml(&mut merged, value);
    *value = merged;
    Ok(())
}

/// Deep-merge two TOML values. Tables merge key by key; anything else in
/// `overlay` replaces the value in `base`.
pub fn deep_merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => deep_merge_toml(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// `~/.sicc/config.toml`.
pub fn default_config_path() -> PathBuf {
    sicc_home().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/sicc/config.toml")));
        assert_eq!(config, SiccConfig::default());
    }

    #[test]
    fn test_sections_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "config.toml",
            "log_level = \"debug\"\n[learning]\nmin_term_frequency = 5\n",
        );
        let config = load_config(Some(&path));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.learning.min_term_frequency, 5);
        assert_eq!(config.orchestrator.top_k, 10);
    }

    #[test]
    fn test_invalid_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "config.toml", "[orchestrator]\ntop_k = \"ten\"\n");
        assert_eq!(load_config(Some(&path)), SiccConfig::default());
    }

    #[test]
    fn test_deep_merge_nested_tables() {
        let mut base: toml::Value =
            toml::from_str("[memory]\nmax_content_bytes = 1024\nagent_memory_quota = 50\n").unwrap();
        let overlay: toml::Value = toml::from_str("[memory]\nagent_memory_quota = 99\n").unwrap();
        deep_merge_toml(&mut base, &overlay);
        let memory = base["memory"].as_table().unwrap();
        assert_eq!(memory["max_content_bytes"].as_integer(), Some(1024));
        assert_eq!(memory["agent_memory_quota"].as_integer(), Some(99));
    }

    #[test]
    fn test_root_overrides_include() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "shared.toml",
            "log_level = \"trace\"\n[api]\nlisten_addr = \"0.0.0.0:9000\"\n",
        );
        let root = write(
            dir.path(),
            "config.toml",
            "include = [\"shared.toml\"]\nlog_level = \"warn\"\n",
        );
        let config = load_config(Some(&root));
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.api.listen_addr, "0.0.0.0:9000");
    }

    #[test]
    fn test_nested_includes_merge_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "inner.toml", "[orchestrator]\ntop_k = 3\nmax_tokens = 100\n");
        write(
            dir.path(),
            "outer.toml",
            "include = [\"inner.toml\"]\n[orchestrator]\ntop_k = 4\n",
        );
        let root = write(dir.path(), "config.toml", "include = [\"outer.toml\"]\n");
        let config = load_config(Some(&root));
        assert_eq!(config.orchestrator.top_k, 4);
        assert_eq!(config.orchestrator.max_tokens, 100);
    }

    #[test]
    fn test_bad_includes_keep_root_values() {
        let dir = tempfile::tempdir().unwrap();
        for include in ["/etc/passwd", "../outside.toml", "missing.toml"] {
            let root = write(
                dir.path(),
                "config.toml",
                &format!("include = [\"{include}\"]\nlog_level = \"error\"\n"),
            );
            assert_eq!(load_config(Some(&root)).log_level, "error", "include {include}");
        }
    }

    #[test]
    fn test_include_cycle_detected() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.toml", "include = [\"b.toml\"]\nlog_level = \"debug\"\n");
        write(dir.path(), "b.toml", "include = [\"a.toml\"]\nlog_level = \"trace\"\n");
        assert_eq!(load_config(Some(&a)).log_level, "debug");
    }

    #[test]
    fn test_include_depth_limited() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..12 {
            let include = if i < 11 {
                format!("include = [\"level{}.toml\"]\n", i + 1)
            } else {
                String::new()
            };
            write(
                dir.path(),
                &format!("level{i}.toml"),
                &format!("{include}[api]\nrate_limit_per_minute = {}\n", 100 + i),
            );
        }
        let config = load_config(Some(&dir.path().join("level0.toml")));
        // The chain is dropped; the root's own value survives.
        assert_eq!(config.api.rate_limit_per_minute, 100);
    }
}
