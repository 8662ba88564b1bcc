//! Configuration loading from `~/.fourd/config.toml` with defaults.
//!
//! A config may name other TOML files under `include`; those are merged
//! first, in order, and the including file overrides them. Includes must be
//! relative paths inside the config's own directory.

use crate::error::{KernelError, KernelResult};
use fourd_types::ControlConfig;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

const MAX_INCLUDE_DEPTH: u32 = 10;

/// Load the control configuration. Never fails: unreadable or invalid
/// files are logged and defaults are used. A broken include keeps the root
/// file's own settings.
pub fn load_config(path: Option<&Path>) -> ControlConfig {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return ControlConfig::default();
    }

    let mut root = match read_toml(&config_path) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to load config, using defaults");
            return ControlConfig::default();
        }
    };

    let mut visited = HashSet::new();
    visited.insert(std::fs::canonicalize(&config_path).unwrap_or_else(|_| config_path.clone()));
    let dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    if let Err(e) = merge_includes(&mut root, dir, &mut visited, 0) {
        warn!(error = %e, "Config include resolution failed, using root config only");
    }
    strip_include(&mut root);

    match root.try_into::<ControlConfig>() {
        Ok(config) => {
            info!(path = %config_path.display(), daemons = config.daemons.len(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Invalid config, using defaults");
            ControlConfig::default()
        }
    }
}

fn read_toml(path: &Path) -> KernelResult<toml::Value> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| KernelError::Config(format!("read {}: {e}", path.display())))?;
    toml::from_str(&text).map_err(|e| KernelError::Config(format!("parse {}: {e}", path.display())))
}

fn strip_include(value: &mut toml::Value) {
    if let toml::Value::Table(table) = value {
        table.remove("include");
    }
}

fn include_list(value: &toml::Value) -> Vec<String> {
    value
        .get("include")
        .and_then(toml::Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Check an include entry and resolve it to a canonical path inside `dir`.
fn resolve_include(dir: &Path, entry: &str) -> KernelResult<PathBuf> {
    let rel = Path::new(entry);
    if rel.is_absolute() {
        return Err(KernelError::Config(format!("absolute include path rejected: {entry}")));
    }
    if rel.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(KernelError::Config(format!("include path traversal rejected: {entry}")));
    }
    let canonical = std::fs::canonicalize(dir.join(rel))
        .map_err(|e| KernelError::Config(format!("include '{entry}' cannot be resolved: {e}")))?;
    let canonical_dir = std::fs::canonicalize(dir)
        .map_err(|e| KernelError::Config(format!("config dir cannot be resolved: {e}")))?;
    if !canonical.starts_with(&canonical_dir) {
        return Err(KernelError::Config(format!("include '{entry}' escapes config directory")));
    }
    Ok(canonical)
}

/// Replace `root` with its includes merged underneath it.
fn merge_includes(
    root: &mut toml::Value,
    dir: &Path,
    visited: &mut HashSet<PathBuf>,
    depth: u32,
) -> KernelResult<()> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(KernelError::Config(format!(
            "include depth exceeds {MAX_INCLUDE_DEPTH}"
        )));
    }
    let includes = include_list(root);
    if includes.is_empty() {
        return Ok(());
    }

    let mut merged = toml::Value::Table(toml::map::Map::new());
    for entry in &includes {
        let path = resolve_include(dir, entry)?;
        if !visited.insert(path.clone()) {
            return Err(KernelError::Config(format!("circular include: {entry}")));
        }
        info!(include = %entry, "Loading config include");
        let mut value = read_toml(&path)?;
        let include_dir = path.parent().unwrap_or(dir).to_path_buf();
        merge_includes(&mut value, &include_dir, visited, depth + 1)?;
        strip_include(&mut value);
        deep_merge_toml(&mut merged, &value);
    }

    strip_include(root);
    deep_merge_toml(&mut merged, root);
    *root = merged;
    Ok(())
}

/// Merge `overlay` into `base`. Tables merge key by key; any other value in
/// `overlay` replaces the one in `base`.
pub fn deep_merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(key) {
                    Some(existing) => deep_merge_toml(existing, value),
                    None => {
                        base_table.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// `~/.fourd`, or a directory under the system temp dir when there is no home.
pub fn fourd_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".fourd")
}

pub fn default_config_path() -> PathBuf {
    fourd_home().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(path: &Path, lines: &[&str]) {
        let mut f = std::fs::File::create(path).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
    }

    #[test]
    fn test_load_config_missing_file() {
        let config = load_config(Some(Path::new("/nonexistent/fourd/config.toml")));
        assert_eq!(config.name, "OMs");
        assert!(config.daemons.is_empty());
    }

    #[test]
    fn test_load_config_with_daemons() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        write(
            &path,
            &[
                "name = \"SPd\"",
                "[listener]",
                "port = 19400",
                "[daemons.CCd]",
                "host = \"10.0.0.5\"",
                "port = 19301",
                "manager = \"PMd\"",
                "dependents = [\"10.0.0.21\", \"10.0.0.22\"]",
            ],
        );
        let config = load_config(Some(&path));
        assert_eq!(config.name, "SPd");
        assert_eq!(config.listener.port, 19400);
        assert_eq!(config.listener.host, "0.0.0.0");
        let ccd = &config.daemons["CCd"];
        assert_eq!(ccd.addr(), "10.0.0.5:19301");
        assert_eq!(ccd.manager.as_deref(), Some("PMd"));
        assert_eq!(ccd.dependents.len(), 2);
    }

    #[test]
    fn test_invalid_toml_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        write(&path, &["name = ", "[listener"]);
        assert_eq!(load_config(Some(&path)).name, "OMs");
    }

    #[test]
    fn test_deep_merge_nested_tables() {
        let mut base: toml::Value = toml::from_str(
            r#"
            name = "AId"
            [retry]
            attempts = 5
            delay_ms = 100
        "#,
        )
        .unwrap();
        let overlay: toml::Value = toml::from_str(
            r#"
            [retry]
            delay_ms = 250
        "#,
        )
        .unwrap();
        deep_merge_toml(&mut base, &overlay);
        assert_eq!(base["name"].as_str(), Some("AId"));
        let retry = base["retry"].as_table().unwrap();
        assert_eq!(retry["attempts"].as_integer(), Some(5));
        assert_eq!(retry["delay_ms"].as_integer(), Some(250));
    }

    #[test]
    fn test_include_root_overrides() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("site.toml"),
            &["name = \"site\"", "[retry]", "attempts = 7"],
        );
        let root = dir.path().join("config.toml");
        write(&root, &["include = [\"site.toml\"]", "name = \"AId\""]);

        let config = load_config(Some(&root));
        assert_eq!(config.name, "AId");
        assert_eq!(config.retry.attempts, 7);
    }

    #[test]
    fn test_nested_include() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("grandchild.toml"), &["[restart]", "poll_attempts = 40"]);
        write(
            &dir.path().join("child.toml"),
            &["include = [\"grandchild.toml\"]", "name = \"child\""],
        );
        let root = dir.path().join("config.toml");
        write(&root, &["include = [\"child.toml\"]"]);

        let config = load_config(Some(&root));
        assert_eq!(config.name, "child");
        assert_eq!(config.restart.poll_attempts, 40);
    }

    #[test]
    fn test_circular_include_keeps_root() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.toml");
        write(&a, &["include = [\"b.toml\"]", "name = \"a\""]);
        write(&dir.path().join("b.toml"), &["include = [\"a.toml\"]"]);

        let config = load_config(Some(&a));
        assert_eq!(config.name, "a");
    }

    #[test]
    fn test_path_traversal_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("config.toml");
        write(&root, &["include = [\"../outside.toml\"]"]);
        assert_eq!(load_config(Some(&root)).name, "OMs");

        let err = resolve_include(dir.path(), "/etc/fourd.toml").unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn test_max_depth_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..12 {
            let path = dir.path().join(format!("level{i}.toml"));
            let name = format!("name = \"level{i}\"");
            if i < 11 {
                let include = format!("include = [\"level{}.toml\"]", i + 1);
                write(&path, &[include.as_str(), name.as_str()]);
            } else {
                write(&path, &[name.as_str()]);
            }
        }
        let config = load_config(Some(&dir.path().join("level0.toml")));
        assert_eq!(config.name, "level0");
    }

    #[test]
    fn test_default_paths() {
        assert!(default_config_path().ends_with(".fourd/config.toml"));
        assert!(fourd_home().ends_with(".fourd"));
    }
}
