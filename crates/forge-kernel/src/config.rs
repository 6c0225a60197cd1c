//! Configuration loading from `~/.forge/config.toml` with defaults.
//!
//! A config may list other TOML files under `include`; they are deep-merged
//! first and the including file overrides them. `FORGE_HOME` overrides both
//! the config location and `home_dir`.

use forge_types::config::ForgeConfig;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

/// Environment variable that relocates the Forge home directory.
pub const HOME_ENV: &str = "FORGE_HOME";

/// Maximum include nesting depth.
const MAX_INCLUDE_DEPTH: u32 = 8;

/// Load configuration from `path` (or the default location), falling back
/// to defaults with a warning when the file is unreadable or invalid.
pub fn load_config(path: Option<&Path>) -> ForgeConfig {
    let env_home = std::env::var_os(HOME_ENV).map(PathBuf::from);
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_config_path(env_home.as_deref()));

    let mut config = if config_path.exists() {
        match read_merged(&config_path).and_then(|value| {
            value
                .try_into::<ForgeConfig>()
                .map_err(|e| format!("invalid config: {e}"))
        }) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(path = %config_path.display(), error = %e, "Failed to load config, using defaults");
                ForgeConfig::default()
            }
        }
    } else {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        ForgeConfig::default()
    };

    apply_home_override(&mut config, env_home);
    config
}

/// Point `home_dir` at `home` when one is given.
pub fn apply_home_override(config: &mut ForgeConfig, home: Option<PathBuf>) {
    if let Some(home) = home.filter(|h| !h.as_os_str().is_empty()) {
        config.home_dir = home;
    }
}

/// `<home>/config.toml`, where home is `FORGE_HOME` or `~/.forge`.
pub fn default_config_path(env_home: Option<&Path>) -> PathBuf {
    match env_home {
        Some(home) if !home.as_os_str().is_empty() => home.join("config.toml"),
        _ => forge_types::config::default_home_dir().join("config.toml"),
    }
}

fn read_merged(path: &Path) -> Result<toml::Value, String> {
    let mut visited = HashSet::new();
    read_with_includes(path, &mut visited, 0)
}

fn read_with_includes(
    path: &Path,
    visited: &mut HashSet<PathBuf>,
    depth: u32,
) -> Result<toml::Value, String> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(format!("include depth exceeds {MAX_INCLUDE_DEPTH}"));
    }
    let canonical = std::fs::canonicalize(path)
        .map_err(|e| format!("cannot resolve {}: {e}", path.display()))?;
    if !visited.insert(canonical.clone()) {
        return Err(format!("circular include of {}", path.display()));
    }

    let text = std::fs::read_to_string(&canonical)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let mut value: toml::Value =
        toml::from_str(&text).map_err(|e| format!("cannot parse {}: {e}", path.display()))?;

    let includes: Vec<String> = match &mut value {
        toml::Value::Table(tbl) => match tbl.remove("include") {
            Some(toml::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    if includes.is_empty() {
        return Ok(value);
    }

    let dir = canonical.parent().unwrap_or_else(|| Path::new("."));
    let mut merged = toml::Value::Table(toml::map::Map::new());
    for include in &includes {
        let rel = Path::new(include);
        if rel.is_absolute() || rel.components().any(|c| c == Component::ParentDir) {
            return Err(format!("include must be a relative path inside the config dir: {include}"));
        }
        info!(include = %include, "Loading config include");
        let included = read_with_includes(&dir.join(rel), visited, depth + 1)?;
        deep_merge_toml(&mut merged, &included);
    }
    deep_merge_toml(&mut merged, &value);
    Ok(merged)
}

/// Deep-merge two TOML values. Tables merge key by key; anything else in
/// `overlay` replaces `base`.
pub fn deep_merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, overlay_val) in overlay_tbl {
                match base_tbl.get_mut(key) {
                    Some(base_val) => deep_merge_toml(base_val, overlay_val),
                    None => {
                        base_tbl.insert(key.clone(), overlay_val.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
