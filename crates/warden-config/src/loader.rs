use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::Config;

/// Resolve a configured path, expanding ~ to the home directory.
pub fn resolve_path(path: &str) -> PathBuf {
    if path.starts_with("~/") || path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.join(path.strip_prefix("~/").unwrap_or(""));
        }
    }
    PathBuf::from(path)
}

/// Find the config file by searching standard locations.
pub fn find_config_path() -> PathBuf {
    // 1. Current directory
    let local = Path::new("config.json");
    if local.exists() {
        return local.to_path_buf();
    }

    // 2. ~/.warden/config.json
    if let Some(home) = dirs::home_dir() {
        let home_config = home.join(".warden").join("config.json");
        if home_config.exists() {
            return home_config;
        }
    }

    // Default: ~/.warden/config.json (will use defaults if missing)
    dirs::home_dir()
        .map(|h| h.join(".warden").join("config.json"))
        .unwrap_or_else(|| PathBuf::from("config.json"))
}

/// Load configuration from a JSON file, then apply environment overrides.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config '{}'", path.display()))?
    } else {
        Config::default()
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Save configuration to a JSON file.
pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    let contents = serde_json::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create config directory '{}'",
                parent.to_string_lossy()
            )
        })?;
    }
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config '{}'", path.display()))?;
    Ok(())
}

/// Apply `WARDEN_API_BASE_URL`, `WARDEN_API_KEY` and `WARDEN_USE_MOCK`.
pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

fn apply_overrides_from(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(url) = lookup("WARDEN_API_BASE_URL").filter(|v| !v.is_empty()) {
        config.worker.api_base_url = url;
    }
    if let Some(key) = lookup("WARDEN_API_KEY").filter(|v| !v.is_empty()) {
        config.worker.api_key = key;
    }
    if let Some(flag) = lookup("WARDEN_USE_MOCK") {
        config.agents.use_mock =
            matches!(flag.trim().to_lowercase().as_str(), "1" | "true" | "yes");
    }
}
