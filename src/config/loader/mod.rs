use crate::config::Config;
use crate::utils::get_cowork_home;
use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs;
use std::path::{Path, PathBuf};

#[allow(unused_imports)]
use tracing::warn;

#[cfg(test)]
mod tests;

pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_cowork_home()?.join("config.json"))
}

/// (config field description, env var) overrides applied after file load.
/// Lets secrets be injected without touching the config file (containers, CI).
fn apply_env_overrides(config: &mut Config) {
    let overrides: &mut [(&str, &mut String)] = &mut [
        ("COWORK_PROVIDER_API_KEY", &mut config.provider.api_key),
        ("COWORK_HOOKS_TOKEN", &mut config.hooks.token),
    ];
    for (var, field) in overrides.iter_mut() {
        if let Ok(val) = std::env::var(var)
            && !val.is_empty()
        {
            **field = val;
        }
    }
    if let Ok(val) = std::env::var("COWORK_CONTROL_TOKEN")
        && !val.is_empty()
    {
        if let Some(first) = config.control.tokens.first_mut() {
            first.token = val;
        } else {
            config.control.tokens.push(crate::config::ControlTokenConfig {
                token: val,
                scopes: vec!["admin".to_string()],
            });
        }
    }
}

pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let default_path = get_config_path().unwrap_or_else(|_| PathBuf::from("config.json"));
    let path = config_path.unwrap_or(default_path.as_path());

    if path.exists() {
        // Shared (read) lock: allows concurrent readers, blocks during writes
        let file = fs::File::open(path)
            .with_context(|| format!("Failed to open config at {}", path.display()))?;
        file.lock_shared()
            .with_context(|| "Failed to acquire shared lock on config file")?;

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        // Lock released when `file` drops at end of scope

        let mut config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config JSON from {}", path.display()))?;

        apply_env_overrides(&mut config);
        check_file_permissions(path);
        config
            .validate()
            .with_context(|| "Configuration validation failed")?;
        return Ok(config);
    }

    let mut default_config = Config::default();
    apply_env_overrides(&mut default_config);
    default_config
        .validate()
        .with_context(|| "Default configuration validation failed")?;
    Ok(default_config)
}

/// Warn if the config file has overly permissive permissions. Only emits
/// once per process to avoid spam when config is loaded multiple times.
#[cfg(unix)]
fn check_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Once;

    static WARNED: Once = Once::new();
    WARNED.call_once(|| {
        if let Ok(meta) = std::fs::metadata(path) {
            let mode = meta.permissions().mode();
            if mode & 0o077 != 0 {
                warn!(
                    "config file {} has permissions {:o}, recommend 0600",
                    path.display(),
                    mode & 0o777
                );
            }
        }
    });
}

#[cfg(not(unix))]
fn check_file_permissions(_path: &Path) {}
