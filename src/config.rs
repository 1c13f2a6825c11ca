use serde::Deserialize;
use std::path::Path;

/// Top-level configuration loaded from warden.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct WardenConfig {
    pub child: ChildConfig,
    pub log: LogConfig,
}

/// The command the warden launches and supervises.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ChildConfig {
    pub command: String,
    pub args: Vec<String>,
}

/// Verbosity of the warden itself. At `debug` or finer the child's
/// stdout/stderr are forwarded instead of discarded.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for ChildConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Load config from the given path, or defaults when the file is missing.
///
/// A file that exists but fails to parse is reported and replaced by
/// defaults rather than aborting the run.
pub fn load_config(path: &Path) -> WardenConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!("failed to parse {}: {e}", path.display());
                WardenConfig::default()
            }
        },
        Err(_) => WardenConfig::default(),
    }
}
