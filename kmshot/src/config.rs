use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

/// Optional `~/.config/kmshot/config.toml` defaults, merged with CLI flags
/// (flags always win, matching `base`/`file`'s precedence for the
/// boolean flags in the binary this crate is adapted from).
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    pub device: Option<String>,
    pub output: Option<String>,
    pub exposure: Option<f32>,
    pub tonemap: Option<u32>,
}

impl Config {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kmshot")
            .join("config.toml")
    }

    /// Load and parse `path`; a missing or malformed file is non-fatal —
    /// the default (empty) config is used and a diagnostic is emitted.
    pub fn load(path: &Path) -> Config {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Config::default(),
            Err(err) => {
                warn!("\tfailed to read config {}: {err}; using defaults", path.display());
                return Config::default();
            }
        };
        toml::from_str(&contents).unwrap_or_else(|err| {
            warn!("\tfailed to parse config {}: {err}; using defaults", path.display());
            Config::default()
        })
    }

    pub fn device_path(&self) -> Option<PathBuf> {
        self.device.as_deref().map(|d| PathBuf::from(shellexpand::tilde(d).into_owned()))
    }

    pub fn output_path(&self) -> Option<PathBuf> {
        self.output.as_deref().map(|o| PathBuf::from(shellexpand::tilde(o).into_owned()))
    }
}
