pub mod schema;

pub use schema::{ConfigError, GasbagConfig, InitialCursor, Network};

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Default gasbag home directory (~/.gasbag).
pub fn default_home_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().join(".gasbag"))
        .unwrap_or_else(|| PathBuf::from(".gasbag"))
}

/// Load config from the given path, or return defaults.
///
/// `GASBAG_*` environment variables are applied on top of the file.
pub fn load_config(path: &Path) -> Result<GasbagConfig> {
    let mut config = if path.exists() {
        let contents =
            std::fs::read_to_string(path).context("Failed to read gasbag config file")?;
        toml::from_str(&contents).context("Failed to parse gasbag config (TOML)")?
    } else {
        GasbagConfig::default()
    };
    config.apply_overrides(|key| std::env::var(key).ok())?;
    Ok(config)
}

/// Save config to the given path (TOML format).
pub fn save_config(config: &GasbagConfig, path: &Path) -> Result<()> {
    let contents = toml::to_string_pretty(config).context("Failed to serialize config")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents).context("Failed to write config file")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_preserves_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gasbag.toml");
        let cfg = GasbagConfig {
            package_id: "0xfeed".into(),
            upkeep_fee: 42,
            initial_cursor: Some(InitialCursor {
                tx_digest: "ABC".into(),
                event_seq: 2,
            }),
            ..GasbagConfig::default()
        };
        save_config(&cfg, &path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let loaded: GasbagConfig = toml::from_str(&raw).unwrap();
        assert_eq!(loaded.package_id, "0xfeed");
        assert_eq!(loaded.upkeep_fee, 42);
        assert_eq!(loaded.initial_cursor, cfg.initial_cursor);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let cfg: GasbagConfig = toml::from_str("package_id = \"0x1\"\n").unwrap();
        assert_eq!(cfg.package_id, "0x1");
        assert_eq!(cfg.upkeep_schedule, "0 0 * * * *");
        assert_eq!(cfg.page_size, 50);
    }
}
