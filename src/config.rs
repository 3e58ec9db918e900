use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Global daemon configuration, read from `<data_dir>/config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_api_port() -> u16 {
    3456
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            api_port: default_api_port(),
        }
    }
}

/// Fixed directory layout under the data directory.
#[derive(Debug, Clone)]
pub struct Paths {
    pub data_dir: PathBuf,
}

impl Paths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join("config.yaml")
    }

    pub fn descriptors_dir(&self) -> PathBuf {
        self.data_dir.join("descriptors")
    }

    pub fn pids_dir(&self) -> PathBuf {
        self.data_dir.join("pids")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.data_dir.join("scripts")
    }

    pub fn script_logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs").join("scripts")
    }

    /// Create every directory the supervisor writes into.
    pub fn ensure_layout(&self) -> anyhow::Result<()> {
        for dir in [
            self.data_dir.clone(),
            self.descriptors_dir(),
            self.pids_dir(),
            self.logs_dir(),
            self.scripts_dir(),
            self.script_logs_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| anyhow::anyhow!("failed to create {}: {e}", dir.display()))?;
        }
        Ok(())
    }
}

/// Default data directory: `$HOME/.gem`.
pub fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join(".gem")
}

/// Load `config.yaml` from the data dir, writing one with defaults if absent.
pub fn load_or_init(paths: &Paths) -> anyhow::Result<Config> {
    paths.ensure_layout()?;
    let path = paths.config_file();
    if !path.exists() {
        let cfg = Config::default();
        let raw = serde_yaml::to_string(&cfg)
            .map_err(|e| anyhow::anyhow!("failed to render default config: {e}"))?;
        std::fs::write(&path, raw)
            .map_err(|e| anyhow::anyhow!("failed to write {}: {e}", path.display()))?;
        return Ok(cfg);
    }
    load(&path)
}

pub fn load(path: &Path) -> anyhow::Result<Config> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg: Config = serde_yaml::from_str("log_level: debug\n").unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.api_port, 3456);
    }

    #[test]
    fn unknown_fields_rejected() {
        let r: std::result::Result<Config, _> = serde_yaml::from_str("api_prot: 1\n");
        assert!(r.is_err());
    }

    #[test]
    fn layout_paths_under_data_dir() {
        let p = Paths::new("/tmp/gemtest");
        assert_eq!(p.pids_dir(), PathBuf::from("/tmp/gemtest/pids"));
        assert_eq!(
            p.script_logs_dir(),
            PathBuf::from("/tmp/gemtest/logs/scripts")
        );
    }
}
