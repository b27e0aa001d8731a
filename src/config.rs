use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Access to the persisted "who is logged in" state. Command authorization
/// depends on this capability rather than on a concrete file, so tests can
/// substitute an in-memory session.
pub trait SessionStore {
    fn current_user(&self) -> Option<String>;
    fn set_current_user(&mut self, name: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "default_db_url")]
    pub db_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_user_name: Option<String>,
    #[serde(skip)]
    path: PathBuf,
}

fn default_db_url() -> String {
    "sqlite:grazer.db?mode=rwc".to_string()
}

impl Config {
    /// Load configuration from `path`. A missing file is not an error: the
    /// first run starts from defaults and the file is created on first save.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self {
                db_url: default_db_url(),
                current_user_name: None,
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.path = path.to_path_buf();
        Ok(config)
    }

    /// Default location under the platform config directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("grazer")
            .join("config.toml")
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

impl SessionStore for Config {
    fn current_user(&self) -> Option<String> {
        self.current_user_name.clone()
    }

    fn set_current_user(&mut self, name: &str) -> anyhow::Result<()> {
        self.current_user_name = Some(name.to_string());
        self.save()
    }
}
