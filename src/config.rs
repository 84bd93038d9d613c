use anyhow::{anyhow, Result};
use std::{path::PathBuf, time::Duration};
use tokio::io::AsyncReadExt;

const CONFIG_PATH_REL_HOME: &str = ".config/ollamabot/config.toml";
const SETTINGS_DIR_REL_HOME: &str = ".config/ollamabot/guilds";

const ENV_CONFIG_PATH: &str = "OLLAMABOT_CONFIG";
const ENV_DISCORD_TOKEN: &str = "DISCORD_APP_TOKEN";
const ENV_OLLAMA_URL: &str = "OLLAMA_API_URL";

const DEFAULT_BASE_SYSTEM_PROMPT: &str = "You are in a discord server. \
Every user message is prefixed with their username, colon and space '<@USERID>: ' this is metadata. \
When referring to a user, use their username '<@USERID>'. Example: 'Hello <@123456789012345678>!'.";

/// Bot configuration
#[derive(Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: General,
    pub ollama: Ollama,
    pub reply: Reply,
}

#[derive(Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct General {
    pub discord_token: String,
    /// Directory with one settings file per guild.  Defaults to a directory next to the config
    /// file.
    pub settings_dir: Option<PathBuf>,
}

#[derive(serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Ollama {
    pub url: String,
    /// Model used by guilds which never picked one
    pub default_model: String,
    pub request_timeout_seconds: u64,
    /// Pulls download gigabytes; give them far longer than chat requests.
    pub pull_timeout_seconds: u64,
}

#[derive(serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Reply {
    /// Prepended to every guild's own system prompt
    pub base_system_prompt: String,
    pub max_message_length: usize,
}

impl Default for Ollama {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_owned(),
            default_model: "llama3".to_owned(),
            request_timeout_seconds: 120,
            pull_timeout_seconds: 60 * 60,
        }
    }
}

impl Default for Reply {
    fn default() -> Self {
        Self {
            base_system_prompt: DEFAULT_BASE_SYSTEM_PROMPT.to_owned(),
            max_message_length: 2000,
        }
    }
}

impl Ollama {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_seconds)
    }
}

impl Config {
    fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(ENV_CONFIG_PATH) {
            return Ok(PathBuf::from(path));
        }
        dirs::home_dir()
            .map(|p| p.join(CONFIG_PATH_REL_HOME))
            .ok_or(anyhow!("Could not find home directory"))
    }

    /// Load the configuration file, if any, then apply environment overrides.
    pub async fn load() -> Result<Self> {
        // A missing .env is normal
        let _ = dotenvy::dotenv();

        let path = Self::config_path()?;
        let mut config = match tokio::fs::File::open(&path).await {
            Ok(mut file) => {
                let mut contents = String::new();
                file.read_to_string(&mut contents).await.map_err(|e| {
                    anyhow!(
                        "Could not read configuration at `{}`: {}",
                        path.to_string_lossy(),
                        e
                    )
                })?;
                Self::parse(&contents).map_err(|e| {
                    anyhow!(
                        "Could not parse configuration at `{}`: {}",
                        path.to_string_lossy(),
                        e
                    )
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => {
                return Err(anyhow!(
                    "Could not open configuration at `{}`: {}",
                    path.to_string_lossy(),
                    e
                ))
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(token) = var(ENV_DISCORD_TOKEN).filter(|v| !v.is_empty()) {
            self.general.discord_token = token;
        }
        if let Some(url) = var(ENV_OLLAMA_URL).filter(|v| !v.is_empty()) {
            self.ollama.url = url;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.general.discord_token.trim().is_empty() {
            return Err(anyhow!(
                "No Discord token configured; set `general.discord_token` or {}",
                ENV_DISCORD_TOKEN
            ));
        }
        if self.ollama.url.trim().is_empty() {
            return Err(anyhow!(
                "No Ollama URL configured; set `ollama.url` or {}",
                ENV_OLLAMA_URL
            ));
        }
        if self.ollama.default_model.trim().is_empty() {
            return Err(anyhow!("`ollama.default_model` must not be empty"));
        }
        Ok(())
    }

    pub fn settings_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.general.settings_dir {
            return Ok(dir.clone());
        }
        dirs::home_dir()
            .map(|p| p.join(SETTINGS_DIR_REL_HOME))
            .ok_or(anyhow!("Could not find home directory"))
    }
}
