//! Per-guild settings which persist across sessions
//!
//! Each guild's record sits behind its own mutex so that commands for one guild never wait on
//! another guild's disk write.  A record is written to `<dir>/<guild_id>.toml` while its mutex is
//! held and only replaced in memory once the write succeeded, so readers see either the old or
//! the new record and a failed write changes nothing.

use crate::{error::SettingsError, log_internal};
use anyhow::{anyhow, Result};
use serenity::all::{GuildId, RoleId};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::{Mutex, RwLock};

/// Largest history depth a guild may configure.  Discord serves at most 100 messages per
/// request.
pub const MAX_HISTORY_LIMIT: i64 = 100;
pub const MAX_PROMPT_CHARS: usize = 4000;

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GuildSettings {
    /// Ollama model used for this guild
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
    /// Only members with this role may use the bot.  `None` means everyone may.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_role: Option<RoleId>,
    /// How many ancestors to follow up the reply chain
    #[serde(default)]
    pub reply_history: u32,
    /// How many preceding channel messages to include
    #[serde(default)]
    pub message_history: u32,
}

impl GuildSettings {
    pub fn new(default_model: &str) -> Self {
        Self {
            model: default_model.to_owned(),
            system_prompt: String::new(),
            required_role: None,
            reply_history: 0,
            message_history: 0,
        }
    }
}

pub struct SettingsStore {
    dir: PathBuf,
    default_model: String,
    guilds: RwLock<HashMap<GuildId, Arc<Mutex<GuildSettings>>>>,
}

impl SettingsStore {
    /// Read every guild file in `dir`.  A missing directory is an empty store; unreadable files
    /// are skipped with a warning so one bad file doesn't take every guild down with it.
    pub async fn load(dir: PathBuf, default_model: &str) -> Result<Self> {
        let mut guilds = HashMap::new();

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::new(dir, default_model, guilds))
            }
            Err(e) => {
                return Err(anyhow!(
                    "Could not read settings directory `{}`: {}",
                    dir.to_string_lossy(),
                    e
                ))
            }
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(guild_id) = guild_id_from_path(&path) else {
                continue;
            };
            match read_settings(&path).await {
                Ok(settings) => {
                    guilds.insert(guild_id, Arc::new(Mutex::new(settings)));
                }
                Err(e) => tracing::warn!(
                    path = %path.to_string_lossy(),
                    error = %e,
                    "Skipping unreadable guild settings"
                ),
            }
        }

        log_internal!(
            "Loaded settings for {} guild(s) from `{}`",
            guilds.len(),
            dir.to_string_lossy()
        );

        Ok(Self::new(dir, default_model, guilds))
    }

    fn new(
        dir: PathBuf,
        default_model: &str,
        guilds: HashMap<GuildId, Arc<Mutex<GuildSettings>>>,
    ) -> Self {
        Self {
            dir,
            default_model: default_model.to_owned(),
            guilds: RwLock::new(guilds),
        }
    }

    /// Current settings for a guild.  Guilds never configured get the defaults.
    pub async fn get(&self, guild_id: GuildId) -> GuildSettings {
        self.entry(guild_id).await.lock().await.clone()
    }

    pub async fn set_model(
        &self,
        guild_id: GuildId,
        name: &str,
    ) -> Result<GuildSettings, SettingsError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SettingsError::Validation(
                "Model name must not be empty.".to_owned(),
            ));
        }
        self.update(guild_id, |s| s.model = name.to_owned()).await
    }

    /// An empty prompt clears the guild prompt.
    pub async fn set_prompt(
        &self,
        guild_id: GuildId,
        text: &str,
    ) -> Result<GuildSettings, SettingsError> {
        let text = text.trim();
        if text.chars().count() > MAX_PROMPT_CHARS {
            return Err(SettingsError::Validation(format!(
                "System prompt must be at most {} characters.",
                MAX_PROMPT_CHARS
            )));
        }
        self.update(guild_id, |s| s.system_prompt = text.to_owned())
            .await
    }

    pub async fn set_required_role(
        &self,
        guild_id: GuildId,
        role: Option<RoleId>,
    ) -> Result<GuildSettings, SettingsError> {
        self.update(guild_id, |s| s.required_role = role).await
    }

    pub async fn set_history_limits(
        &self,
        guild_id: GuildId,
        reply_history: i64,
        message_history: i64,
    ) -> Result<GuildSettings, SettingsError> {
        let reply_history = history_limit("Reply history", reply_history)?;
        let message_history = history_limit("Message history", message_history)?;
        self.update(guild_id, |s| {
            s.reply_history = reply_history;
            s.message_history = message_history;
        })
        .await
    }

    /// Every guild the store knows about, ordered by guild id.
    #[allow(dead_code)] // diagnostics only
    pub async fn list(&self) -> Vec<(GuildId, GuildSettings)> {
        // Don't hold the map lock while waiting on individual guilds.
        let entries: Vec<_> = self
            .guilds
            .read()
            .await
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();

        let mut list = Vec::with_capacity(entries.len());
        for (guild_id, entry) in entries {
            list.push((guild_id, entry.lock().await.clone()));
        }
        list.sort_by_key(|(guild_id, _)| *guild_id);
        list
    }

    async fn entry(&self, guild_id: GuildId) -> Arc<Mutex<GuildSettings>> {
        if let Some(entry) = self.guilds.read().await.get(&guild_id) {
            return entry.clone();
        }

        self.guilds
            .write()
            .await
            .entry(guild_id)
            .or_insert_with(|| Arc::new(Mutex::new(GuildSettings::new(&self.default_model))))
            .clone()
    }

    async fn update(
        &self,
        guild_id: GuildId,
        apply: impl FnOnce(&mut GuildSettings),
    ) -> Result<GuildSettings, SettingsError> {
        let entry = self.entry(guild_id).await;
        let mut current = entry.lock().await;

        let mut updated = current.clone();
        apply(&mut updated);
        self.save(guild_id, &updated).await?;

        *current = updated.clone();
        Ok(updated)
    }

    fn path_for(&self, guild_id: GuildId) -> PathBuf {
        self.dir.join(format!("{}.toml", guild_id.get()))
    }

    async fn save(&self, guild_id: GuildId, settings: &GuildSettings) -> Result<()> {
        let path = self.path_for(guild_id);
        let settings_str = toml::to_string_pretty(settings)
            .map_err(|e| anyhow!("Could not serialize settings: {}", e))?;

        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            anyhow!(
                "Could not create directory `{}`: {}",
                self.dir.to_string_lossy(),
                e
            )
        })?;

        // Create a temporary file in the same directory.
        let tmp_path = path.with_extension("toml.new");

        tokio::fs::write(&tmp_path, settings_str)
            .await
            .map_err(|e| {
                anyhow!(
                    "Could not write settings to temporary file `{}`: {}",
                    tmp_path.to_string_lossy(),
                    e
                )
            })?;

        // Atomically rename the temporary file over the target file.
        tokio::fs::rename(&tmp_path, &path).await.map_err(|e| {
            anyhow!(
                "Could not rename temporary file `{}` to `{}`: {}",
                tmp_path.to_string_lossy(),
                path.to_string_lossy(),
                e
            )
        })?;

        Ok(())
    }
}

fn history_limit(what: &str, value: i64) -> Result<u32, SettingsError> {
    if !(0..=MAX_HISTORY_LIMIT).contains(&value) {
        return Err(SettingsError::Validation(format!(
            "{} must be between 0 and {}.",
            what, MAX_HISTORY_LIMIT
        )));
    }
    // Range checked above
    Ok(value as u32)
}

fn guild_id_from_path(path: &Path) -> Option<GuildId> {
    if path.extension()? != "toml" {
        return None;
    }
    let id: u64 = path.file_stem()?.to_str()?.parse().ok()?;
    (id != 0).then(|| GuildId::new(id))
}

async fn read_settings(path: &Path) -> Result<GuildSettings> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(toml::from_str(&contents)?)
}
