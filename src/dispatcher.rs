//! `/settings` command handling
//!
//! Discord-agnostic: the settings plugin decodes the interaction into a `SettingsCommand` and a
//! `Caller`, and turns the `Response` back into an interaction reply.

use crate::{
    error::CommandError,
    ollama::{ModelInfo, ModelService},
    pull_tracker::PullTracker,
    settings::{GuildSettings, SettingsStore},
};
use serenity::all::{GuildId, RoleId};
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::task::JoinHandle;

/// Discord allows at most 25 autocomplete choices.
pub const MAX_AUTOCOMPLETE_CHOICES: usize = 25;
/// Discord's message length limit
const MAX_REPLY_CHARS: usize = 2000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SettingsCommand {
    GetModel,
    SetModel { model: String },
    ListModels,
    PullModel { model: String },
    GetPrompt,
    SetPrompt { prompt: String },
    GetRole,
    SetRole { role: RoleId },
    ClearRole,
    GetHistory,
    SetHistory { reply_history: i64, message_history: i64 },
}

/// An already-decoded slash command option value
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandArg {
    String(String),
    Integer(i64),
    Role(RoleId),
}

/// Who invoked a command, and with what standing in the guild
#[derive(Clone, Debug)]
pub struct Caller {
    pub guild_id: GuildId,
    pub roles: Vec<RoleId>,
    /// Guild owner or holder of the Administrator permission
    pub is_admin: bool,
}

pub enum Response {
    /// Reply text is ready now
    Immediate(String),
    /// Reply text arrives when the task finishes
    Pending(JoinHandle<String>),
}

#[derive(Clone)]
pub struct Dispatcher {
    settings: Arc<SettingsStore>,
    models: Arc<dyn ModelService>,
    pulls: PullTracker,
}

impl SettingsCommand {
    /// Decode `/settings <group> <subcommand> [args]`.
    pub fn parse(
        group: &str,
        subcommand: &str,
        args: &HashMap<String, CommandArg>,
    ) -> Result<Self, CommandError> {
        let cmd = match (group, subcommand) {
            ("model", "get") => Self::GetModel,
            ("model", "set") => Self::SetModel {
                model: string_arg(args, "model")?,
            },
            ("model", "list") => Self::ListModels,
            ("model", "pull") => Self::PullModel {
                model: string_arg(args, "model")?,
            },
            ("prompt", "get") => Self::GetPrompt,
            ("prompt", "set") => Self::SetPrompt {
                prompt: string_arg(args, "prompt")?,
            },
            ("role", "get") => Self::GetRole,
            ("role", "set") => match args.get("role") {
                Some(CommandArg::Role(role)) => Self::SetRole { role: *role },
                Some(_) => return Err(bad_arg("role")),
                None => Self::ClearRole,
            },
            ("history", "get") => Self::GetHistory,
            ("history", "set") => Self::SetHistory {
                reply_history: integer_arg(args, "reply_history")?,
                message_history: integer_arg(args, "message_history")?,
            },
            _ => {
                return Err(CommandError::Unexpected(anyhow::anyhow!(
                    "Unknown command `/settings {} {}`",
                    group,
                    subcommand
                )))
            }
        };
        Ok(cmd)
    }

    /// Commands which talk to the model service and so should be acknowledged before running.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::ListModels | Self::PullModel { .. })
    }
}

impl fmt::Display for SettingsCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::GetModel => write!(f, "model get"),
            Self::SetModel { model } => write!(f, "model set {}", model),
            Self::ListModels => write!(f, "model list"),
            Self::PullModel { model } => write!(f, "model pull {}", model),
            Self::GetPrompt => write!(f, "prompt get"),
            Self::SetPrompt { prompt } => write!(f, "prompt set {}", prompt),
            Self::GetRole => write!(f, "role get"),
            Self::SetRole { role } => write!(f, "role set {}", role),
            Self::ClearRole => write!(f, "role set"),
            Self::GetHistory => write!(f, "history get"),
            Self::SetHistory {
                reply_history,
                message_history,
            } => write!(f, "history set {} {}", reply_history, message_history),
        }
    }
}

fn bad_arg(name: &str) -> CommandError {
    CommandError::Validation(format!("Invalid value for `{}`.", name))
}

fn string_arg(args: &HashMap<String, CommandArg>, name: &str) -> Result<String, CommandError> {
    match args.get(name) {
        Some(CommandArg::String(value)) => Ok(value.clone()),
        Some(_) => Err(bad_arg(name)),
        None => Err(CommandError::Validation(format!("Missing `{}`.", name))),
    }
}

fn integer_arg(args: &HashMap<String, CommandArg>, name: &str) -> Result<i64, CommandError> {
    match args.get(name) {
        Some(CommandArg::Integer(value)) => Ok(*value),
        Some(_) => Err(bad_arg(name)),
        None => Err(CommandError::Validation(format!("Missing `{}`.", name))),
    }
}

/// The role gate.  Administrators always pass so a guild can't lock itself out.
pub fn is_authorized(settings: &GuildSettings, roles: &[RoleId], is_admin: bool) -> bool {
    match settings.required_role {
        None => true,
        Some(required) => is_admin || roles.contains(&required),
    }
}

impl Dispatcher {
    pub fn new(
        settings: Arc<SettingsStore>,
        models: Arc<dyn ModelService>,
        pulls: PullTracker,
    ) -> Self {
        Self {
            settings,
            models,
            pulls,
        }
    }

    pub async fn authorize(&self, caller: &Caller) -> Result<GuildSettings, CommandError> {
        let settings = self.settings.get(caller.guild_id).await;
        if !is_authorized(&settings, &caller.roles, caller.is_admin) {
            return Err(CommandError::Unauthorized);
        }
        Ok(settings)
    }

    pub async fn dispatch(
        &self,
        caller: &Caller,
        cmd: SettingsCommand,
    ) -> Result<Response, CommandError> {
        let current = self.authorize(caller).await?;
        let guild_id = caller.guild_id;

        let reply = match cmd {
            SettingsCommand::GetModel => {
                format!("Current model for this guild: `{}`", current.model)
            }
            SettingsCommand::SetModel { model } => {
                let updated = self.settings.set_model(guild_id, &model).await?;
                format!("Model for this guild set to `{}`.", updated.model)
            }
            SettingsCommand::ListModels => {
                let models = self.models.list_models().await?;
                format_model_list(&models)
            }
            SettingsCommand::PullModel { model } => return Ok(self.start_pull(model)),
            SettingsCommand::GetPrompt if current.system_prompt.is_empty() => {
                "No system prompt is set for this guild.".to_owned()
            }
            SettingsCommand::GetPrompt => clip(format!(
                "Current system prompt for this guild: `{}`",
                current.system_prompt
            )),
            SettingsCommand::SetPrompt { prompt } => {
                let updated = self.settings.set_prompt(guild_id, &prompt).await?;
                if updated.system_prompt.is_empty() {
                    "System prompt cleared for this guild.".to_owned()
                } else {
                    "System prompt set for this guild.".to_owned()
                }
            }
            SettingsCommand::GetRole => match current.required_role {
                Some(role) => format!("Current required role for this guild: <@&{}>", role),
                None => "No required role is currently set.".to_owned(),
            },
            SettingsCommand::SetRole { role } => {
                self.settings.set_required_role(guild_id, Some(role)).await?;
                format!("Required role for this guild set to <@&{}>.", role)
            }
            SettingsCommand::ClearRole => {
                self.settings.set_required_role(guild_id, None).await?;
                "Required role cleared; everyone may use the bot.".to_owned()
            }
            SettingsCommand::GetHistory => format_history(&current),
            SettingsCommand::SetHistory {
                reply_history,
                message_history,
            } => {
                let updated = self
                    .settings
                    .set_history_limits(guild_id, reply_history, message_history)
                    .await?;
                format!("Message history set for this guild.\n{}", format_history(&updated))
            }
        };

        Ok(Response::Immediate(reply))
    }

    /// Autocomplete choices for `/settings model set`.  Empty for members the role gate turns
    /// away, or when the model service can't be reached.
    pub async fn model_choices(&self, caller: &Caller, typed: &str) -> Vec<String> {
        if self.authorize(caller).await.is_err() {
            return Vec::new();
        }
        match self.models.list_models().await {
            Ok(models) => matching_models(&models, typed),
            Err(err) => {
                tracing::warn!(error = %err, "Could not list models for autocomplete");
                Vec::new()
            }
        }
    }

    /// Pull in the background.  A pull already running for the same model is not repeated.
    fn start_pull(&self, model: String) -> Response {
        let model = model.trim().to_owned();
        if model.is_empty() {
            return Response::Immediate("Model name must not be empty.".to_owned());
        }
        let Some(guard) = self.pulls.begin(&model) else {
            return Response::Immediate(format!(
                "A pull for `{}` is already in progress.",
                model
            ));
        };

        let models = self.models.clone();
        Response::Pending(tokio::spawn(async move {
            let _guard = guard;
            match models.pull_model(&model).await {
                Ok(()) => format!(
                    "Model `{}` pulled successfully. Use `/settings model set` to switch to it.",
                    model
                ),
                Err(e) => {
                    tracing::warn!(model = %model, error = %e, "Model pull failed");
                    e.user_message()
                }
            }
        }))
    }
}

fn format_history(settings: &GuildSettings) -> String {
    format!(
        "Message history settings for this guild:\n\
         - Reply History: `{}`\n\
         - Message History: `{}`",
        settings.reply_history, settings.message_history
    )
}

pub fn format_model_list(models: &[ModelInfo]) -> String {
    if models.is_empty() {
        return "No models available. Use `/settings model pull` to add a model.".to_owned();
    }
    let lines: Vec<String> = models
        .iter()
        .map(|m| {
            format!(
                "- `{}` ({:.2} GB)",
                m.name,
                m.size as f64 / 1024.0 / 1024.0 / 1024.0
            )
        })
        .collect();
    clip(format!("Available models:\n{}", lines.join("\n")))
}

/// Model names for autocomplete, filtered by what the user typed so far.
pub fn matching_models(models: &[ModelInfo], typed: &str) -> Vec<String> {
    let typed = typed.to_lowercase();
    models
        .iter()
        .filter(|m| m.name.to_lowercase().contains(&typed))
        .take(MAX_AUTOCOMPLETE_CHOICES)
        .map(|m| m.name.clone())
        .collect()
}

/// Fit `text` into one Discord message.
pub fn clip(text: String) -> String {
    if text.chars().count() <= MAX_REPLY_CHARS {
        return text;
    }
    let mut clipped: String = text.chars().take(MAX_REPLY_CHARS - 1).collect();
    clipped.push('…');
    clipped
}
