//! `/settings` slash command: registration, decoding and replying.  The command logic itself
//! lives in the dispatcher.

use crate::{
    context::Context,
    dispatcher::{clip, Caller, CommandArg, Response, SettingsCommand},
    error::{CommandError, MSG_GENERIC_FAILURE},
    event::*,
    helper::caller,
    log_event,
    logging::truncate,
    plugin::*,
};
use anyhow::{anyhow, Result};
use serenity::all::{
    CommandInteraction, CommandOptionType, CreateAutocompleteResponse, CreateCommand,
    CreateCommandOption, CreateInteractionResponse, CreateInteractionResponseMessage,
    CreateMessage, EditInteractionResponse, GuildId, Interaction, InteractionContext, Member,
    ResolvedOption, ResolvedValue, UserId,
};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tracing::Instrument;

const COMMAND_NAME: &str = "settings";

/// Discord invalidates interaction tokens after 15 minutes.  Past this, a deferred reply can no
/// longer be edited.
const DEFERRED_REPLY_LIFETIME: Duration = Duration::from_secs(14 * 60);

pub struct Settings;

#[serenity::async_trait]
impl Plugin for Settings {
    fn name(&self) -> &'static str {
        "settings"
    }

    async fn handle(&self, ctx: &Context, event: &Event) -> Result<EventHandled> {
        let Event::Interaction(interaction) = event else {
            return Ok(EventHandled::No);
        };

        match interaction {
            Interaction::Command(cmd) if cmd.data.name == COMMAND_NAME => run(ctx, cmd).await?,
            Interaction::Autocomplete(cmd) if cmd.data.name == COMMAND_NAME => {
                autocomplete(ctx, cmd).await?
            }
            _ => return Ok(EventHandled::No),
        }
        Ok(EventHandled::Yes)
    }
}

/// The `/settings` command tree
pub fn register() -> CreateCommand {
    let model_name = |description: &str| {
        CreateCommandOption::new(CommandOptionType::String, "model", description).required(true)
    };
    let history_limit = |name: &str, description: &str| {
        CreateCommandOption::new(CommandOptionType::Integer, name, description).required(true)
    };

    CreateCommand::new(COMMAND_NAME)
        .description("Configure the bot for this server")
        .contexts(vec![InteractionContext::Guild])
        .add_option(
            group("model", "Which model answers in this server")
                .add_sub_option(subcommand("get", "Show the current model"))
                .add_sub_option(
                    subcommand("set", "Choose the model").add_sub_option(
                        model_name("Name of an installed model").set_autocomplete(true),
                    ),
                )
                .add_sub_option(subcommand("list", "List installed models"))
                .add_sub_option(
                    subcommand("pull", "Download a model to the inference server")
                        .add_sub_option(model_name("Name of the model to download")),
                ),
        )
        .add_option(
            group("prompt", "The system prompt for this server")
                .add_sub_option(subcommand("get", "Show the current system prompt"))
                .add_sub_option(
                    subcommand("set", "Set the system prompt").add_sub_option(
                        CreateCommandOption::new(
                            CommandOptionType::String,
                            "prompt",
                            "Instructions for the model; empty to clear",
                        )
                        .required(true),
                    ),
                ),
        )
        .add_option(
            group("role", "Restrict who may use the bot")
                .add_sub_option(subcommand("get", "Show the required role"))
                .add_sub_option(
                    subcommand("set", "Set the required role; omit to allow everyone")
                        .add_sub_option(CreateCommandOption::new(
                            CommandOptionType::Role,
                            "role",
                            "Role required to use the bot",
                        )),
                ),
        )
        .add_option(
            group("history", "How much conversation the model sees")
                .add_sub_option(subcommand("get", "Show the history limits"))
                .add_sub_option(
                    subcommand("set", "Set the history limits")
                        .add_sub_option(history_limit(
                            "reply_history",
                            "Replies to follow back from the triggering message (0-100)",
                        ))
                        .add_sub_option(history_limit(
                            "message_history",
                            "Recent channel messages to include (0-100)",
                        )),
                ),
        )
}

fn group(name: &str, description: &str) -> CreateCommandOption {
    CreateCommandOption::new(CommandOptionType::SubCommandGroup, name, description)
}

fn subcommand(name: &str, description: &str) -> CreateCommandOption {
    CreateCommandOption::new(CommandOptionType::SubCommand, name, description)
}

/// Flatten `/settings <group> <subcommand> [args]` into a `SettingsCommand`.
fn decode(options: &[ResolvedOption]) -> Result<SettingsCommand, CommandError> {
    let Some(ResolvedOption {
        name: group,
        value: ResolvedValue::SubCommandGroup(subcommands),
        ..
    }) = options.first()
    else {
        return Err(anyhow!("Missing subcommand group").into());
    };
    let Some(ResolvedOption {
        name: subcommand,
        value: ResolvedValue::SubCommand(options),
        ..
    }) = subcommands.first()
    else {
        return Err(anyhow!("Missing subcommand").into());
    };

    let args: HashMap<String, CommandArg> = options
        .iter()
        .filter_map(|option| {
            let arg = match &option.value {
                ResolvedValue::String(value) => CommandArg::String(value.to_string()),
                ResolvedValue::Integer(value) => CommandArg::Integer(*value),
                ResolvedValue::Role(role) => CommandArg::Role(role.id),
                _ => return None,
            };
            Some((option.name.to_owned(), arg))
        })
        .collect();

    SettingsCommand::parse(group, subcommand, &args)
}

async fn run(ctx: &Context<'_>, cmd: &CommandInteraction) -> Result<()> {
    let Some((guild_id, member)) = cmd.guild_id.zip(cmd.member.as_deref()) else {
        return reply_now(ctx, cmd, "This command can only be used in a server.").await;
    };

    let command = match decode(&cmd.data.options()) {
        Ok(command) => command,
        Err(err) => {
            if err.is_internal() {
                tracing::error!(guild = %guild_id, error = %err, "Could not decode /settings");
            }
            return reply_now(ctx, cmd, &err.user_message()).await;
        }
    };

    let span = tracing::info_span!(
        "settings",
        guild = %guild_id,
        command = %truncate(&command.to_string(), 100),
    );
    let caller = member_caller(ctx, guild_id, member);
    respond(ctx, cmd, &caller, command).instrument(span).await
}

fn member_caller(ctx: &Context, guild_id: GuildId, member: &Member) -> Caller {
    caller(
        ctx,
        guild_id,
        member.user.id,
        &member.roles,
        member.permissions,
    )
}

async fn respond(
    ctx: &Context<'_>,
    cmd: &CommandInteraction,
    caller: &Caller,
    command: SettingsCommand,
) -> Result<()> {
    let deferred = command.is_deferred();
    let started = Instant::now();
    if deferred {
        let defer = CreateInteractionResponseMessage::new().ephemeral(true);
        cmd.create_response(ctx.http, CreateInteractionResponse::Defer(defer))
            .await?;
    }

    let text = match ctx.dispatcher.dispatch(caller, command).await {
        Ok(Response::Immediate(text)) => text,
        Ok(Response::Pending(task)) => task.await.unwrap_or_else(|err| {
            tracing::error!(error = %err, "Background task failed");
            MSG_GENERIC_FAILURE.to_owned()
        }),
        Err(err @ CommandError::Unauthorized) => {
            log_event!(user = %cmd.user.name, "Rejected member without the required role");
            err.user_message()
        }
        Err(err) => {
            if err.is_internal() {
                tracing::error!(error = format!("{:#}", err), "Command failed");
            }
            err.user_message()
        }
    };

    if deferred {
        deliver_deferred(ctx, cmd, text, started.elapsed()).await
    } else {
        reply_now(ctx, cmd, &text).await
    }
}

#[derive(Debug, PartialEq)]
enum Delivery {
    EditReply,
    /// The interaction token has expired
    PostInChannel,
}

fn delivery_for(elapsed: Duration) -> Delivery {
    if elapsed < DEFERRED_REPLY_LIFETIME {
        Delivery::EditReply
    } else {
        Delivery::PostInChannel
    }
}

/// Replace the deferred placeholder with `text`.  If that's no longer possible, post `text` in
/// the channel addressed to the invoking user instead.
async fn deliver_deferred(
    ctx: &Context<'_>,
    cmd: &CommandInteraction,
    text: String,
    elapsed: Duration,
) -> Result<()> {
    if delivery_for(elapsed) == Delivery::EditReply {
        let edit = EditInteractionResponse::new().content(text.clone());
        match cmd.edit_response(ctx.http, edit).await {
            Ok(_) => return Ok(()),
            Err(err) => tracing::warn!(error = %err, "Could not edit deferred reply"),
        }
    }

    let message = CreateMessage::new().content(addressed_to(cmd.user.id, &text));
    cmd.channel_id.send_message(ctx.cache_http, message).await?;
    Ok(())
}

fn addressed_to(user_id: UserId, text: &str) -> String {
    clip(format!("<@{}> {}", user_id, text))
}

async fn reply_now(ctx: &Context<'_>, cmd: &CommandInteraction, text: &str) -> Result<()> {
    let message = CreateInteractionResponseMessage::new()
        .content(text)
        .ephemeral(true);
    cmd.create_response(ctx.http, CreateInteractionResponse::Message(message))
        .await?;
    Ok(())
}

/// Suggest installed models while the user types `/settings model set`.
async fn autocomplete(ctx: &Context<'_>, cmd: &CommandInteraction) -> Result<()> {
    let typed = cmd
        .data
        .autocomplete()
        .map(|option| option.value.to_owned())
        .unwrap_or_default();

    let choices = match cmd.guild_id.zip(cmd.member.as_deref()) {
        Some((guild_id, member)) => {
            let caller = member_caller(ctx, guild_id, member);
            ctx.dispatcher.model_choices(&caller, &typed).await
        }
        None => Vec::new(),
    };

    let response = choices
        .into_iter()
        .fold(CreateAutocompleteResponse::new(), |response, name| {
            response.add_string_choice(name.clone(), name)
        });
    cmd.create_response(ctx.http, CreateInteractionResponse::Autocomplete(response))
        .await?;
    Ok(())
}
