use crate::{
    context::Context,
    conversation::Assembler,
    dispatcher::{is_authorized, Caller},
    error::{ModelError, MSG_GENERIC_FAILURE, MSG_UNAUTHORIZED},
    event::*,
    helper::{author_roles, caller, ChannelHistory, MessageHelper},
    log_event,
    logging::truncate,
    plugin::*,
    settings::GuildSettings,
};
use anyhow::Result;
use serenity::all::{CreateAttachment, CreateMessage, GuildId, Message};
use tracing::Instrument;

const MSG_GUILD_ONLY: &str = "Sorry, I only respond in servers.";
const MSG_EMPTY_RESPONSE: &str = "No response generated.";
const MSG_ATTACHED: &str = "The response was too long to post, so it's attached.";

/// Answers messages addressed to the bot using the guild's model.
pub struct LlmReply;

#[serenity::async_trait]
impl Plugin for LlmReply {
    fn name(&self) -> &'static str {
        "llm_reply"
    }

    async fn handle(&self, ctx: &Context, event: &Event) -> Result<EventHandled> {
        let Event::Message(msg) = event else {
            return Ok(EventHandled::No);
        };

        let guild_id = match route(msg.guild_id, msg.is_to_me(ctx).await) {
            Route::Ignore => return Ok(EventHandled::No),
            Route::GuildOnly => {
                msg.reply(ctx.cache_http, MSG_GUILD_ONLY).await?;
                return Ok(EventHandled::Yes);
            }
            Route::Chat(guild_id) => guild_id,
        };

        let span = tracing::info_span!(
            "chat",
            guild = %guild_id,
            user = %msg.author.name,
            input = %truncate(&msg.content, 100),
        );
        respond(ctx, msg, guild_id).instrument(span).await
    }
}

#[derive(Debug, PartialEq)]
enum Route {
    /// Not addressed to the bot
    Ignore,
    GuildOnly,
    Chat(GuildId),
}

fn route(guild_id: Option<GuildId>, addressed: bool) -> Route {
    match (guild_id, addressed) {
        (_, false) => Route::Ignore,
        (None, true) => Route::GuildOnly,
        (Some(guild_id), true) => Route::Chat(guild_id),
    }
}

#[derive(Debug, PartialEq)]
enum Gate {
    Open,
    /// Answer with this instead of chatting
    Closed(&'static str),
}

/// The role gate for chat.  A member who can't be looked up is told something went wrong.
fn gate(settings: &GuildSettings, lookup: Result<Caller>) -> Gate {
    match lookup {
        Ok(caller) if is_authorized(settings, &caller.roles, caller.is_admin) => Gate::Open,
        Ok(_) => {
            log_event!("Rejected member without the required role");
            Gate::Closed(MSG_UNAUTHORIZED)
        }
        Err(err) => {
            tracing::error!(error = format!("{:#}", err), "Could not look up member");
            Gate::Closed(MSG_GENERIC_FAILURE)
        }
    }
}

async fn respond(ctx: &Context<'_>, msg: &Message, guild_id: GuildId) -> Result<EventHandled> {
    let settings = ctx.settings.get(guild_id).await;
    let lookup = author_roles(ctx, msg, guild_id)
        .await
        .map(|roles| caller(ctx, guild_id, msg.author.id, &roles, None));
    if let Gate::Closed(reply) = gate(&settings, lookup) {
        msg.reply(ctx.cache_http, reply).await?;
        return Ok(EventHandled::Yes);
    }

    let typing = msg.channel_id.start_typing(ctx.http);
    let assembler = Assembler {
        bot_id: ctx.cache.current_user().id,
        base_system_prompt: &ctx.cfg.reply.base_system_prompt,
    };
    let source = ChannelHistory {
        cache_http: ctx.cache_http,
        channel_id: msg.channel_id,
    };
    let trigger = msg.to_history().await;

    let reply = match assembler.assemble(&source, &settings, &trigger).await {
        Ok(messages) => reply_text(ctx.models.generate(&settings.model, messages).await),
        Err(err) => {
            tracing::error!(
                error = format!("{:#}", err),
                "Could not read channel history"
            );
            MSG_GENERIC_FAILURE.to_owned()
        }
    };
    typing.stop();

    send(ctx, msg, reply, ctx.cfg.reply.max_message_length).await?;
    Ok(EventHandled::Yes)
}

/// What the user sees for a generation outcome.
fn reply_text(result: Result<String, ModelError>) -> String {
    match result {
        Ok(text) if text.trim().is_empty() => MSG_EMPTY_RESPONSE.to_owned(),
        Ok(text) => text,
        Err(err) => {
            tracing::warn!(error = %err, "Generation failed");
            err.user_message()
        }
    }
}

#[derive(Debug, PartialEq)]
enum Body {
    Text(String),
    /// Too long for one message
    File(Vec<u8>),
}

fn body(reply: String, max_len: usize) -> Body {
    if reply.chars().count() > max_len {
        Body::File(reply.into_bytes())
    } else {
        Body::Text(reply)
    }
}

async fn send(ctx: &Context<'_>, msg: &Message, reply: String, max_len: usize) -> Result<()> {
    let message = match body(reply, max_len) {
        Body::Text(text) => CreateMessage::new().content(text),
        Body::File(bytes) => CreateMessage::new()
            .content(MSG_ATTACHED)
            .add_file(CreateAttachment::bytes(bytes, "response.txt")),
    };
    msg.channel_id
        .send_message(ctx.cache_http, message.reference_message(msg))
        .await?;
    Ok(())
}
