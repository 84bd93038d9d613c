//! Miscellaneous convenience methods over Serenity types

use crate::{
    context::{CacheHttp, Context},
    conversation::{HistoryMessage, MessageSource},
    dispatcher::Caller,
};
use anyhow::Result;
use base64::{prelude::BASE64_STANDARD, Engine};
use serenity::all::{
    ChannelId, GetMessages, GuildId, Message, MessageId, MessageType, Permissions, RoleId, UserId,
};

#[serenity::async_trait]
pub trait MessageHelper {
    /// Whether the message mentions the bot or replies to one of its messages.
    async fn is_to_me(&self, ctx: &Context) -> bool;
    /// The message this one replies to, if any.
    fn reply_target(&self) -> Option<MessageId>;
    async fn to_history(&self) -> HistoryMessage;
}

#[serenity::async_trait]
impl MessageHelper for Message {
    async fn is_to_me(&self, ctx: &Context) -> bool {
        let my_id = ctx.cache.current_user().id;
        if self.mentions_user_id(my_id) {
            return true;
        }

        if let Some(parent) = &self.referenced_message {
            return parent.author.id == my_id;
        }
        // Discord didn't resolve the parent for us
        let Some(parent_id) = self.reply_target() else {
            return false;
        };
        match self.channel_id.message(ctx.cache_http, parent_id).await {
            Ok(parent) => parent.author.id == my_id,
            Err(_) => false,
        }
    }

    fn reply_target(&self) -> Option<MessageId> {
        if self.kind != MessageType::InlineReply {
            return None;
        }
        self.message_reference.as_ref()?.message_id
    }

    async fn to_history(&self) -> HistoryMessage {
        let mut images = Vec::new();
        for attachment in &self.attachments {
            let is_image = attachment
                .content_type
                .as_deref()
                .is_some_and(|kind| kind.starts_with("image/"));
            if !is_image {
                continue;
            }
            match attachment.download().await {
                Ok(bytes) => images.push(BASE64_STANDARD.encode(bytes)),
                Err(err) => tracing::warn!(
                    attachment = %attachment.filename,
                    error = %err,
                    "Could not download image attachment"
                ),
            }
        }

        HistoryMessage {
            id: self.id,
            author_id: self.author.id,
            content: self.content.clone(),
            reply_to: self.reply_target(),
            images,
        }
    }
}

/// The invoking member's standing in the guild, for the role gate.
///
/// `permissions` are the resolved permissions Discord sends with interactions; message events
/// don't carry them, so the guild cache decides instead.
pub fn caller(
    ctx: &Context,
    guild_id: GuildId,
    user_id: UserId,
    roles: &[RoleId],
    permissions: Option<Permissions>,
) -> Caller {
    let is_admin = permissions.is_some_and(|permissions| permissions.administrator())
        || ctx.cache.guild(guild_id).is_some_and(|guild| {
            is_guild_admin(user_id, roles, guild.owner_id, |role_id| {
                guild
                    .roles
                    .get(&role_id)
                    .map_or(Permissions::empty(), |role| role.permissions)
            })
        });

    Caller {
        guild_id,
        roles: roles.to_vec(),
        is_admin,
    }
}

/// Guild owner, or holder of a role with the Administrator permission
fn is_guild_admin(
    user_id: UserId,
    roles: &[RoleId],
    owner_id: UserId,
    role_permissions: impl Fn(RoleId) -> Permissions,
) -> bool {
    user_id == owner_id
        || roles
            .iter()
            .any(|role_id| role_permissions(*role_id).administrator())
}

/// Roles of a message's author.  Gateway messages usually carry them; otherwise ask the cache,
/// then Discord.
pub async fn author_roles(
    ctx: &Context<'_>,
    msg: &Message,
    guild_id: GuildId,
) -> Result<Vec<RoleId>> {
    if let Some(member) = &msg.member {
        return Ok(member.roles.clone());
    }
    let cached = ctx
        .cache
        .member(guild_id, msg.author.id)
        .map(|member| member.roles.clone());
    if let Some(roles) = cached {
        return Ok(roles);
    }
    Ok(guild_id.member(ctx.cache_http, msg.author.id).await?.roles)
}

/// A Discord channel as a source of conversation history
pub struct ChannelHistory<'a> {
    pub cache_http: &'a CacheHttp,
    pub channel_id: ChannelId,
}

#[serenity::async_trait]
impl<'a> MessageSource for ChannelHistory<'a> {
    async fn message(&self, id: MessageId) -> Option<HistoryMessage> {
        match self.channel_id.message(self.cache_http, id).await {
            Ok(msg) => Some(msg.to_history().await),
            Err(err) => {
                tracing::debug!(message_id = %id, error = %err, "Could not fetch message");
                None
            }
        }
    }

    async fn messages_before(&self, id: MessageId, limit: u32) -> Result<Vec<HistoryMessage>> {
        // Discord serves at most 100 messages per request
        let limit = u8::try_from(limit.min(100)).unwrap_or(100);
        let fetched = self
            .channel_id
            .messages(self.cache_http, GetMessages::new().before(id).limit(limit))
            .await?;

        let mut history = Vec::with_capacity(fetched.len());
        for msg in &fetched {
            history.push(msg.to_history().await);
        }
        Ok(history)
    }
}
