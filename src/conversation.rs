//! Turns a triggering Discord message into the conversation sent to the model.
//!
//! Context comes from two places: the reply chain above the trigger and the most recent messages
//! in the channel.  Both are merged into one chronological transcript, keyed by message id so a
//! message found both ways is only sent once.

use crate::{
    ollama::{ChatMessage, ChatMessageRole},
    settings::GuildSettings,
};
use anyhow::Result;
use serenity::all::{MessageId, UserId};
use std::collections::BTreeMap;

/// The parts of a Discord message the transcript needs
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryMessage {
    pub id: MessageId,
    pub author_id: UserId,
    pub content: String,
    /// The message this one is a reply to
    pub reply_to: Option<MessageId>,
    /// Base64-encoded image attachments
    pub images: Vec<String>,
}

/// Where past messages come from.  In production, a Discord channel.
#[serenity::async_trait]
pub trait MessageSource: Send + Sync {
    /// `None` if the message no longer exists or can't be read.
    async fn message(&self, id: MessageId) -> Option<HistoryMessage>;

    /// Up to `limit` messages posted before `id`, in any order.
    async fn messages_before(&self, id: MessageId, limit: u32) -> Result<Vec<HistoryMessage>>;
}

pub struct Assembler<'a> {
    pub bot_id: UserId,
    /// Prepended to the guild's own prompt
    pub base_system_prompt: &'a str,
}

impl Assembler<'_> {
    pub async fn assemble(
        &self,
        source: &dyn MessageSource,
        settings: &GuildSettings,
        trigger: &HistoryMessage,
    ) -> Result<Vec<ChatMessage>> {
        let mut context: BTreeMap<MessageId, HistoryMessage> = BTreeMap::new();

        if settings.message_history > 0 {
            for msg in source
                .messages_before(trigger.id, settings.message_history)
                .await?
            {
                context.insert(msg.id, msg);
            }
        }

        // Inserted second so the reply chain's copy wins
        for msg in reply_chain(source, trigger, settings.reply_history).await {
            context.insert(msg.id, msg);
        }
        context.remove(&trigger.id);

        let mut messages = Vec::with_capacity(context.len() + 2);
        if let Some(system) = system_prompt(self.base_system_prompt, &settings.system_prompt) {
            messages.push(ChatMessage::new(ChatMessageRole::system, system));
        }
        // BTreeMap iterates in id order, and snowflake ids are chronological.
        messages.extend(context.values().map(|msg| self.to_chat_message(msg)));
        messages.push(self.to_chat_message(trigger));

        Ok(messages)
    }

    fn to_chat_message(&self, msg: &HistoryMessage) -> ChatMessage {
        let content = strip_mentions(&msg.content, self.bot_id);
        let (role, content) = if msg.author_id == self.bot_id {
            (ChatMessageRole::assistant, content)
        } else {
            (
                ChatMessageRole::user,
                format!("<@{}>: {}", msg.author_id, content),
            )
        };

        ChatMessage {
            role,
            content,
            images: msg.images.clone(),
        }
    }
}

/// Ancestors of `trigger`, oldest first, at most `limit` of them.
///
/// The walk ends early at a message that isn't a reply or whose parent is gone.
pub async fn reply_chain(
    source: &dyn MessageSource,
    trigger: &HistoryMessage,
    limit: u32,
) -> Vec<HistoryMessage> {
    let mut chain = Vec::new();
    let mut parent = trigger.reply_to;

    while let Some(parent_id) = parent {
        if chain.len() >= limit as usize {
            break;
        }
        let Some(msg) = source.message(parent_id).await else {
            tracing::debug!(parent = %parent_id, "Reply chain parent unavailable");
            break;
        };
        parent = msg.reply_to;
        chain.push(msg);
    }

    chain.reverse();
    chain
}

fn system_prompt(base: &str, guild: &str) -> Option<String> {
    let parts: Vec<&str> = [base.trim(), guild.trim()]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect();
    (!parts.is_empty()).then(|| parts.join("\n"))
}

/// Mentions of the bot itself only confuse the model.
fn strip_mentions(content: &str, bot_id: UserId) -> String {
    content
        .replace(&format!("<@{}>", bot_id), "")
        .replace(&format!("<@!{}>", bot_id), "")
        .trim()
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    const BOT: u64 = 999;
    const ALICE: u64 = 1;
    const BOB: u64 = 2;

    #[derive(Default)]
    struct FakeChannel {
        messages: HashMap<MessageId, HistoryMessage>,
        lookups: AtomicUsize,
    }

    impl FakeChannel {
        fn add(&mut self, id: u64, author: u64, content: &str, reply_to: Option<u64>) -> HistoryMessage {
            let msg = HistoryMessage {
                id: MessageId::new(id),
                author_id: UserId::new(author),
                content: content.to_owned(),
                reply_to: reply_to.map(MessageId::new),
                images: Vec::new(),
            };
            self.messages.insert(msg.id, msg.clone());
            msg
        }
    }

    #[serenity::async_trait]
    impl MessageSource for FakeChannel {
        async fn message(&self, id: MessageId) -> Option<HistoryMessage> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.messages.get(&id).cloned()
        }

        async fn messages_before(&self, id: MessageId, limit: u32) -> Result<Vec<HistoryMessage>> {
            // Newest first, like Discord
            let mut before: Vec<_> = self
                .messages
                .values()
                .filter(|m| m.id < id)
                .cloned()
                .collect();
            before.sort_by(|a, b| b.id.cmp(&a.id));
            before.truncate(limit as usize);
            Ok(before)
        }
    }

    fn settings(reply_history: u32, message_history: u32, prompt: &str) -> GuildSettings {
        GuildSettings {
            system_prompt: prompt.to_owned(),
            reply_history,
            message_history,
            ..GuildSettings::new("llama3")
        }
    }

    fn assembler() -> Assembler<'static> {
        Assembler {
            bot_id: UserId::new(BOT),
            base_system_prompt: "",
        }
    }

    fn contents(messages: &[ChatMessage]) -> Vec<(ChatMessageRole, &str)> {
        messages
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect()
    }

    #[tokio::test]
    async fn reply_chain_is_bounded_and_chronological() {
        let mut channel = FakeChannel::default();
        channel.add(10, ALICE, "one", None);
        channel.add(11, BOT, "two", Some(10));
        channel.add(12, ALICE, "three", Some(11));
        channel.add(13, BOT, "four", Some(12));
        let trigger = channel.add(14, ALICE, "<@999> five", Some(13));

        let messages = assembler()
            .assemble(&channel, &settings(2, 0, ""), &trigger)
            .await
            .unwrap();

        assert_eq!(
            contents(&messages),
            vec![
                (ChatMessageRole::user, "<@1>: three"),
                (ChatMessageRole::assistant, "four"),
                (ChatMessageRole::user, "<@1>: five"),
            ]
        );
        // Stopped walking once the limit was reached
        assert_eq!(channel.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn overlapping_context_appears_once() {
        let mut channel = FakeChannel::default();
        channel.add(10, ALICE, "question", None);
        channel.add(11, BOB, "side chatter", None);
        channel.add(12, BOT, "answer", Some(10));
        let trigger = channel.add(13, ALICE, "follow-up", Some(12));

        let messages = assembler()
            .assemble(&channel, &settings(5, 3, ""), &trigger)
            .await
            .unwrap();

        assert_eq!(
            contents(&messages),
            vec![
                (ChatMessageRole::user, "<@1>: question"),
                (ChatMessageRole::user, "<@2>: side chatter"),
                (ChatMessageRole::assistant, "answer"),
                (ChatMessageRole::user, "<@1>: follow-up"),
            ]
        );
    }

    #[tokio::test]
    async fn reply_chain_copy_takes_precedence() {
        let mut channel = FakeChannel::default();
        channel.add(10, ALICE, "stale", None);
        let trigger = channel.add(11, ALICE, "now", Some(10));

        struct Split<'a>(&'a FakeChannel);

        #[serenity::async_trait]
        impl<'a> MessageSource for Split<'a> {
            async fn message(&self, id: MessageId) -> Option<HistoryMessage> {
                let mut msg = self.0.message(id).await?;
                msg.content = "from reply chain".to_owned();
                Some(msg)
            }

            async fn messages_before(&self, id: MessageId, limit: u32) -> Result<Vec<HistoryMessage>> {
                self.0.messages_before(id, limit).await
            }
        }

        let messages = assembler()
            .assemble(&Split(&channel), &settings(1, 1, ""), &trigger)
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "<@1>: from reply chain");
    }

    #[tokio::test]
    async fn zero_limits_send_only_prompt_and_trigger() {
        let mut channel = FakeChannel::default();
        channel.add(10, BOB, "earlier", None);
        let trigger = channel.add(11, ALICE, "hi <@!999>", Some(10));

        let assembler = Assembler {
            bot_id: UserId::new(BOT),
            base_system_prompt: "You are in a discord server.",
        };
        let messages = assembler
            .assemble(&channel, &settings(0, 0, "Talk like a pirate."), &trigger)
            .await
            .unwrap();

        assert_eq!(
            contents(&messages),
            vec![
                (
                    ChatMessageRole::system,
                    "You are in a discord server.\nTalk like a pirate."
                ),
                (ChatMessageRole::user, "<@1>: hi"),
            ]
        );
        assert_eq!(channel.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_system_turn_without_prompts() {
        let mut channel = FakeChannel::default();
        let trigger = channel.add(10, ALICE, "hello", None);

        let messages = assembler()
            .assemble(&channel, &settings(3, 0, "   "), &trigger)
            .await
            .unwrap();
        assert_eq!(contents(&messages), vec![(ChatMessageRole::user, "<@1>: hello")]);
    }

    #[tokio::test]
    async fn deleted_parent_is_skipped() {
        let mut channel = FakeChannel::default();
        // 11 was the bot's reply, since deleted
        let trigger = channel.add(12, ALICE, "what did you say?", Some(11));

        let messages = assembler()
            .assemble(&channel, &settings(5, 0, ""), &trigger)
            .await
            .unwrap();
        assert_eq!(
            contents(&messages),
            vec![(ChatMessageRole::user, "<@1>: what did you say?")]
        );
    }

    #[tokio::test]
    async fn channel_window_excludes_the_trigger_and_later_messages() {
        let mut channel = FakeChannel::default();
        channel.add(10, BOB, "a", None);
        channel.add(11, BOB, "b", None);
        channel.add(12, BOB, "c", None);
        let trigger = channel.add(13, ALICE, "d", None);
        channel.add(14, BOB, "after", None);

        let messages = assembler()
            .assemble(&channel, &settings(0, 2, ""), &trigger)
            .await
            .unwrap();
        assert_eq!(
            contents(&messages),
            vec![
                (ChatMessageRole::user, "<@2>: b"),
                (ChatMessageRole::user, "<@2>: c"),
                (ChatMessageRole::user, "<@1>: d"),
            ]
        );
    }

    #[tokio::test]
    async fn images_travel_with_their_message() {
        let mut channel = FakeChannel::default();
        let mut trigger = channel.add(10, ALICE, "what is this?", None);
        trigger.images = vec!["aGVsbG8=".to_owned()];

        let messages = assembler()
            .assemble(&channel, &settings(0, 0, ""), &trigger)
            .await
            .unwrap();
        assert_eq!(messages[0].images, vec!["aGVsbG8=".to_owned()]);
    }
}
