use crate::{context::Context, event::*, log_event, logging::truncate, plugin::*};
use anyhow::Result;
use serenity::all::Interaction;

/// Logs every incoming event
pub struct Debug;

#[serenity::async_trait]
impl Plugin for Debug {
    fn name(&self) -> &'static str {
        "debug"
    }

    async fn handle(&self, _ctx: &Context, event: &Event) -> Result<EventHandled> {
        match event {
            Event::Ready(ready) => {
                log_event!(
                    "Connected to {} server(s) as {}",
                    ready.guilds.len(),
                    ready.user.name,
                );
            }
            Event::Message(msg) => {
                log_event!(
                    guild = ?msg.guild_id.map(|id| id.get()),
                    channel = %msg.channel_id,
                    author = %msg.author.name,
                    "{}",
                    truncate(&msg.content, 100),
                );
            }
            Event::Interaction(Interaction::Command(cmd)) => {
                log_event!(
                    guild = ?cmd.guild_id.map(|id| id.get()),
                    user = %cmd.user.name,
                    "/{} invoked",
                    cmd.data.name,
                );
            }
            Event::Interaction(_) => {}
        }

        Ok(EventHandled::No)
    }
}
