use crate::{context::Context, event::*, log_internal, plugin::*};
use anyhow::Result;
use serenity::all::Command;

/// Registers the slash commands once the connection to Discord is ready.
pub struct Ready;

#[serenity::async_trait]
impl Plugin for Ready {
    fn name(&self) -> &'static str {
        "ready"
    }

    async fn handle(&self, ctx: &Context, event: &Event) -> Result<EventHandled> {
        let Event::Ready(_) = event else {
            return Ok(EventHandled::No);
        };

        let commands = Command::set_global_commands(ctx.http, vec![settings::register()]).await?;
        log_internal!("Registered {} global command(s)", commands.len());

        Ok(EventHandled::Yes)
    }
}
