use crate::{
    config::Config, context::Context, dispatcher::Dispatcher, event::Event,
    ollama::ModelService, pull_tracker::PullTracker, settings::SettingsStore,
};
use serenity::all::{Interaction, Message, Ready};
use std::sync::Arc;

/// Discord event handler
pub struct Handler {
    cfg: Config,
    settings: Arc<SettingsStore>,
    models: Arc<dyn ModelService>,
    dispatcher: Dispatcher,
}

impl<'a> Handler {
    pub fn new(cfg: Config, settings: SettingsStore, models: Arc<dyn ModelService>) -> Self {
        let settings = Arc::new(settings);
        let dispatcher = Dispatcher::new(settings.clone(), models.clone(), PullTracker::new());
        Self {
            cfg,
            settings,
            models,
            dispatcher,
        }
    }

    fn ctx(&'a self, discord_ctx: &'a serenity::all::Context) -> Context<'a> {
        Context {
            cfg: &self.cfg,
            settings: &self.settings,
            models: &self.models,
            dispatcher: &self.dispatcher,
            cache: &discord_ctx.cache,
            http: &discord_ctx.http,
            cache_http: discord_ctx,
        }
    }
}

#[serenity::async_trait]
impl serenity::all::EventHandler for Handler {
    async fn ready(&self, discord_ctx: serenity::all::Context, ready: Ready) {
        Event::Ready(ready).handle(self.ctx(&discord_ctx)).await;
    }

    async fn message(&self, discord_ctx: serenity::all::Context, msg: Message) {
        Event::Message(msg).handle(self.ctx(&discord_ctx)).await;
    }

    async fn interaction_create(
        &self,
        discord_ctx: serenity::all::Context,
        interaction: Interaction,
    ) {
        Event::Interaction(interaction)
            .handle(self.ctx(&discord_ctx))
            .await;
    }
}
