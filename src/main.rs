// This is the entry point of the confession bot.
//
// **Architecture Overview:**
// - `core/` = Business logic (platform-agnostic)
// - `infra/` = Implementations of core traits (snapshot files, settings)
// - `discord/` = Discord-specific adapters (commands, delivery)
//
// This file's job is to:
// 1. Load configuration
// 2. Initialize services (dependency injection)
// 3. Set up the Discord framework
// 4. Register commands

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with half a dozen mod.rs files that all look the same.
#[path = "core/core_layer.rs"]
mod core;
#[path = "discord/discord_layer.rs"]
mod discord;
#[path = "infra/infra_layer.rs"]
mod infra;

use crate::core::confessions::{risk_scanner, ModerationCore, PolicyStore, Pseudonymizer};
use crate::discord::{Data, Error};
use crate::infra::confessions::{JsonSnapshotFile, Settings};
use anyhow::Context as _;
use poise::serenity_prelude as serenity;
use std::sync::Arc;

/// Log command errors and tell the user something went wrong.
async fn on_error(error: poise::FrameworkError<'_, Data, Error>) {
    match error {
        poise::FrameworkError::Command { error, ctx, .. } => {
            tracing::error!(command = %ctx.command().name, "Command failed: {}", error);
            let reply = poise::CreateReply::default()
                .content("❌ Da ist etwas schiefgelaufen. Bitte versuche es später noch einmal.")
                .ephemeral(true);
            if let Err(e) = ctx.send(reply).await {
                tracing::warn!("Failed to report command error: {}", e);
            }
        }
        other => {
            if let Err(e) = poise::builtins::on_error(other).await {
                tracing::error!("Error while handling error: {}", e);
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging so we can see what's happening
    tracing_subscriber::fmt::init();

    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!("Refusing to start: {}", e);
            return Err(e.into());
        }
    };
    tracing::info!(
        ?settings,
        ruleset = risk_scanner::RULESET_VERSION,
        "Configuration loaded"
    );

    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================
    // This is the "composition root" where we wire everything together.

    let pseudonymizer = Pseudonymizer::new(&settings.hash_secret)?;

    let snapshot_file = JsonSnapshotFile::new(settings.state_file());
    let store = PolicyStore::load(snapshot_file, settings.persist_timeout)
        .await
        .with_context(|| {
            format!(
                "failed to load confession state from {}",
                settings.state_file().display()
            )
        })?;

    let data = Data {
        core: Arc::new(ModerationCore::new(store, pseudonymizer)),
    };

    // ========================================================================
    // DISCORD FRAMEWORK SETUP
    // ========================================================================

    // Slash commands only; message content is never read
    let intents = serenity::GatewayIntents::GUILDS;

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: discord::commands::all(),
            on_error: |error| Box::pin(on_error(error)),
            ..Default::default()
        })
        .setup(|ctx, _ready, framework| {
            Box::pin(async move {
                tracing::info!("🤖 Bot is starting up...");

                // Register slash commands globally (can take up to an hour to propagate)
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;

                let guilds = data.core.store().list_guilds().await.len();
                tracing::info!(guilds, "✅ Commands registered, bot is ready");
                Ok(data)
            })
        })
        .build();

    let mut client = serenity::ClientBuilder::new(&settings.discord_token, intents)
        .framework(framework)
        .await
        .context("error creating Discord client")?;

    client.start().await.context("error running bot")?;
    Ok(())
}
