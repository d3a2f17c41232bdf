// Moderator commands for configuring the confession bot.

use super::confessions::{say_policy_error, say_private, Context, Error};
use crate::core::confessions::{PolicyConfig, PolicyError};
use crate::discord::delivery;
use poise::serenity_prelude as serenity;
use std::collections::BTreeSet;

/// BeichtBot configuration.
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "MANAGE_GUILD",
    subcommands(
        "setup",
        "words_add",
        "words_remove",
        "required_add",
        "required_remove",
        "ban",
        "unban",
        "cooldown",
        "reset_cooldown",
        "autodelete",
        "crisis",
        "channels",
        "banner",
        "threadlock",
        "link",
        "stats",
        "reset"
    )
)]
pub async fn beichtbot(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

fn guild_id(ctx: &Context<'_>) -> Result<u64, Error> {
    Ok(ctx.guild_id().ok_or("Must be in a guild")?.get())
}

fn split_words(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|w| w.trim().to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

fn on_off(value: bool) -> &'static str {
    if value {
        "an"
    } else {
        "aus"
    }
}

fn channel_mention(id: Option<u64>) -> String {
    id.map(|id| format!("<#{}>", id))
        .unwrap_or_else(|| "–".to_string())
}

/// Reply with the outcome of a config change.
async fn confirm(
    ctx: Context<'_>,
    result: Result<PolicyConfig, PolicyError>,
    describe: impl FnOnce(&PolicyConfig) -> String,
) -> Result<(), Error> {
    match result {
        Ok(config) => say_private(ctx, format!("✅ {}", describe(&config))).await,
        Err(e) => say_policy_error(ctx, e).await,
    }
}

/// Set the confession channel and (optionally) the mod channel
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn setup(
    ctx: Context<'_>,
    #[description = "Channel für anonyme Beichten"]
    #[channel_types("Text")]
    target: serenity::GuildChannel,
    #[description = "Channel für Mod-Hinweise"]
    #[channel_types("Text")]
    mod_channel: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    let guild_id = guild_id(&ctx)?;
    let result = ctx
        .data()
        .core
        .setup(guild_id, target.id.get(), mod_channel.map(|c| c.id.get()))
        .await;
    confirm(ctx, result, |c| {
        format!(
            "Beichten gehen nach {}, Mod-Hinweise nach {}.",
            channel_mention(c.target_channel_id),
            channel_mention(c.mod_channel_id)
        )
    })
    .await
}

/// Block words or phrases (comma separated)
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn words_add(
    ctx: Context<'_>,
    #[description = "Begriffe, durch Komma getrennt"] words: String,
) -> Result<(), Error> {
    let guild_id = guild_id(&ctx)?;
    let result = ctx
        .data()
        .core
        .add_banned_words(guild_id, &split_words(&words))
        .await;
    confirm(ctx, result, |c| {
        format!("{} Begriffe sind jetzt blockiert.", c.banned_words.len())
    })
    .await
}

/// Unblock words or phrases (comma separated)
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn words_remove(
    ctx: Context<'_>,
    #[description = "Begriffe, durch Komma getrennt"] words: String,
) -> Result<(), Error> {
    let guild_id = guild_id(&ctx)?;
    let result = ctx
        .data()
        .core
        .remove_banned_words(guild_id, &split_words(&words))
        .await;
    confirm(ctx, result, |c| {
        if c.banned_words.is_empty() {
            "Keine Begriffe mehr blockiert.".to_string()
        } else {
            format!("Noch blockiert: {}", c.banned_words.join(", "))
        }
    })
    .await
}

/// Require at least one of these keywords in every confession (comma separated)
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn required_add(
    ctx: Context<'_>,
    #[description = "Schlüsselwörter, durch Komma getrennt"] words: String,
) -> Result<(), Error> {
    let guild_id = guild_id(&ctx)?;
    let result = ctx
        .data()
        .core
        .add_required_words(guild_id, &split_words(&words))
        .await;
    confirm(ctx, result, |c| {
        format!("Pflicht-Schlüsselwörter: {}", c.required_words.join(", "))
    })
    .await
}

/// Drop required keywords (comma separated)
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn required_remove(
    ctx: Context<'_>,
    #[description = "Schlüsselwörter, durch Komma getrennt"] words: String,
) -> Result<(), Error> {
    let guild_id = guild_id(&ctx)?;
    let result = ctx
        .data()
        .core
        .remove_required_words(guild_id, &split_words(&words))
        .await;
    confirm(ctx, result, |c| {
        if c.required_words.is_empty() {
            "Keine Schlüsselwörter mehr erforderlich.".to_string()
        } else {
            format!("Pflicht-Schlüsselwörter: {}", c.required_words.join(", "))
        }
    })
    .await
}

/// Ban the author of an anonymous post without revealing who it is
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn ban(
    ctx: Context<'_>,
    #[description = "ID des anonymen Beitrags"] message_id: String,
) -> Result<(), Error> {
    let guild_id = guild_id(&ctx)?;
    let Some(message_id) = delivery::parse_message_id(&message_id) else {
        return say_private(ctx, "❌ Ungültige Nachricht-ID.").await;
    };
    match ctx.data().core.ban_author_of_post(guild_id, message_id).await {
        Ok((token, true)) => {
            say_private(ctx, format!("✅ Verfasser `{}` wurde gesperrt.", token)).await
        }
        Ok((token, false)) => {
            say_private(ctx, format!("ℹ️ Verfasser `{}` war schon gesperrt.", token)).await
        }
        Err(e) => say_policy_error(ctx, e).await,
    }
}

/// Lift a ban, identified by one of the author's posts
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn unban(
    ctx: Context<'_>,
    #[description = "ID eines Beitrags des gesperrten Verfassers"] message_id: String,
) -> Result<(), Error> {
    let guild_id = guild_id(&ctx)?;
    let Some(message_id) = delivery::parse_message_id(&message_id) else {
        return say_private(ctx, "❌ Ungültige Nachricht-ID.").await;
    };
    match ctx
        .data()
        .core
        .unban_author_of_post(guild_id, message_id)
        .await
    {
        Ok((token, true)) => {
            say_private(ctx, format!("✅ Sperre für `{}` aufgehoben.", token)).await
        }
        Ok((token, false)) => {
            say_private(ctx, format!("ℹ️ `{}` war nicht gesperrt.", token)).await
        }
        Err(e) => say_policy_error(ctx, e).await,
    }
}

/// Set the cooldown between two submissions (0 disables it)
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn cooldown(
    ctx: Context<'_>,
    #[description = "Sekunden"] seconds: i64,
) -> Result<(), Error> {
    let guild_id = guild_id(&ctx)?;
    let result = ctx.data().core.set_cooldown(guild_id, seconds).await;
    confirm(ctx, result, |c| {
        format!("Cooldown ist jetzt {} Sekunden.", c.cooldown_seconds)
    })
    .await
}

/// Reset the cooldown for the author of a post, or for everyone
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn reset_cooldown(
    ctx: Context<'_>,
    #[description = "ID eines Beitrags (leer = alle)"] message_id: Option<String>,
) -> Result<(), Error> {
    let guild_id = guild_id(&ctx)?;
    let message_id = match message_id.as_deref().map(delivery::parse_message_id) {
        Some(None) => return say_private(ctx, "❌ Ungültige Nachricht-ID.").await,
        Some(Some(id)) => Some(id),
        None => None,
    };
    match ctx.data().core.clear_cooldowns(guild_id, message_id).await {
        Ok(cleared) => {
            say_private(ctx, format!("✅ Cooldown für {} Verfasser zurückgesetzt.", cleared)).await
        }
        Err(e) => say_policy_error(ctx, e).await,
    }
}

/// Delete confessions automatically after a while
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn autodelete(
    ctx: Context<'_>,
    #[description = "Automatisch löschen?"] enabled: bool,
    #[description = "Nach wie vielen Minuten"] minutes: Option<i64>,
) -> Result<(), Error> {
    let guild_id = guild_id(&ctx)?;
    let result = ctx
        .data()
        .core
        .set_auto_delete(guild_id, enabled, minutes)
        .await;
    confirm(ctx, result, |c| {
        if c.auto_delete_enabled {
            format!(
                "Beichten werden nach {} Minuten gelöscht.",
                c.auto_delete_minutes
            )
        } else {
            "Automatisches Löschen ist aus.".to_string()
        }
    })
    .await
}

/// Configure how crisis language is handled
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn crisis(
    ctx: Context<'_>,
    #[description = "Mod-Team bei Krisen-Hinweisen benachrichtigen"] enabled: bool,
    #[description = "Krisen-Beiträge nicht öffentlich posten"] suppress: Option<bool>,
) -> Result<(), Error> {
    let guild_id = guild_id(&ctx)?;
    let result = ctx
        .data()
        .core
        .set_crisis_response(guild_id, enabled, suppress)
        .await;
    confirm(ctx, result, |c| {
        format!(
            "Krisen-Hinweise: {}, öffentliche Unterdrückung: {}.",
            on_off(c.crisis_response_enabled),
            on_off(c.suppress_crisis_posts)
        )
    })
    .await
}

/// Allow an additional target channel, or clear the list (only the default
/// channel stays allowed)
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn channels(
    ctx: Context<'_>,
    #[description = "Channel erlauben (leer = Liste leeren)"]
    #[channel_types("Text")]
    channel: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    let guild_id = guild_id(&ctx)?;
    let core = &ctx.data().core;
    let allowed = match channel {
        Some(channel) => {
            let mut current = match core.config(guild_id).await {
                Ok(config) => config.allowed_target_channels,
                Err(e) => return say_policy_error(ctx, e).await,
            };
            current.insert(channel.id.get());
            current
        }
        None => BTreeSet::new(),
    };
    let result = core.set_allowed_channels(guild_id, allowed).await;
    confirm(ctx, result, allowed_channels_summary).await
}

fn allowed_channels_summary(config: &PolicyConfig) -> String {
    if config.allowed_target_channels.is_empty() {
        format!(
            "Nur der Standard-Channel ({}) ist erlaubt.",
            channel_mention(config.target_channel_id)
        )
    } else {
        let list: Vec<String> = config
            .allowed_target_channels
            .iter()
            .map(|id| format!("<#{}>", id))
            .collect();
        format!(
            "Erlaubte Channels: {} und {}",
            channel_mention(config.target_channel_id),
            list.join(", ")
        )
    }
}

/// Set the notice shown under every confession (empty removes it)
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn banner(
    ctx: Context<'_>,
    #[description = "Hinweistext"] text: Option<String>,
) -> Result<(), Error> {
    let guild_id = guild_id(&ctx)?;
    let result = ctx.data().core.set_notice_banner(guild_id, text).await;
    confirm(ctx, result, |c| match &c.notice_banner {
        Some(text) => format!("Hinweis gesetzt: {}", text),
        None => "Hinweis entfernt.".to_string(),
    })
    .await
}

/// Lock new discussion threads by default
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn threadlock(
    ctx: Context<'_>,
    #[description = "Threads standardmäßig sperren"] locked: bool,
) -> Result<(), Error> {
    let guild_id = guild_id(&ctx)?;
    let result = ctx.data().core.set_thread_lock(guild_id, locked).await;
    confirm(ctx, result, |c| {
        format!("Threads standardmäßig gesperrt: {}.", on_off(c.default_thread_lock))
    })
    .await
}

/// Link to an anonymous post, e.g. to find it again after a report
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn link(
    ctx: Context<'_>,
    #[description = "ID des anonymen Beitrags"] message_id: String,
) -> Result<(), Error> {
    let guild_id = guild_id(&ctx)?;
    let Some(message_id) = delivery::parse_message_id(&message_id) else {
        return say_private(ctx, "❌ Ungültige Nachricht-ID.").await;
    };
    match ctx.data().core.post_channel(guild_id, message_id).await {
        Ok(channel_id) => {
            say_private(ctx, delivery::message_link(guild_id, channel_id, message_id)).await
        }
        Err(e) => say_policy_error(ctx, e).await,
    }
}

/// Show counters and current settings
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn stats(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = guild_id(&ctx)?;
    let core = &ctx.data().core;
    let (stats, config) = match (core.stats(guild_id).await, core.config(guild_id).await) {
        (Ok(stats), Ok(config)) => (stats, config),
        (Err(e), _) | (_, Err(e)) => return say_policy_error(ctx, e).await,
    };
    let counters = &stats.stats;

    let embed = serenity::CreateEmbed::new()
        .title("BeichtBot Statistiken")
        .color(serenity::Colour::DARK_GOLD)
        .field("Beichten", counters.confessions.to_string(), true)
        .field("Antworten", counters.replies.to_string(), true)
        .field("Meldungen", counters.reports.to_string(), true)
        .field(
            "Abgelehnt",
            format!(
                "gesperrt: {}\nCooldown: {}\nSchlüsselwort fehlt: {}",
                counters.rejected_banned, counters.rejected_cooldown, counters.rejected_missing_word
            ),
            true,
        )
        .field(
            "Markierungen",
            format!(
                "Begriffe: {}\nPII: {}\nKrise: {}",
                counters.banned_word_flags, counters.pii_flags, counters.crisis_flags
            ),
            true,
        )
        .field(
            "Verfasser",
            format!(
                "bekannt: {}\nmarkiert: {}\ngesperrt: {}",
                stats.tracked_identities, stats.flagged_identities, stats.banned_identities
            ),
            true,
        )
        .field(
            "Einstellungen",
            format!(
                "Ziel: {}\nMods: {}\nCooldown: {}s\nBlockierte Begriffe: {}\nPflicht-Schlüsselwörter: {}\nAuto-Löschen: {}\nKrisen-Hinweise: {}",
                channel_mention(config.target_channel_id),
                channel_mention(config.mod_channel_id),
                config.cooldown_seconds,
                stats.banned_words,
                config.required_words.len(),
                on_off(config.auto_delete_enabled),
                on_off(config.crisis_response_enabled)
            ),
            false,
        );

    ctx.send(
        poise::CreateReply::default()
            .embed(embed)
            .ephemeral(true),
    )
    .await?;
    Ok(())
}

/// Remove all configuration and counters for this server
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn reset(
    ctx: Context<'_>,
    #[description = "Zum Bestätigen \"RESET\" eingeben"] confirm: String,
) -> Result<(), Error> {
    let guild_id = guild_id(&ctx)?;
    if confirm.trim() != "RESET" {
        return say_private(ctx, "❌ Abgebrochen. Zum Bestätigen `RESET` eingeben.").await;
    }
    match ctx.data().core.reset(guild_id).await {
        Ok(()) => say_private(ctx, "✅ BeichtBot wurde für diesen Server zurückgesetzt.").await,
        Err(e) => say_policy_error(ctx, e).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_split_on_commas() {
        assert_eq!(split_words(" a, b c ,,d "), vec!["a", "b c", "d"]);
        assert!(split_words(" , ").is_empty());
    }

    #[test]
    fn channel_summary_matches_what_is_allowed() {
        let mut config = PolicyConfig::new(1, chrono::Utc::now());
        config.target_channel_id = Some(10);

        assert_eq!(config.resolve_target(Some(11)), None);
        assert_eq!(
            allowed_channels_summary(&config),
            "Nur der Standard-Channel (<#10>) ist erlaubt."
        );

        config.allowed_target_channels = BTreeSet::from([11]);
        assert_eq!(config.resolve_target(Some(11)), Some(11));
        assert_eq!(
            allowed_channels_summary(&config),
            "Erlaubte Channels: <#10> und <#11>"
        );
    }
}
