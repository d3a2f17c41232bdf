// Discord commands for anonymous confessions.
//
// The pattern is the same for every command:
// 1. Extract primitive data from Discord types
// 2. Call the moderation core
// 3. Deliver or explain the decision
//
// All replies are ephemeral so nobody else sees who used the command.

use crate::core::confessions::{
    DeliveredPost, ModerationCore, PolicyError, SubmissionDecision, SubmissionKind,
    SubmissionOutcome, SubmissionRequest, ThreadRef,
};
use crate::discord::delivery;
use crate::infra::confessions::JsonSnapshotFile;
use poise::serenity_prelude as serenity;
use std::sync::Arc;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;

// User data, which is stored and accessible in all command invocations
pub struct Data {
    pub core: Arc<ModerationCore<JsonSnapshotFile>>,
}

/// Longest confession text; leaves room for the TW line and spoiler markup.
const MAX_TEXT_LEN: usize = 1800;

/// Sent to the moderators when a post went out but could not be recorded.
const UNRECORDED_POST_NOTICE: &str = "⚠️ **Anonymer Beitrag nicht registriert**\nDer Beitrag wurde gepostet, konnte aber nicht gespeichert werden. Sperren, Cooldown-Reset und Antworten über diese Nachricht-ID funktionieren nicht.";

/// Appended to the author's confirmation in the same case.
const UNRECORDED_POST_HINT: &str = "\n⚠️ Der Beitrag konnte nicht vollständig registriert werden. Anonyme Antworten darauf sind eventuell nicht möglich.";

pub(crate) async fn say_private(ctx: Context<'_>, text: impl Into<String>) -> Result<(), Error> {
    ctx.send(
        poise::CreateReply::default()
            .content(text)
            .ephemeral(true),
    )
    .await?;
    Ok(())
}

/// User-facing text for a core error.
pub(crate) fn policy_error_message(e: &PolicyError) -> String {
    match e {
        PolicyError::NotFound(_) => {
            "❌ BeichtBot ist hier noch nicht eingerichtet. Ein Admin muss zuerst `/beichtbot setup` ausführen.".to_string()
        }
        PolicyError::Persistence(_) => {
            "❌ Das konnte gerade nicht gespeichert werden. Bitte versuche es gleich noch einmal."
                .to_string()
        }
        PolicyError::Validation(reason) => format!("❌ Ungültige Eingabe: {}", reason),
    }
}

pub(crate) async fn say_policy_error(ctx: Context<'_>, e: PolicyError) -> Result<(), Error> {
    if let PolicyError::Persistence(detail) = &e {
        tracing::error!("Confession state could not be persisted: {}", detail);
    }
    say_private(ctx, policy_error_message(&e)).await
}

fn rejection_message(decision: &SubmissionDecision) -> Option<String> {
    match decision.outcome {
        SubmissionOutcome::RejectedBanned => Some(
            "🚫 Du kannst in diesem Server keine anonymen Beiträge mehr senden.".to_string(),
        ),
        SubmissionOutcome::RejectedMissingWord => Some(
            "❌ Dein Text enthält keines der notwendigen Schlüsselwörter.".to_string(),
        ),
        SubmissionOutcome::RejectedCooldown => {
            let secs = decision
                .retry_after
                .map(|d| d.as_secs().max(1))
                .unwrap_or(1);
            Some(format!(
                "⏳ Bitte warte noch {} Sekunden, bevor du wieder etwas sendest.",
                secs
            ))
        }
        _ => None,
    }
}

fn guild_id(ctx: &Context<'_>) -> Result<u64, Error> {
    Ok(ctx
        .guild_id()
        .ok_or("Dieser Befehl funktioniert nur in Servern")?
        .get())
}

/// Post an anonymous confession.
#[poise::command(slash_command, guild_only)]
pub async fn beichten(
    ctx: Context<'_>,
    #[description = "Deine Beichte"] text: String,
    #[description = "Triggerwarnungen, durch Komma getrennt"] trigger_words: Option<String>,
    #[description = "Ziel-Channel (falls erlaubt)"]
    #[channel_types("Text")]
    channel: Option<serenity::GuildChannel>,
    #[description = "Diskussions-Thread sperren? (Standard: Server-Einstellung)"]
    lock_thread: Option<bool>,
    #[description = "Anonyme Antworten erlauben? (Standard: ja)"] allow_replies: Option<bool>,
) -> Result<(), Error> {
    let guild_id = guild_id(&ctx)?;
    ctx.defer_ephemeral().await?;

    if text.trim().is_empty() || text.chars().count() > MAX_TEXT_LEN {
        return say_private(
            ctx,
            format!("❌ Der Text muss zwischen 1 und {} Zeichen lang sein.", MAX_TEXT_LEN),
        )
        .await;
    }

    let core = &ctx.data().core;
    let config = match core.config(guild_id).await {
        Ok(config) => config,
        Err(e) => return say_policy_error(ctx, e).await,
    };
    // Resolve before submitting so a bad channel choice does not start a cooldown
    let Some(target) = config.resolve_target(channel.map(|c| c.id.get())) else {
        return say_private(ctx, "❌ Kein gültiger Ziel-Channel konfiguriert.").await;
    };

    let request = SubmissionRequest {
        guild_id,
        author_id: ctx.author().id.get(),
        text,
        kind: SubmissionKind::Confession,
        thread_ref: None,
    };
    let decision = match core.submit(request).await {
        Ok(decision) => decision,
        Err(e) => return say_policy_error(ctx, e).await,
    };
    if let Some(reason) = rejection_message(&decision) {
        return say_private(ctx, reason).await;
    }

    let http = ctx.http();
    let target = serenity::ChannelId::new(target);
    let mut link = None;
    let mut thread_open = false;
    let mut unrecorded = false;

    if decision.deliver_publicly {
        let trigger_words = delivery::parse_trigger_words(trigger_words.as_deref());
        let content = delivery::format_public_post(
            &decision.sanitized_text,
            decision.notice_banner.as_deref(),
            &trigger_words,
        );
        let message = match delivery::send_silent(http, target, content).await {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(guild_id, "Failed to post confession: {}", e);
                return say_private(ctx, "❌ Die Beichte konnte nicht gepostet werden.").await;
            }
        };

        let post = DeliveredPost {
            channel_id: target.get(),
            message_id: message.id.get(),
            replies_allowed: allow_replies.unwrap_or(true),
        };
        if let Err(e) = core.record_delivery(guild_id, post, &decision).await {
            tracing::error!(guild_id, "Failed to remember confession post: {}", e);
            unrecorded = true;
        }

        let lock = lock_thread.unwrap_or(config.default_thread_lock);
        thread_open = delivery::open_thread(http, target, message.id, lock)
            .await
            .is_some()
            && !lock;

        if config.auto_delete_enabled {
            delivery::schedule_auto_delete(
                ctx.serenity_context().http.clone(),
                target,
                message.id,
                config.auto_delete_minutes,
            );
        }
        link = Some(delivery::message_link(guild_id, target.get(), message.id.get()));
    }

    if let Some(notice) = &decision.moderator_notice {
        delivery::notify_moderators(http, config.mod_channel_id, notice, link.clone()).await;
    }
    if unrecorded {
        delivery::notify_moderators(http, config.mod_channel_id, UNRECORDED_POST_NOTICE, link.clone())
            .await;
    }

    say_private(ctx, confession_reply(&decision, thread_open, unrecorded)).await
}

/// Confirmation shown to the author of an accepted confession.
fn confession_reply(decision: &SubmissionDecision, thread_open: bool, unrecorded: bool) -> String {
    let mut reply = match decision.outcome {
        SubmissionOutcome::AcceptedRedirectedToMod if !decision.deliver_publicly => {
            "💙 Deine Nachricht wurde vertraulich an das Mod-Team weitergeleitet.".to_string()
        }
        _ => "✅ Deine Beichte wurde anonym veröffentlicht.".to_string(),
    };
    match decision.outcome {
        SubmissionOutcome::AcceptedWithWarning => {
            reply.push_str("\nEinige Stellen wurden entfernt (blockierte Begriffe oder persönliche Daten).");
        }
        SubmissionOutcome::AcceptedRedirectedToMod => {
            reply.push_str("\nWenn du in Gefahr bist, suche dir bitte sofort Hilfe, zum Beispiel bei der Telefonseelsorge (0800 111 0 111) oder unter 112.");
        }
        _ => {}
    }
    if thread_open {
        reply.push_str("\nEin Diskussions-Thread wurde geöffnet.");
    }
    if unrecorded {
        reply.push_str(UNRECORDED_POST_HINT);
    }
    reply
}

/// Reply anonymously to a confession.
#[poise::command(slash_command, guild_only)]
pub async fn beichtantwort(
    ctx: Context<'_>,
    #[description = "ID der Beichte"] message_id: String,
    #[description = "Deine Antwort"] text: String,
    #[description = "Gesperrten Thread für diese Antwort entsperren?"] unlock: Option<bool>,
) -> Result<(), Error> {
    let guild_id = guild_id(&ctx)?;
    ctx.defer_ephemeral().await?;

    let Some(message_id) = delivery::parse_message_id(&message_id) else {
        return say_private(ctx, "❌ Ungültige Nachricht-ID.").await;
    };
    if text.trim().is_empty() || text.chars().count() > MAX_TEXT_LEN {
        return say_private(
            ctx,
            format!("❌ Der Text muss zwischen 1 und {} Zeichen lang sein.", MAX_TEXT_LEN),
        )
        .await;
    }

    let core = &ctx.data().core;
    let config = match core.config(guild_id).await {
        Ok(config) => config,
        Err(e) => return say_policy_error(ctx, e).await,
    };
    match core.is_anonymous_post(guild_id, message_id).await {
        Ok(true) => {}
        Ok(false) => return say_private(ctx, "❌ Das ist keine bekannte Beichte.").await,
        Err(e) => return say_policy_error(ctx, e).await,
    }
    match core.accepts_replies(guild_id, message_id).await {
        Ok(true) => {}
        Ok(false) => {
            return say_private(ctx, "❌ Auf diese Beichte kann nicht anonym geantwortet werden.")
                .await
        }
        Err(e) => return say_policy_error(ctx, e).await,
    }
    let parent = match core.post_channel(guild_id, message_id).await {
        Ok(channel_id) => channel_id,
        Err(e) => return say_policy_error(ctx, e).await,
    };

    let request = SubmissionRequest {
        guild_id,
        author_id: ctx.author().id.get(),
        text,
        kind: SubmissionKind::Reply,
        thread_ref: Some(ThreadRef(message_id)),
    };
    let decision = match core.submit(request).await {
        Ok(decision) => decision,
        Err(e) => return say_policy_error(ctx, e).await,
    };
    if let Some(reason) = rejection_message(&decision) {
        return say_private(ctx, reason).await;
    }

    let http = ctx.http();
    let mut link = None;
    let mut unrecorded = false;
    if decision.deliver_publicly {
        let content = delivery::format_public_post(
            &decision.sanitized_text,
            decision.notice_banner.as_deref(),
            &[],
        );
        let message = match delivery::post_to_thread(
            http,
            serenity::ChannelId::new(parent),
            message_id,
            content,
            config.default_thread_lock,
            unlock.unwrap_or(false),
        )
        .await
        {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(guild_id, "Failed to post reply: {}", e);
                return say_private(ctx, "❌ Die Antwort konnte nicht gesendet werden.").await;
            }
        };
        let post = DeliveredPost {
            channel_id: message.channel_id.get(),
            message_id: message.id.get(),
            replies_allowed: true,
        };
        if let Err(e) = core.record_delivery(guild_id, post, &decision).await {
            tracing::error!(guild_id, "Failed to remember reply post: {}", e);
            unrecorded = true;
        }
        link = Some(delivery::message_link(
            guild_id,
            message.channel_id.get(),
            message.id.get(),
        ));
    }

    if let Some(notice) = &decision.moderator_notice {
        delivery::notify_moderators(http, config.mod_channel_id, notice, link.clone()).await;
    }
    if unrecorded {
        delivery::notify_moderators(http, config.mod_channel_id, UNRECORDED_POST_NOTICE, link)
            .await;
    }

    let mut reply = if decision.deliver_publicly {
        "✅ Deine Antwort wurde anonym veröffentlicht.".to_string()
    } else {
        "💙 Deine Antwort wurde vertraulich an das Mod-Team weitergeleitet.".to_string()
    };
    if unrecorded {
        reply.push_str(UNRECORDED_POST_HINT);
    }
    say_private(ctx, reply).await
}

/// Report a post to the moderators, anonymously.
#[poise::command(slash_command, guild_only)]
pub async fn melden(
    ctx: Context<'_>,
    #[description = "ID der Nachricht, die gemeldet werden soll"] message_id: String,
    #[description = "Grund (optional)"] reason: Option<String>,
) -> Result<(), Error> {
    let guild_id = guild_id(&ctx)?;
    ctx.defer_ephemeral().await?;

    let Some(message_id) = delivery::parse_message_id(&message_id) else {
        return say_private(ctx, "❌ Ungültige Nachricht-ID.").await;
    };

    let core = &ctx.data().core;
    let config = match core.config(guild_id).await {
        Ok(config) => config,
        Err(e) => return say_policy_error(ctx, e).await,
    };
    if config.mod_channel_id.is_none() {
        return say_private(ctx, "❌ Es ist kein Mod-Channel konfiguriert.").await;
    }

    let request = SubmissionRequest {
        guild_id,
        author_id: ctx.author().id.get(),
        text: reason.unwrap_or_default(),
        kind: SubmissionKind::Report,
        thread_ref: Some(ThreadRef(message_id)),
    };
    let decision = match core.submit(request).await {
        Ok(decision) => decision,
        Err(e) => return say_policy_error(ctx, e).await,
    };
    if let Some(reason) = rejection_message(&decision) {
        return say_private(ctx, reason).await;
    }

    let link = Some(delivery::message_link(
        guild_id,
        ctx.channel_id().get(),
        message_id,
    ));
    let sent = match &decision.moderator_notice {
        Some(notice) => {
            delivery::notify_moderators(ctx.http(), config.mod_channel_id, notice, link).await
        }
        None => false,
    };

    if sent {
        say_private(ctx, "✅ Danke, die Meldung wurde anonym an das Mod-Team geschickt.").await
    } else {
        say_private(ctx, "❌ Die Meldung konnte nicht zugestellt werden.").await
    }
}

/// Short guide to the confession commands.
#[poise::command(slash_command)]
pub async fn hilfe(ctx: Context<'_>) -> Result<(), Error> {
    let embed = serenity::CreateEmbed::new()
        .title("BeichtBot Hilfe")
        .color(serenity::Colour::BLURPLE)
        .description(
            "**/beichten** – veröffentlicht deine Beichte anonym.\n\
             **/beichtantwort** – antworte anonym auf eine bestehende Beichte.\n\
             **/melden** – informiere das Mod-Team über problematische Inhalte.\n\n\
             Datenschutz: User-IDs werden nie gespeichert, nur ein geheimer Hash.",
        );

    ctx.send(
        poise::CreateReply::default()
            .embed(embed)
            .ephemeral(true),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn error_messages_do_not_leak_details() {
        let msg = policy_error_message(&PolicyError::Persistence("disk /var/x full".to_string()));
        assert!(!msg.contains("/var/x"));
        assert!(policy_error_message(&PolicyError::NotFound(1)).contains("/beichtbot setup"));
    }

    #[test]
    fn cooldown_rejection_reports_seconds() {
        let token = crate::core::confessions::Pseudonymizer::new("s")
            .unwrap()
            .token_for(1);
        let mut decision =
            SubmissionDecision::rejected(SubmissionOutcome::RejectedCooldown, token, None);
        decision.retry_after = Some(Duration::from_secs(42));
        assert!(rejection_message(&decision).unwrap().contains("42 Sekunden"));
    }

    #[test]
    fn missing_keyword_is_explained() {
        let token = crate::core::confessions::Pseudonymizer::new("s")
            .unwrap()
            .token_for(1);
        let decision =
            SubmissionDecision::rejected(SubmissionOutcome::RejectedMissingWord, token, None);
        assert!(rejection_message(&decision)
            .unwrap()
            .contains("Schlüsselwörter"));
    }

    #[test]
    fn unrecorded_post_is_mentioned_in_reply() {
        let token = crate::core::confessions::Pseudonymizer::new("s")
            .unwrap()
            .token_for(1);
        let mut decision = SubmissionDecision::rejected(SubmissionOutcome::Accepted, token, None);
        decision.deliver_publicly = true;

        let normal = confession_reply(&decision, true, false);
        assert!(normal.starts_with("✅"));
        assert!(normal.contains("Diskussions-Thread"));
        assert!(!normal.contains("registriert"));

        let unrecorded = confession_reply(&decision, false, true);
        assert!(unrecorded.ends_with(UNRECORDED_POST_HINT));
        assert!(UNRECORDED_POST_NOTICE.contains("Sperren"));
    }
}
