// Delivery of moderation decisions to Discord: public posts, threads,
// moderator notices and auto-deletion. The core has already decided what may
// be posted; this file only decides how it looks.

use crate::core::confessions::neutralize_mentions;
use poise::serenity_prelude::{
    self as serenity,
    builder::{CreateAllowedMentions, CreateMessage, CreateThread, EditThread},
};
use std::sync::Arc;
use std::time::Duration;

pub const THREAD_NAME: &str = "Beicht-Thread";

/// Small-print line under a post.
const SUBTEXT_PREFIX: &str = "\n\n-# ";

/// Wrap text in a spoiler so nobody reads it by accident.
pub fn spoiler(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }
    // A stray `||` inside would close the spoiler early
    format!("||{}||", text.replace("||", "|\u{200B}|"))
}

/// Split a comma separated trigger-warning list.
pub fn parse_trigger_words(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(|w| w.trim())
        .filter(|w| !w.is_empty())
        .map(neutralize_mentions)
        .collect()
}

/// Public message body: optional TW line, spoilered text, then the guild's
/// notice banner outside the spoiler.
pub fn format_public_post(
    sanitized_text: &str,
    notice_banner: Option<&str>,
    trigger_words: &[String],
) -> String {
    let mut parts = Vec::new();
    if !trigger_words.is_empty() {
        parts.push(format!("**TW:** {}", trigger_words.join(", ")));
    }
    parts.push(spoiler(sanitized_text));

    let mut content = parts.join("\n\n");
    if let Some(banner) = notice_banner.map(str::trim).filter(|b| !b.is_empty()) {
        // One line only, so the banner can not smuggle in more markup
        content.push_str(SUBTEXT_PREFIX);
        content.push_str(&banner.split_whitespace().collect::<Vec<_>>().join(" "));
    }
    content
}

pub fn message_link(guild_id: u64, channel_id: u64, message_id: u64) -> String {
    format!(
        "https://discord.com/channels/{}/{}/{}",
        guild_id, channel_id, message_id
    )
}

/// Parse a message id typed by a user.
pub fn parse_message_id(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok().filter(|id| *id > 0)
}

/// Send text that must never ping anyone.
pub async fn send_silent(
    http: &serenity::Http,
    channel_id: serenity::ChannelId,
    content: String,
) -> Result<serenity::Message, serenity::Error> {
    channel_id
        .send_message(
            http,
            CreateMessage::new()
                .content(content)
                .allowed_mentions(CreateAllowedMentions::new()),
        )
        .await
}

/// Start a discussion thread under a post. Failure is logged, not fatal.
pub async fn open_thread(
    http: &serenity::Http,
    channel_id: serenity::ChannelId,
    message_id: serenity::MessageId,
    locked: bool,
) -> Option<serenity::ChannelId> {
    let thread = match channel_id
        .create_thread_from_message(http, message_id, CreateThread::new(THREAD_NAME))
        .await
    {
        Ok(thread) => thread,
        Err(e) => {
            tracing::warn!("Failed to create confession thread: {}", e);
            return None;
        }
    };

    if locked {
        set_thread_locked(http, thread.id, true).await;
    }
    Some(thread.id)
}

/// Lock or unlock a thread. Returns false (and logs) if Discord refused.
async fn set_thread_locked(
    http: &serenity::Http,
    thread_id: serenity::ChannelId,
    locked: bool,
) -> bool {
    match thread_id
        .edit_thread(http, EditThread::new().locked(locked))
        .await
    {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(locked, "Failed to change confession thread lock: {}", e);
            false
        }
    }
}

/// Lock state of an existing thread, or `None` if there is no such thread.
async fn thread_locked(http: &serenity::Http, thread_id: serenity::ChannelId) -> Option<bool> {
    match thread_id.to_channel(http).await {
        Ok(serenity::Channel::Guild(channel)) => {
            Some(channel.thread_metadata.is_some_and(|m| m.locked))
        }
        _ => None,
    }
}

/// Post into the thread under `message_id`, creating it first if needed.
///
/// Threads started from a message share that message's id. With `unlock` a
/// locked thread is opened for this one post and locked again afterwards.
pub async fn post_to_thread(
    http: &serenity::Http,
    parent_channel: serenity::ChannelId,
    message_id: u64,
    content: String,
    lock_new_thread: bool,
    unlock: bool,
) -> Result<serenity::Message, serenity::Error> {
    let existing = serenity::ChannelId::new(message_id);
    let (thread_id, locked) = match thread_locked(http, existing).await {
        Some(locked) => (existing, locked),
        None => {
            let created = open_thread(
                http,
                parent_channel,
                serenity::MessageId::new(message_id),
                lock_new_thread,
            )
            .await
            .unwrap_or(existing);
            (created, lock_new_thread)
        }
    };

    let relock = unlock && locked && set_thread_locked(http, thread_id, false).await;
    let sent = send_silent(http, thread_id, content).await;
    if relock {
        set_thread_locked(http, thread_id, true).await;
    }
    sent
}

/// Delete a message after `minutes`, in the background.
pub fn schedule_auto_delete(
    http: Arc<serenity::Http>,
    channel_id: serenity::ChannelId,
    message_id: serenity::MessageId,
    minutes: u64,
) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(minutes.saturating_mul(60))).await;
        if let Err(e) = channel_id.delete_message(&*http, message_id).await {
            tracing::info!("Auto-delete skipped, message already gone? {}", e);
        }
    });
}

/// Forward a notice to the moderators. Returns false if there is nowhere to
/// send it or sending failed.
pub async fn notify_moderators(
    http: &serenity::Http,
    mod_channel_id: Option<u64>,
    notice: &str,
    link: Option<String>,
) -> bool {
    let Some(channel) = mod_channel_id else {
        tracing::warn!("Moderator notice dropped, no mod channel configured");
        return false;
    };
    let mut content = notice.to_string();
    if let Some(link) = link {
        content.push_str("\nNachricht: ");
        content.push_str(&link);
    }
    match send_silent(http, serenity::ChannelId::new(channel), content).await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!("Failed to send moderator notice: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spoiler_wraps_and_escapes() {
        assert_eq!(spoiler("  hallo "), "||hallo||");
        assert_eq!(spoiler(""), "");
        assert_eq!(spoiler("a || b"), "||a |\u{200B}| b||");
    }

    #[test]
    fn trigger_words_are_split_and_cleaned() {
        assert_eq!(
            parse_trigger_words(Some(" Tod, , @everyone ,Angst")),
            vec!["Tod", "@\u{200B}everyone", "Angst"]
        );
        assert!(parse_trigger_words(None).is_empty());
    }

    #[test]
    fn public_post_layout() {
        assert_eq!(format_public_post("text", None, &[]), "||text||");
        assert_eq!(
            format_public_post("text", None, &["Tod".to_string()]),
            "**TW:** Tod\n\n||text||"
        );
        assert_eq!(
            format_public_post("text", Some("Sei nett."), &[]),
            "||text||\n\n-# Sei nett."
        );
        assert_eq!(format_public_post("text", Some("  "), &[]), "||text||");
    }

    #[test]
    fn user_text_stays_inside_the_spoiler() {
        assert_eq!(
            format_public_post("secret\n\n-# visible outside spoiler", None, &[]),
            "||secret\n\n-# visible outside spoiler||"
        );
        assert_eq!(
            format_public_post("secret\n\n-# nope", Some("Sei\nnett."), &[]),
            "||secret\n\n-# nope||\n\n-# Sei nett."
        );
    }

    #[test]
    fn message_ids_must_be_numeric() {
        assert_eq!(parse_message_id(" 123 "), Some(123));
        assert_eq!(parse_message_id("abc"), None);
        assert_eq!(parse_message_id("0"), None);
    }
}
