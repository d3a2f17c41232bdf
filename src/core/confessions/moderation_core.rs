// Moderation core - orchestrates one submission at a time.
//
// Per submission:
//   Received -> BanChecked -> CooldownChecked -> Scanned -> Decided
// A confession without any of the guild's required keywords is turned away
// after scanning, unless it has to reach the moderators as a crisis.
//
// The machine itself holds no state between calls; everything that must
// survive lives in the PolicyStore. Submissions from the same identity are
// serialized through IdentityLocks so the cooldown check and the timestamp
// write happen as one step.
//
// NO Discord dependencies here - just pure domain logic.

use super::confession_models::{
    DeliveredPost, IdentityToken, PolicyConfig, PostRecord, RiskVerdict, StatsSnapshot,
    SubmissionDecision, SubmissionKind, SubmissionOutcome, SubmissionRequest,
    DEFAULT_AUTO_DELETE_MINUTES,
};
use super::cooldown_gate;
use super::identity_locks::IdentityLocks;
use super::policy_store::{
    apply_flagged_attempt, apply_submission, PolicyError, PolicyStore, SnapshotBackend,
};
use super::pseudonymizer::Pseudonymizer;
use super::risk_scanner;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Longest notice banner moderators may set.
pub const MAX_NOTICE_BANNER_LEN: usize = 300;

/// Longest banned or required word/phrase.
pub const MAX_WORD_LEN: usize = 100;

pub struct ModerationCore<B: SnapshotBackend> {
    store: PolicyStore<B>,
    pseudonymizer: Pseudonymizer,
    locks: IdentityLocks,
}

impl<B: SnapshotBackend> ModerationCore<B> {
    pub fn new(store: PolicyStore<B>, pseudonymizer: Pseudonymizer) -> Self {
        Self {
            store,
            pseudonymizer,
            locks: IdentityLocks::new(),
        }
    }

    pub fn store(&self) -> &PolicyStore<B> {
        &self.store
    }

    // ========================================================================
    // SUBMISSIONS
    // ========================================================================

    pub async fn submit(
        &self,
        request: SubmissionRequest,
    ) -> Result<SubmissionDecision, PolicyError> {
        self.submit_at(request, Utc::now()).await
    }

    /// Process a submission as if it arrived at `now`.
    pub async fn submit_at(
        &self,
        request: SubmissionRequest,
        now: DateTime<Utc>,
    ) -> Result<SubmissionDecision, PolicyError> {
        let guild_id = request.guild_id;
        // The raw id is not used past this line
        let token = self.pseudonymizer.token_for(request.author_id);
        let _guard = self.locks.acquire(guild_id, &token).await;
        tracing::debug!(guild_id, kind = %request.kind, "Submission received");

        let config = self.store.get_config(guild_id).await?;

        // --- BanChecked ---
        if config.banner_list.contains(&token) {
            self.store
                .update_guild(guild_id, |guild| {
                    apply_flagged_attempt(guild, &token);
                    guild.stats.rejected_banned += 1;
                    Ok(())
                })
                .await?;
            tracing::debug!(guild_id, outcome = "banned", "Submission decided");
            return Ok(SubmissionDecision::rejected(
                SubmissionOutcome::RejectedBanned,
                token,
                request.thread_ref,
            ));
        }

        if request.kind == SubmissionKind::Report {
            return self.route_report(&config, request, token).await;
        }

        // --- CooldownChecked ---
        let record = self.store.submission_record(guild_id, &token).await?;
        if let Some(wait) = cooldown_gate::remaining(&record, config.cooldown_seconds, now) {
            // The stored timestamp stays put so spamming cannot extend or
            // refresh the window
            self.store
                .bump_stats(guild_id, |s| s.rejected_cooldown += 1)
                .await?;
            tracing::debug!(guild_id, outcome = "cooldown", "Submission decided");
            let mut decision = SubmissionDecision::rejected(
                SubmissionOutcome::RejectedCooldown,
                token,
                request.thread_ref,
            );
            decision.retry_after = Some(wait);
            return Ok(decision);
        }

        // --- Scanned ---
        let verdict = risk_scanner::scan(&request.text, &config);

        if verdict.missing_required_word
            && request.kind == SubmissionKind::Confession
            && !(verdict.crisis_suspected && config.crisis_response_enabled)
        {
            self.store
                .bump_stats(guild_id, |s| s.rejected_missing_word += 1)
                .await?;
            tracing::debug!(guild_id, outcome = "missing_word", "Submission decided");
            return Ok(SubmissionDecision::rejected(
                SubmissionOutcome::RejectedMissingWord,
                token,
                request.thread_ref,
            ));
        }

        // --- Decided ---
        let decision = decide(&config, &request, &verdict, token);

        let flagged = verdict.is_flagged();
        let kind = request.kind;
        self.store
            .update_guild(guild_id, |guild| {
                apply_submission(guild, &decision.identity_token, now, flagged);
                let stats = &mut guild.stats;
                match kind {
                    SubmissionKind::Reply => stats.replies += 1,
                    _ => stats.confessions += 1,
                }
                if verdict.contains_banned_word {
                    stats.banned_word_flags += 1;
                }
                if verdict.pii_suspected {
                    stats.pii_flags += 1;
                }
                if verdict.crisis_suspected {
                    stats.crisis_flags += 1;
                }
                Ok(())
            })
            .await?;

        tracing::debug!(
            guild_id,
            outcome = %decision.outcome,
            flagged,
            "Submission decided"
        );
        Ok(decision)
    }

    /// Reports skip cooldown and scanning; the moderators are the filter.
    async fn route_report(
        &self,
        config: &PolicyConfig,
        request: SubmissionRequest,
        token: IdentityToken,
    ) -> Result<SubmissionDecision, PolicyError> {
        self.store
            .bump_stats(config.guild_id, |s| s.reports += 1)
            .await?;

        let reason = request.text.trim();
        let reason = if reason.is_empty() {
            "kein Grund angegeben"
        } else {
            reason
        };
        let target = match request.thread_ref {
            Some(thread) => format!("Beitrag `{}`", thread.0),
            None => "unbekannter Beitrag".to_string(),
        };
        let notice = format!(
            "🛡️ **Neue Meldung**\nZiel: {}\nGrund: {}",
            target,
            neutralize_mentions(reason)
        );

        tracing::debug!(guild_id = config.guild_id, outcome = "report", "Submission decided");
        Ok(SubmissionDecision {
            outcome: SubmissionOutcome::AcceptedRedirectedToMod,
            sanitized_text: String::new(),
            notice_banner: None,
            moderator_notice: Some(notice),
            deliver_publicly: false,
            retry_after: None,
            thread_ref: request.thread_ref,
            identity_token: token,
        })
    }

    /// Remember which token wrote a delivered post, so it can be banned later
    /// by message id.
    pub async fn record_delivery(
        &self,
        guild_id: u64,
        post: DeliveredPost,
        decision: &SubmissionDecision,
    ) -> Result<(), PolicyError> {
        self.store
            .record_post(
                guild_id,
                post.message_id,
                PostRecord {
                    identity_token: decision.author_token().clone(),
                    posted_at: Utc::now(),
                    channel_id: Some(post.channel_id),
                    replies_allowed: post.replies_allowed,
                },
            )
            .await
    }

    // ========================================================================
    // ADMINISTRATION
    // ========================================================================

    pub async fn setup(
        &self,
        guild_id: u64,
        target_channel_id: u64,
        mod_channel_id: Option<u64>,
    ) -> Result<PolicyConfig, PolicyError> {
        let config = self
            .store
            .setup_community(guild_id, target_channel_id, mod_channel_id)
            .await?;
        tracing::info!(guild_id, "Confession channel configured");
        Ok(config)
    }

    pub async fn config(&self, guild_id: u64) -> Result<PolicyConfig, PolicyError> {
        self.store.get_config(guild_id).await
    }

    pub async fn stats(&self, guild_id: u64) -> Result<StatsSnapshot, PolicyError> {
        self.store.stats_snapshot(guild_id).await
    }

    /// Add banned words/phrases. Input is normalized; duplicates are ignored.
    pub async fn add_banned_words(
        &self,
        guild_id: u64,
        words: &[String],
    ) -> Result<PolicyConfig, PolicyError> {
        let normalized = normalize_word_list(words)?;
        self.store
            .apply_config_mutation(guild_id, |config| {
                for word in normalized {
                    if !config.banned_words.contains(&word) {
                        config.banned_words.push(word);
                    }
                }
                Ok(())
            })
            .await
    }

    pub async fn remove_banned_words(
        &self,
        guild_id: u64,
        words: &[String],
    ) -> Result<PolicyConfig, PolicyError> {
        let normalized = normalize_word_list(words)?;
        self.store
            .apply_config_mutation(guild_id, |config| {
                config.banned_words.retain(|w| !normalized.contains(w));
                Ok(())
            })
            .await
    }

    /// Add keywords of which every confession must contain at least one.
    pub async fn add_required_words(
        &self,
        guild_id: u64,
        words: &[String],
    ) -> Result<PolicyConfig, PolicyError> {
        let normalized = normalize_word_list(words)?;
        self.store
            .apply_config_mutation(guild_id, |config| {
                for word in normalized {
                    if !config.required_words.contains(&word) {
                        config.required_words.push(word);
                    }
                }
                Ok(())
            })
            .await
    }

    /// Remove required keywords. Once the list is empty the requirement is off.
    pub async fn remove_required_words(
        &self,
        guild_id: u64,
        words: &[String],
    ) -> Result<PolicyConfig, PolicyError> {
        let normalized = normalize_word_list(words)?;
        self.store
            .apply_config_mutation(guild_id, |config| {
                config.required_words.retain(|w| !normalized.contains(w));
                Ok(())
            })
            .await
    }

    pub async fn ban_token(&self, guild_id: u64, token: &IdentityToken) -> Result<bool, PolicyError> {
        self.store.add_to_banner(guild_id, token).await
    }

    pub async fn unban_token(
        &self,
        guild_id: u64,
        token: &IdentityToken,
    ) -> Result<bool, PolicyError> {
        self.store.remove_from_banner(guild_id, token).await
    }

    /// Ban whoever wrote `message_id`. Returns the token so moderators can
    /// refer to the ban without learning the identity.
    pub async fn ban_author_of_post(
        &self,
        guild_id: u64,
        message_id: u64,
    ) -> Result<(IdentityToken, bool), PolicyError> {
        let token = self.author_of_post(guild_id, message_id).await?;
        let added = self.store.add_to_banner(guild_id, &token).await?;
        tracing::info!(guild_id, "Author of an anonymous post was banned");
        Ok((token, added))
    }

    pub async fn unban_author_of_post(
        &self,
        guild_id: u64,
        message_id: u64,
    ) -> Result<(IdentityToken, bool), PolicyError> {
        let token = self.author_of_post(guild_id, message_id).await?;
        let removed = self.store.remove_from_banner(guild_id, &token).await?;
        Ok((token, removed))
    }

    /// Whether `message_id` is a post this bot delivered anonymously.
    pub async fn is_anonymous_post(
        &self,
        guild_id: u64,
        message_id: u64,
    ) -> Result<bool, PolicyError> {
        Ok(self.store.author_of_post(guild_id, message_id).await?.is_some())
    }

    /// Whether the author of `message_id` allowed anonymous replies.
    pub async fn accepts_replies(&self, guild_id: u64, message_id: u64) -> Result<bool, PolicyError> {
        Ok(self.known_post(guild_id, message_id).await?.replies_allowed)
    }

    /// Channel holding an anonymous post. Posts recorded before channels were
    /// tracked are assumed to be in the default target channel.
    pub async fn post_channel(&self, guild_id: u64, message_id: u64) -> Result<u64, PolicyError> {
        let post = self.known_post(guild_id, message_id).await?;
        match post.channel_id {
            Some(channel) => Ok(channel),
            None => self.config(guild_id).await?.target_channel_id.ok_or_else(|| {
                PolicyError::Validation("no target channel configured".to_string())
            }),
        }
    }

    async fn known_post(&self, guild_id: u64, message_id: u64) -> Result<PostRecord, PolicyError> {
        self.store
            .post_record(guild_id, message_id)
            .await?
            .ok_or_else(|| unknown_post(message_id))
    }

    async fn author_of_post(
        &self,
        guild_id: u64,
        message_id: u64,
    ) -> Result<IdentityToken, PolicyError> {
        self.store
            .author_of_post(guild_id, message_id)
            .await?
            .ok_or_else(|| unknown_post(message_id))
    }

    /// Set the cooldown. Negative values are rejected before anything changes.
    pub async fn set_cooldown(&self, guild_id: u64, seconds: i64) -> Result<PolicyConfig, PolicyError> {
        let seconds = u64::try_from(seconds).map_err(|_| {
            PolicyError::Validation("cooldown must not be negative".to_string())
        })?;
        self.store
            .apply_config_mutation(guild_id, |config| {
                config.cooldown_seconds = seconds;
                Ok(())
            })
            .await
    }

    /// Reset the cooldown for the author of one post, or for everyone.
    pub async fn clear_cooldowns(
        &self,
        guild_id: u64,
        message_id: Option<u64>,
    ) -> Result<usize, PolicyError> {
        match message_id {
            Some(id) => {
                let token = self.author_of_post(guild_id, id).await?;
                self.store.clear_cooldowns(guild_id, Some(&token)).await
            }
            None => self.store.clear_cooldowns(guild_id, None).await,
        }
    }

    pub async fn set_auto_delete(
        &self,
        guild_id: u64,
        enabled: bool,
        minutes: Option<i64>,
    ) -> Result<PolicyConfig, PolicyError> {
        let minutes = match minutes {
            Some(m) if m < 1 => {
                return Err(PolicyError::Validation(
                    "auto-delete delay must be at least one minute".to_string(),
                ))
            }
            Some(m) => Some(m as u64),
            None => None,
        };
        self.store
            .apply_config_mutation(guild_id, |config| {
                config.auto_delete_enabled = enabled;
                if let Some(m) = minutes {
                    config.auto_delete_minutes = m;
                } else if config.auto_delete_minutes == 0 {
                    config.auto_delete_minutes = DEFAULT_AUTO_DELETE_MINUTES;
                }
                Ok(())
            })
            .await
    }

    pub async fn set_crisis_response(
        &self,
        guild_id: u64,
        enabled: bool,
        suppress_public_post: Option<bool>,
    ) -> Result<PolicyConfig, PolicyError> {
        self.store
            .apply_config_mutation(guild_id, |config| {
                config.crisis_response_enabled = enabled;
                if let Some(suppress) = suppress_public_post {
                    config.suppress_crisis_posts = suppress;
                }
                Ok(())
            })
            .await
    }

    /// Keep crisis posts out of the public channel (moderators still get them).
    pub async fn set_crisis_suppression(
        &self,
        guild_id: u64,
        suppress: bool,
    ) -> Result<PolicyConfig, PolicyError> {
        self.store
            .apply_config_mutation(guild_id, |config| {
                config.suppress_crisis_posts = suppress;
                Ok(())
            })
            .await
    }

    pub async fn set_allowed_channels(
        &self,
        guild_id: u64,
        channels: BTreeSet<u64>,
    ) -> Result<PolicyConfig, PolicyError> {
        self.store
            .apply_config_mutation(guild_id, |config| {
                config.allowed_target_channels = channels;
                Ok(())
            })
            .await
    }

    pub async fn set_notice_banner(
        &self,
        guild_id: u64,
        text: Option<String>,
    ) -> Result<PolicyConfig, PolicyError> {
        let text = text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        if let Some(t) = &text {
            if t.chars().count() > MAX_NOTICE_BANNER_LEN {
                return Err(PolicyError::Validation(format!(
                    "banner must be at most {} characters",
                    MAX_NOTICE_BANNER_LEN
                )));
            }
        }
        self.store
            .apply_config_mutation(guild_id, |config| {
                config.notice_banner = text;
                Ok(())
            })
            .await
    }

    pub async fn set_thread_lock(
        &self,
        guild_id: u64,
        locked: bool,
    ) -> Result<PolicyConfig, PolicyError> {
        self.store
            .apply_config_mutation(guild_id, |config| {
                config.default_thread_lock = locked;
                Ok(())
            })
            .await
    }

    pub async fn reset(&self, guild_id: u64) -> Result<(), PolicyError> {
        self.store.reset_community(guild_id).await?;
        tracing::info!(guild_id, "Confession configuration reset");
        Ok(())
    }
}

// ============================================================================
// DECISION POLICY
// ============================================================================

/// Apply the precedence rules to a scanned, allowed submission.
fn decide(
    config: &PolicyConfig,
    request: &SubmissionRequest,
    verdict: &RiskVerdict,
    token: IdentityToken,
) -> SubmissionDecision {
    let sanitized_text = sanitize(&request.text, verdict);

    let (outcome, moderator_notice, deliver_publicly) =
        if verdict.crisis_suspected && config.crisis_response_enabled {
            (
                SubmissionOutcome::AcceptedRedirectedToMod,
                Some(crisis_notice(request, verdict, config.suppress_crisis_posts)),
                !config.suppress_crisis_posts,
            )
        } else if verdict.contains_banned_word || verdict.pii_suspected {
            (
                SubmissionOutcome::AcceptedWithWarning,
                Some(warning_notice(request, verdict)),
                true,
            )
        } else {
            (SubmissionOutcome::Accepted, None, true)
        };

    SubmissionDecision {
        outcome,
        sanitized_text,
        notice_banner: config.notice_banner.as_deref().map(neutralize_mentions),
        moderator_notice,
        deliver_publicly,
        retry_after: None,
        thread_ref: request.thread_ref,
        identity_token: token,
    }
}

/// Redact matches and defuse mass mentions.
fn sanitize(text: &str, verdict: &RiskVerdict) -> String {
    let redacted = if verdict.contains_banned_word || verdict.pii_suspected {
        risk_scanner::redact(text, &verdict.matched_terms)
    } else {
        text.to_string()
    };
    neutralize_mentions(redacted.trim())
}

/// Insert a zero-width space after every `@` so nothing pings.
pub fn neutralize_mentions(text: &str) -> String {
    text.replace('@', "@\u{200B}")
}

fn crisis_notice(request: &SubmissionRequest, verdict: &RiskVerdict, suppressed: bool) -> String {
    let mut notice = format!(
        "⚠️ **Hinweis auf eine mögliche Krise** ({})\nErkannte Begriffe: {}",
        request.kind,
        verdict.crisis_terms.join(", ")
    );
    if suppressed {
        notice.push_str("\nDer Beitrag wurde nicht öffentlich gepostet:\n");
        notice.push_str(&format!("||{}||", neutralize_mentions(request.text.trim())));
    }
    if verdict.contains_banned_word || verdict.pii_suspected {
        notice.push('\n');
        notice.push_str(&detail_lines(verdict));
    }
    notice
}

fn warning_notice(request: &SubmissionRequest, verdict: &RiskVerdict) -> String {
    format!(
        "⚠️ **Anonymer Beitrag mit Warnung** ({})\n{}",
        request.kind,
        detail_lines(verdict)
    )
}

fn detail_lines(verdict: &RiskVerdict) -> String {
    let mut lines = Vec::new();
    if verdict.contains_banned_word {
        lines.push(format!(
            "Blockierte Begriffe: {}",
            verdict
                .matched_terms
                .iter()
                .map(|t| format!("`{}`", t))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    if verdict.pii_suspected {
        lines.push(format!("Mögliche persönliche Daten: {}", verdict.pii_kinds.join(", ")));
    }
    lines.join("\n")
}

fn unknown_post(message_id: u64) -> PolicyError {
    PolicyError::Validation(format!(
        "message {} is not a known anonymous post",
        message_id
    ))
}

fn normalize_word_list(words: &[String]) -> Result<Vec<String>, PolicyError> {
    let mut out: Vec<String> = Vec::new();
    for word in words {
        let normalized = risk_scanner::normalize(word);
        if normalized.is_empty() {
            continue;
        }
        if normalized.chars().count() > MAX_WORD_LEN {
            return Err(PolicyError::Validation(format!(
                "words must be at most {} characters",
                MAX_WORD_LEN
            )));
        }
        if !out.contains(&normalized) {
            out.push(normalized);
        }
    }
    if out.is_empty() {
        return Err(PolicyError::Validation("no usable words given".to_string()));
    }
    Ok(out)
}

// ============================================================================
// TESTS
// ============================================================================
