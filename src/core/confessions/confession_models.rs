// Confession domain models - data structures for the anonymous submission system.
//
// These are pure domain types with no Discord dependencies.
// Raw user ids never appear in anything that derives Serialize: the only
// identity that gets stored is the pseudonymous IdentityToken.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// Version of the on-disk snapshot layout.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Default auto-delete delay when a moderator enables auto-delete without a value.
pub const DEFAULT_AUTO_DELETE_MINUTES: u64 = 60;

// ============================================================================
// IDENTITY
// ============================================================================

/// Opaque, non-reversible stand-in for a platform user.
///
/// Always 64 lowercase hex characters (HMAC-SHA256 output). The Display impl
/// only shows a short prefix so tokens never end up in full in chat messages.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityToken(String);

impl IdentityToken {
    pub(crate) fn from_hex(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short reference moderators can use when talking about a ban.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(10)]
    }
}

impl fmt::Display for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}…", self.short())
    }
}

/// Opaque correlation handle for reply routing (a thread / message id on
/// Discord). The core passes it through and never looks inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadRef(pub u64);

// ============================================================================
// POLICY
// ============================================================================

/// Moderator-configured policy for one guild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub guild_id: u64,
    /// Where accepted confessions are posted
    pub target_channel_id: Option<u64>,
    /// Where moderator notices and reports go
    pub mod_channel_id: Option<u64>,
    pub cooldown_seconds: u64,
    pub auto_delete_enabled: bool,
    pub auto_delete_minutes: u64,
    /// Whether crisis detections are routed to moderators
    pub crisis_response_enabled: bool,
    /// Keep crisis-redirected confessions out of the public channel entirely
    pub suppress_crisis_posts: bool,
    /// Normalized banned words/phrases, in the order moderators added them
    pub banned_words: Vec<String>,
    /// Normalized keywords of which a confession must contain at least one.
    /// Empty means no requirement.
    #[serde(default)]
    pub required_words: Vec<String>,
    /// Banned identity tokens
    pub banner_list: BTreeSet<IdentityToken>,
    /// Extra channels confessions may target besides the default one
    pub allowed_target_channels: BTreeSet<u64>,
    /// Footer appended to every public post
    pub notice_banner: Option<String>,
    pub default_thread_lock: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PolicyConfig {
    /// Fresh config: cooldown off, lists empty, flags off.
    pub fn new(guild_id: u64, now: DateTime<Utc>) -> Self {
        Self {
            guild_id,
            target_channel_id: None,
            mod_channel_id: None,
            cooldown_seconds: 0,
            auto_delete_enabled: false,
            auto_delete_minutes: DEFAULT_AUTO_DELETE_MINUTES,
            crisis_response_enabled: false,
            suppress_crisis_posts: false,
            banned_words: Vec::new(),
            required_words: Vec::new(),
            banner_list: BTreeSet::new(),
            allowed_target_channels: BTreeSet::new(),
            notice_banner: None,
            default_thread_lock: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Resolve the channel a confession should go to.
    ///
    /// Falls back to the configured target channel. Any other channel has to
    /// be on the allow-list, so an empty list means only the default channel.
    pub fn resolve_target(&self, requested: Option<u64>) -> Option<u64> {
        let channel = requested.or(self.target_channel_id)?;
        if Some(channel) == self.target_channel_id
            || self.allowed_target_channels.contains(&channel)
        {
            Some(channel)
        } else {
            None
        }
    }
}

// ============================================================================
// RUNTIME STATE
// ============================================================================

/// Per-token submission counters. Never holds raw text or raw identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub identity_token: IdentityToken,
    pub last_submission_at: Option<DateTime<Utc>>,
    pub total_submissions: u64,
    pub flagged_count: u64,
}

impl SubmissionRecord {
    pub fn new(identity_token: IdentityToken) -> Self {
        Self {
            identity_token,
            last_submission_at: None,
            total_submissions: 0,
            flagged_count: 0,
        }
    }
}

/// Guild-wide counters shown by `/beichtbot stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuildStats {
    pub confessions: u64,
    pub replies: u64,
    pub reports: u64,
    pub rejected_banned: u64,
    pub rejected_cooldown: u64,
    #[serde(default)]
    pub rejected_missing_word: u64,
    pub banned_word_flags: u64,
    pub pii_flags: u64,
    pub crisis_flags: u64,
}

/// Links a delivered message to its author token so moderators can act on a
/// post without ever learning who wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostRecord {
    pub identity_token: IdentityToken,
    pub posted_at: DateTime<Utc>,
    /// Channel (or thread) the post lives in
    #[serde(default)]
    pub channel_id: Option<u64>,
    /// Whether `/beichtantwort` may answer this post
    #[serde(default = "replies_allowed_default")]
    pub replies_allowed: bool,
}

fn replies_allowed_default() -> bool {
    true
}

/// Everything persisted for one guild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildState {
    pub config: PolicyConfig,
    #[serde(default)]
    pub records: BTreeMap<IdentityToken, SubmissionRecord>,
    #[serde(default)]
    pub stats: GuildStats,
    #[serde(default)]
    pub posts: BTreeMap<u64, PostRecord>,
}

impl GuildState {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            records: BTreeMap::new(),
            stats: GuildStats::default(),
            posts: BTreeMap::new(),
        }
    }

    pub(crate) fn record_mut(&mut self, token: &IdentityToken) -> &mut SubmissionRecord {
        self.records
            .entry(token.clone())
            .or_insert_with(|| SubmissionRecord::new(token.clone()))
    }
}

/// The full persisted state, written atomically as one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    #[serde(default)]
    pub guilds: BTreeMap<u64, GuildState>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            guilds: BTreeMap::new(),
        }
    }
}

/// Where a public post ended up on the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveredPost {
    pub channel_id: u64,
    pub message_id: u64,
    pub replies_allowed: bool,
}

/// Read-only view for the stats command.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub stats: GuildStats,
    pub tracked_identities: usize,
    pub banned_identities: usize,
    pub flagged_identities: usize,
    pub banned_words: usize,
}

// ============================================================================
// SUBMISSIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionKind {
    Confession,
    Reply,
    Report,
}

impl fmt::Display for SubmissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmissionKind::Confession => write!(f, "confession"),
            SubmissionKind::Reply => write!(f, "reply"),
            SubmissionKind::Report => write!(f, "report"),
        }
    }
}

/// One inbound user action. `author_id` is the raw platform id and is
/// pseudonymized as the first step of processing.
#[derive(Debug, Clone)]
pub struct SubmissionRequest {
    pub guild_id: u64,
    pub author_id: u64,
    pub text: String,
    pub kind: SubmissionKind,
    pub thread_ref: Option<ThreadRef>,
}

/// Structured result of scanning a piece of text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RiskVerdict {
    pub contains_banned_word: bool,
    /// Matched banned words, in configured list order
    pub matched_terms: Vec<String>,
    pub pii_suspected: bool,
    /// Which PII rules fired (rule names, table order)
    pub pii_kinds: Vec<&'static str>,
    pub crisis_suspected: bool,
    /// Which crisis phrases fired (table order)
    pub crisis_terms: Vec<&'static str>,
    /// The guild requires keywords and none of them occurs
    pub missing_required_word: bool,
}

impl RiskVerdict {
    /// Risk flags only; a missing keyword is a rule violation, not a risk.
    pub fn is_flagged(&self) -> bool {
        self.contains_banned_word || self.pii_suspected || self.crisis_suspected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Accepted,
    RejectedBanned,
    RejectedCooldown,
    RejectedMissingWord,
    AcceptedRedirectedToMod,
    AcceptedWithWarning,
}

impl SubmissionOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(
            self,
            SubmissionOutcome::RejectedBanned
                | SubmissionOutcome::RejectedCooldown
                | SubmissionOutcome::RejectedMissingWord
        )
    }
}

impl fmt::Display for SubmissionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmissionOutcome::Accepted => write!(f, "accepted"),
            SubmissionOutcome::RejectedBanned => write!(f, "banned"),
            SubmissionOutcome::RejectedCooldown => write!(f, "cooldown"),
            SubmissionOutcome::RejectedMissingWord => write!(f, "missing_word"),
            SubmissionOutcome::AcceptedRedirectedToMod => write!(f, "redirected"),
            SubmissionOutcome::AcceptedWithWarning => write!(f, "warning"),
        }
    }
}

/// What the adapter should do with a submission.
#[derive(Debug, Clone)]
pub struct SubmissionDecision {
    pub outcome: SubmissionOutcome,
    /// Text safe to post publicly (empty for rejections)
    pub sanitized_text: String,
    /// Guild footer to show outside the post body, already defused
    pub notice_banner: Option<String>,
    pub moderator_notice: Option<String>,
    /// False for rejections, reports and suppressed crisis posts
    pub deliver_publicly: bool,
    /// Remaining cooldown for `RejectedCooldown`
    pub retry_after: Option<Duration>,
    pub thread_ref: Option<ThreadRef>,
    pub(crate) identity_token: IdentityToken,
}

impl SubmissionDecision {
    pub(crate) fn rejected(
        outcome: SubmissionOutcome,
        identity_token: IdentityToken,
        thread_ref: Option<ThreadRef>,
    ) -> Self {
        Self {
            outcome,
            sanitized_text: String::new(),
            notice_banner: None,
            moderator_notice: None,
            deliver_publicly: false,
            retry_after: None,
            thread_ref,
            identity_token,
        }
    }

    /// Token to hand back to `record_delivery` once the post exists.
    pub fn author_token(&self) -> &IdentityToken {
        &self.identity_token
    }
}
