// Anonymous confessions: pseudonymous identities, guild policy, risk scanning
// and the moderation state machine that ties them together.

pub mod confession_models;
pub mod cooldown_gate;
pub mod identity_locks;
pub mod moderation_core;
pub mod policy_store;
pub mod pseudonymizer;
pub mod risk_scanner;

pub use confession_models::*;
pub use moderation_core::{neutralize_mentions, ModerationCore};
pub use policy_store::{PolicyError, PolicyStore, SnapshotBackend};
pub use pseudonymizer::{ConfigurationError, Pseudonymizer};
