// Keyed one-way pseudonymization of platform user ids.
//
// There is intentionally no way back from a token to a user id anywhere in
// the codebase. Tokens are compared, stored and banned; never decoded.

use super::confession_models::IdentityToken;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Environment variable the secret is read from.
pub const SECRET_ENV_VAR: &str = "CONFESSION_HASH_SECRET";

/// Fatal startup problems. The bot refuses to run rather than hash with a
/// missing or empty key.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Missing required setting: {0}")]
    Missing(String),

    #[error("Invalid setting {name}: {reason}")]
    Invalid { name: String, reason: String },
}

pub struct Pseudonymizer {
    /// Keyed MAC state, cloned per token
    mac: HmacSha256,
}

impl Pseudonymizer {
    /// Build a pseudonymizer from the configured secret (see `Settings`).
    pub fn new(secret: &str) -> Result<Self, ConfigurationError> {
        let trimmed = secret.trim();
        if trimmed.is_empty() {
            return Err(ConfigurationError::Invalid {
                name: SECRET_ENV_VAR.to_string(),
                reason: "secret must not be empty".to_string(),
            });
        }
        let mac = HmacSha256::new_from_slice(trimmed.as_bytes()).map_err(|e| {
            ConfigurationError::Invalid {
                name: SECRET_ENV_VAR.to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self { mac })
    }

    /// Deterministic token for a raw platform identity.
    pub fn token_for(&self, raw_identity: u64) -> IdentityToken {
        let mut mac = self.mac.clone();
        mac.update(b"confession-identity:");
        mac.update(raw_identity.to_string().as_bytes());
        IdentityToken::from_hex(hex::encode(mac.finalize().into_bytes()))
    }
}

impl fmt::Debug for Pseudonymizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pseudonymizer")
            .field("secret", &"<redacted>")
            .finish()
    }
}
