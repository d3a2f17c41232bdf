// Process settings, read once at startup from the environment (.env is
// loaded by main before this runs).

use crate::core::confessions::pseudonymizer::SECRET_ENV_VAR;
use crate::core::confessions::ConfigurationError;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const TOKEN_ENV_VAR: &str = "DISCORD_TOKEN";
pub const DATA_DIR_ENV_VAR: &str = "CONFESSION_DATA_DIR";
pub const PERSIST_TIMEOUT_ENV_VAR: &str = "CONFESSION_PERSIST_TIMEOUT_SECS";

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_PERSIST_TIMEOUT_SECS: u64 = 5;
const STATE_FILE_NAME: &str = "confessions_state.json";

#[derive(Clone)]
pub struct Settings {
    pub discord_token: String,
    pub hash_secret: String,
    pub data_dir: PathBuf,
    pub persist_timeout: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from any name -> value lookup.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigurationError> {
        let required = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ConfigurationError::Missing(name.to_string()))
        };

        let discord_token = required(TOKEN_ENV_VAR)?;
        let hash_secret = required(SECRET_ENV_VAR)?;

        let data_dir = lookup(DATA_DIR_ENV_VAR)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

        let persist_timeout = match lookup(PERSIST_TIMEOUT_ENV_VAR) {
            None => Duration::from_secs(DEFAULT_PERSIST_TIMEOUT_SECS),
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    return Err(ConfigurationError::Invalid {
                        name: PERSIST_TIMEOUT_ENV_VAR.to_string(),
                        reason: format!("expected a positive number of seconds, got {:?}", raw),
                    })
                }
            },
        };

        Ok(Self {
            discord_token,
            hash_secret,
            data_dir,
            persist_timeout,
        })
    }

    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join(STATE_FILE_NAME)
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("discord_token", &"<redacted>")
            .field("hash_secret", &"<redacted>")
            .field("data_dir", &self.data_dir)
            .field("persist_timeout", &self.persist_timeout)
            .finish()
    }
}
