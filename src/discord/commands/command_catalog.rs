// Discord commands module.
// Each feature gets its own command file.

pub mod confessions;

// Moderator configuration (/beichtbot ...)
pub mod admin;

use crate::discord::{Data, Error};

/// Every slash command the bot registers.
pub fn all() -> Vec<poise::Command<Data, Error>> {
    vec![
        confessions::beichten(),
        confessions::beichtantwort(),
        confessions::melden(),
        confessions::hilfe(),
        admin::beichtbot(),
    ]
}
