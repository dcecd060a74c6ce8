//! Bot credentials shared by the REST dispatcher and gateway sessions.

use conduit_error::ConfigError;
use derive_getters::Getters;

/// Gateway intent bits.
pub mod intents {
    /// Guild create/update/delete and role/channel changes
    pub const GUILDS: u64 = 1 << 0;
    /// Member join/update/leave (privileged)
    pub const GUILD_MEMBERS: u64 = 1 << 1;
    /// Message events in guilds
    pub const GUILD_MESSAGES: u64 = 1 << 9;
    /// Reaction events in guilds
    pub const GUILD_MESSAGE_REACTIONS: u64 = 1 << 10;
    /// Message events in direct messages
    pub const DIRECT_MESSAGES: u64 = 1 << 12;
    /// Message content in message events (privileged)
    pub const MESSAGE_CONTENT: u64 = 1 << 15;
}

/// Token and intents used to authenticate.
///
/// `Debug` never prints the token.
#[derive(Clone, PartialEq, Eq, Getters)]
pub struct Credentials {
    /// Bot token without the `Bot ` prefix
    token: String,
    /// Gateway intents bitfield
    intents: u64,
}

impl Credentials {
    /// Create credentials from a token and intents bitfield.
    pub fn new(token: impl Into<String>, intents: u64) -> Self {
        Self {
            token: token.into(),
            intents,
        }
    }

    /// Read the token from an environment variable.
    ///
    /// # Errors
    ///
    /// Returns error if the variable is unset or empty.
    pub fn from_env(var: &str, intents: u64) -> Result<Self, ConfigError> {
        match std::env::var(var) {
            Ok(token) if !token.trim().is_empty() => Ok(Self::new(token.trim(), intents)),
            _ => Err(ConfigError::new(format!("{} is not set", var))),
        }
    }

    /// Value for the `Authorization` header.
    pub fn authorization(&self) -> String {
        format!("Bot {}", self.token)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"[redacted]")
            .field("intents", &self.intents)
            .finish()
    }
}
