//! What to do after the server closes the connection.

/// Close code the client sends on a caller-requested disconnect.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code the client sends when it intends to resume.
pub const RESUME_CLOSURE: u16 = 4000;

/// Recovery path for a close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum CloseAction {
    /// Reconnect and resume the session
    Resume,
    /// Reconnect with a fresh identify
    Reidentify,
    /// Do not reconnect
    Fatal,
}

/// Classify a server close code.
pub fn classify(code: u16) -> CloseAction {
    match code {
        4004 | 4010 | 4011 | 4012 | 4013 | 4014 => CloseAction::Fatal,
        1000 | 1001 | 4007 | 4009 => CloseAction::Reidentify,
        _ => CloseAction::Resume,
    }
}

/// Human-readable meaning of a gateway close code.
pub fn describe(code: u16) -> &'static str {
    match code {
        1000 => "normal closure",
        1001 => "going away",
        4000 => "unknown error",
        4001 => "unknown opcode",
        4002 => "decode error",
        4003 => "not authenticated",
        4004 => "authentication failed",
        4005 => "already authenticated",
        4007 => "invalid seq",
        4008 => "rate limited",
        4009 => "session timed out",
        4010 => "invalid shard",
        4011 => "sharding required",
        4012 => "invalid API version",
        4013 => "invalid intents",
        4014 => "disallowed intents",
        _ => "unrecognized close code",
    }
}
