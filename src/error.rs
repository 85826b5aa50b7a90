use thiserror::Error;

/// Errors surfaced across the coordination crate's public API.
///
/// Every variant has a stable `kind()` string so callers that need to match on
/// error category (rather than just display a message) don't have to parse text.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("failed to persist session {session_id}: {message}")]
    SessionPersistFailed { session_id: String, message: String },

    #[error("unknown agent: {agent_id}")]
    AgentUnknown { agent_id: String },

    #[error("illegal transition for agent {agent_id}: {from} -> {to}")]
    AgentIllegalTransition {
        agent_id: String,
        from: String,
        to: String,
    },

    #[error("unknown permission request: {request_id}")]
    PermissionUnknownRequest { request_id: String },

    #[error("could not determine a single agent for request {request_id}")]
    PermissionAmbiguousAgent { request_id: String },

    #[error("mailbox transport error: {0}")]
    MailboxTransport(String),

    #[error("mailbox auth error: {0}")]
    MailboxAuth(String),

    #[error("unknown message type: {type_name}")]
    CodecUnknownType { type_name: String },

    #[error("malformed message envelope: {0}")]
    CodecMalformed(String),
}

impl CoordinationError {
    /// Stable, machine-matchable category string, e.g. `"agent/unknown"`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionNotFound { .. } => "session/not-found",
            Self::SessionPersistFailed { .. } => "session/persist-failed",
            Self::AgentUnknown { .. } => "agent/unknown",
            Self::AgentIllegalTransition { .. } => "agent/illegal-transition",
            Self::PermissionUnknownRequest { .. } => "permission/unknown-request",
            Self::PermissionAmbiguousAgent { .. } => "permission/ambiguous-agent",
            Self::MailboxTransport(_) => "mailbox/transport",
            Self::MailboxAuth(_) => "mailbox/auth",
            Self::CodecUnknownType { .. } => "codec/unknown-type",
            Self::CodecMalformed(_) => "codec/malformed",
        }
    }
}

impl From<crate::mailbox::MailboxError> for CoordinationError {
    fn from(err: crate::mailbox::MailboxError) -> Self {
        match err {
            crate::mailbox::MailboxError::Transport(msg) => Self::MailboxTransport(msg),
            crate::mailbox::MailboxError::Auth(msg) => Self::MailboxAuth(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoordinationError>;
