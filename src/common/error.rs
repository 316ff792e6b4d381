use thiserror::Error;

/// Error taxonomy shared by the server handlers and the client core.
///
/// Validation and authorization failures are terminal and surfaced to the
/// caller; transient failures during background polling are swallowed and
/// retried on the next tick.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Bad input: empty message content, self-conversation attempt, etc.
    #[error("{0}")]
    Validation(String),

    /// Unknown conversation or user.
    #[error("{0}")]
    NotFound(String),

    /// Caller is not a participant of the conversation.
    #[error("{0}")]
    Unauthorized(String),

    /// Network or database unavailability; retryable.
    #[error("{0}")]
    Transient(String),
}

impl ChatError {
    /// Stable wire code, used as `ERR: <code>: <detail>` on the line protocol.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "Validation",
            ChatError::NotFound(_) => "NotFound",
            ChatError::Unauthorized(_) => "Unauthorized",
            ChatError::Transient(_) => "Transient",
        }
    }

    /// Rebuild an error from its wire code. Unknown codes are treated as
    /// transient so an older client never hard-fails on a newer server.
    pub fn from_wire(code: &str, detail: &str) -> Self {
        match code {
            "Validation" => ChatError::Validation(detail.to_string()),
            "NotFound" => ChatError::NotFound(detail.to_string()),
            "Unauthorized" => ChatError::Unauthorized(detail.to_string()),
            _ => ChatError::Transient(detail.to_string()),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ChatError::Transient(_))
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        ChatError::Transient(format!("database error: {}", err))
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_round_trip() {
        let errs = [
            ChatError::Validation("empty content".into()),
            ChatError::NotFound("no such conversation".into()),
            ChatError::Unauthorized("not a participant".into()),
            ChatError::Transient("connection reset".into()),
        ];
        for e in errs {
            let rebuilt = ChatError::from_wire(e.code(), &e.to_string());
            assert_eq!(rebuilt, e);
        }
    }

    #[test]
    fn unknown_code_maps_to_transient() {
        let e = ChatError::from_wire("Teapot", "short and stout");
        assert!(e.is_transient());
    }
}
