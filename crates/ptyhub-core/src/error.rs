use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the PTY session layer.
#[derive(Debug, Error)]
pub enum PtyError {
    /// The shell or working directory was invalid, or the OS refused a pty.
    #[error("session creation failed: {0}")]
    CreationFailed(String),

    /// Unknown session, or one that was already closed or reaped.
    #[error("session not found: {0}")]
    NotFound(String),

    /// The operation is not valid for the session's current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// `user` is always the requester, whichever limit was hit.
    #[error("{}", exhausted_message(.user, .limit, .scope))]
    ResourceExhausted {
        user: String,
        limit: usize,
        scope: QuotaScope,
    },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Machine-readable error category, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CreationFailed,
    NotFound,
    Conflict,
    ResourceExhausted,
    InvalidRequest,
    Internal,
}

/// Which session limit a create ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaScope {
    /// The requesting user's own quota.
    User,
    /// The cap across all users.
    Global,
}

fn exhausted_message(user: &str, limit: &usize, scope: &QuotaScope) -> String {
    match scope {
        QuotaScope::User => format!("session limit reached for {user} (max {limit})"),
        QuotaScope::Global => {
            format!("server-wide session limit reached (max {limit}), requested by {user}")
        }
    }
}

impl PtyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PtyError::CreationFailed(_) => ErrorKind::CreationFailed,
            PtyError::NotFound(_) => ErrorKind::NotFound,
            PtyError::Conflict(_) => ErrorKind::Conflict,
            PtyError::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            PtyError::Codec(_) => ErrorKind::InvalidRequest,
            PtyError::Config(_) | PtyError::Io(_) | PtyError::Other(_) => ErrorKind::Internal,
        }
    }
}

impl From<serde_json::Error> for PtyError {
    fn from(e: serde_json::Error) -> Self {
        PtyError::Codec(e.to_string())
    }
}

pub type PtyResult<T> = Result<T, PtyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_taxonomy() {
        assert_eq!(PtyError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            PtyError::ResourceExhausted {
                user: "alice".into(),
                limit: 2,
                scope: QuotaScope::User,
            }
            .kind(),
            ErrorKind::ResourceExhausted
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(PtyError::from(io).kind(), ErrorKind::Internal);
    }

    #[test]
    fn resource_exhausted_message_names_user() {
        let err = PtyError::ResourceExhausted {
            user: "alice".into(),
            limit: 20,
            scope: QuotaScope::User,
        };
        assert_eq!(err.to_string(), "session limit reached for alice (max 20)");
    }

    #[test]
    fn global_cap_message_names_the_cap_not_the_user() {
        let err = PtyError::ResourceExhausted {
            user: "alice".into(),
            limit: 200,
            scope: QuotaScope::Global,
        };
        assert_eq!(
            err.to_string(),
            "server-wide session limit reached (max 200), requested by alice"
        );
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ResourceExhausted).unwrap();
        assert_eq!(json, "\"resource_exhausted\"");
    }
}
