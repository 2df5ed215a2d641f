//! Error taxonomy shared across the tool pipeline, gateway, and infra clients.
//!
//! Mirrors the Error Kinds enumerated in the system design: tool and
//! provider failures never panic the process, they become one of these
//! variants and are reported to the caller (HTTP response, chat event, or
//! `tool_result { is_error: true }`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JarvisError {
    #[error("safety denied: {reason}")]
    SafetyDenied { reason: String },

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("{what} did not respond within {secs}s")]
    Timeout { what: String, secs: u64 },

    #[error("upstream error from {host}{path}: {detail}")]
    Upstream {
        host: String,
        path: String,
        detail: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl JarvisError {
    pub fn kind(&self) -> &'static str {
        match self {
            JarvisError::SafetyDenied { .. } => "SafetyDenied",
            JarvisError::Unauthenticated => "Unauthenticated",
            JarvisError::Unauthorized(_) => "Unauthorized",
            JarvisError::Timeout { .. } => "Timeout",
            JarvisError::Upstream { .. } => "Upstream",
            JarvisError::NotFound(_) => "NotFound",
            JarvisError::InvalidArgument(_) => "InvalidArgument",
            JarvisError::Conflict(_) => "Conflict",
            JarvisError::Internal(_) => "Internal",
        }
    }

    /// HTTP status code for this error kind, used by the gateway's error mapping.
    pub fn status_code(&self) -> u16 {
        match self {
            JarvisError::SafetyDenied { .. } => 403,
            JarvisError::Unauthenticated => 401,
            JarvisError::Unauthorized(_) => 403,
            JarvisError::Timeout { .. } => 504,
            JarvisError::Upstream { .. } => 502,
            JarvisError::NotFound(_) => 404,
            JarvisError::InvalidArgument(_) => 400,
            JarvisError::Conflict(_) => 409,
            JarvisError::Internal(_) => 500,
        }
    }
}

pub type JarvisResult<T> = Result<T, JarvisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_matches_user_visible_format() {
        let e = JarvisError::Timeout {
            what: "stop_vm".into(),
            secs: 30,
        };
        assert_eq!(e.to_string(), "stop_vm did not respond within 30s");
    }

    #[test]
    fn conflict_maps_to_409() {
        let e = JarvisError::Conflict("confirmation required".into());
        assert_eq!(e.status_code(), 409);
    }

    #[test]
    fn safety_denied_maps_to_403() {
        let e = JarvisError::SafetyDenied {
            reason: "protected vmid".into(),
        };
        assert_eq!(e.status_code(), 403);
        assert_eq!(e.kind(), "SafetyDenied");
    }
}
