//! Authentication and authorization error types.
//!
//! [`AuthError`] is the gateway-facing taxonomy; [`AuthorityError`] describes
//! failures of the Identity Authority collaborator and is mapped into the
//! taxonomy by the decision pipeline.

/// Errors produced while deciding whether a request may proceed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The request lacks valid authentication credentials.
    #[error("Unauthorized: {message}")]
    Unauthorized {
        /// Description of why the request is unauthorized.
        message: String,
    },

    /// The bearer token is malformed or was rejected by the authority.
    #[error("Invalid token: {message}")]
    InvalidToken {
        /// Description of why the token is invalid.
        message: String,
    },

    /// The identity behind the token has expired.
    #[error("Token expired")]
    TokenExpired,

    /// The caller is authenticated but not allowed to perform the action.
    #[error("Forbidden: {message}")]
    Forbidden {
        /// Description of why access is forbidden.
        message: String,
    },

    /// The Identity Authority did not answer in time, or failed.
    ///
    /// The gateway fails closed on this error.
    #[error("Upstream timeout: {message}")]
    UpstreamTimeout {
        /// Description of the upstream failure.
        message: String,
    },

    /// A permission filter removal would have underflowed a counter.
    ///
    /// Logged and used to schedule a rebuild; never returned to callers.
    #[error("Filter inconsistency: {message}")]
    FilterInconsistency {
        /// Which key could not be removed.
        message: String,
    },

    /// The gateway configuration is invalid.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration error.
        message: String,
    },

    /// An unexpected internal error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl AuthError {
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_token(message: impl Into<String>) -> Self {
        Self::InvalidToken {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn upstream_timeout(message: impl Into<String>) -> Self {
        Self::UpstreamTimeout {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn filter_inconsistency(message: impl Into<String>) -> Self {
        Self::FilterInconsistency {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// `true` for failures that map to HTTP 401.
    pub fn is_authentication_error(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized { .. } | Self::InvalidToken { .. } | Self::TokenExpired
        )
    }

    /// `true` for failures that map to HTTP 403.
    pub fn is_authorization_error(&self) -> bool {
        matches!(self, Self::Forbidden { .. } | Self::UpstreamTimeout { .. })
    }

    /// Short machine-readable code for responses and metric labels.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "unauthorized",
            Self::InvalidToken { .. } => "invalid_token",
            Self::TokenExpired => "token_expired",
            Self::Forbidden { .. } => "access_denied",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::FilterInconsistency { .. } => "filter_inconsistency",
            Self::Configuration { .. } => "configuration_error",
            Self::Internal { .. } => "server_error",
        }
    }
}

/// Failures reported by an Identity Authority implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorityError {
    /// The token was rejected (bad signature, malformed, unknown subject).
    #[error("token rejected: {0}")]
    InvalidToken(String),

    /// The authority could not be reached or returned a server error.
    #[error("authority unavailable: {0}")]
    Unavailable(String),

    /// The authority did not answer within its deadline.
    #[error("authority timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The authority answered with something that could not be understood.
    #[error("unexpected authority response: {0}")]
    Protocol(String),
}

impl From<AuthorityError> for AuthError {
    fn from(err: AuthorityError) -> Self {
        match err {
            AuthorityError::InvalidToken(message) => AuthError::invalid_token(message),
            other => AuthError::upstream_timeout(other.to_string()),
        }
    }
}

/// Result type alias for gateway decisions.
pub type AuthResult<T> = Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_classification() {
        assert!(AuthError::TokenExpired.is_authentication_error());
        assert!(AuthError::invalid_token("bad").is_authentication_error());
        assert!(AuthError::forbidden("no").is_authorization_error());
        assert!(AuthError::upstream_timeout("slow").is_authorization_error());
        assert!(!AuthError::internal("boom").is_authorization_error());
    }

    #[test]
    fn test_authority_error_mapping() {
        let err: AuthError = AuthorityError::InvalidToken("bad signature".into()).into();
        assert_eq!(err, AuthError::invalid_token("bad signature"));

        let err: AuthError = AuthorityError::Timeout(Duration::from_millis(25)).into();
        assert_eq!(err.error_code(), "upstream_timeout");

        let err: AuthError = AuthorityError::Unavailable("connection refused".into()).into();
        assert!(err.is_authorization_error());
    }
}
