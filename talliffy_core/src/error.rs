use std::error::Error as StdError;

/// Common error type for `talliffy_core`.
///
/// Collaborator implementations (HTTP backend, connector processes) should preserve the
/// underlying error chain where possible via `Error::backend`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The backend rejected our credentials (HTTP 401/403). Never retried.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

impl Error {
    #[tracing::instrument(level = "debug", name = "talliffy.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Convenience: wrap any error into `Backend` with "reqwest" context.
    pub fn backend_reqwest(source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Backend {
            context: "reqwest".into(),
            source: Box::new(source),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    /// Whether retrying the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Backend { .. } | Self::BackendMessage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_and_validation_errors_are_not_transient() {
        assert!(!Error::Unauthorized("401".to_string()).is_transient());
        assert!(!Error::InvalidInput("bad".to_string()).is_transient());
        assert!(!Error::Conflict("busy".to_string()).is_transient());
        assert!(Error::Timeout("connector".to_string()).is_transient());
        assert!(
            Error::backend("spawn", std::io::Error::other("boom")).is_transient()
        );
    }
}
