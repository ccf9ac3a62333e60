/// Shared error type used across all Weft crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("provider {provider}: {message}")]
    ProviderConnection { provider: String, message: String },

    #[error("provider {provider}: authentication failed")]
    ProviderAuth { provider: String },

    #[error("session {session_id} was cancelled")]
    Cancelled { session_id: String },

    #[error("session: {0}")]
    Session(String),

    #[error("script: {0}")]
    Script(String),

    #[error("store: {0}")]
    Store(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when this error is a cancellation signal rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_distinguishable() {
        let err = Error::Cancelled {
            session_id: "abc".into(),
        };
        assert!(err.is_cancelled());
        assert!(!Error::Other("x".into()).is_cancelled());
    }

    #[test]
    fn display_includes_provider() {
        let err = Error::ProviderConnection {
            provider: "ollama".into(),
            message: "connection refused".into(),
        };
        assert_eq!(err.to_string(), "provider ollama: connection refused");
    }
}
