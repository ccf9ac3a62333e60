//! Shared helpers for provider adapters.

use weft_domain::Error;

/// Convert a [`reqwest::Error`] into the domain error, attributing it to
/// the given provider.
pub(crate) fn from_reqwest(provider: &str, e: reqwest::Error) -> Error {
    Error::ProviderConnection {
        provider: provider.to_owned(),
        message: if e.is_timeout() {
            format!("request timed out: {e}")
        } else {
            e.to_string()
        },
    }
}

/// Map a non-success HTTP status to the domain error: 401 is an
/// authentication failure, anything else a connection error with status.
pub(crate) fn from_status(provider: &str, status: reqwest::StatusCode, body: &str) -> Error {
    if status == reqwest::StatusCode::UNAUTHORIZED {
        Error::ProviderAuth {
            provider: provider.to_owned(),
        }
    } else {
        Error::ProviderConnection {
            provider: provider.to_owned(),
            message: format!("HTTP {} - {}", status.as_u16(), truncate(body, 300)),
        }
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
