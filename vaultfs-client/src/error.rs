//! Error types for the Vault HTTP client.

use vaultfs_core::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum VaultApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Vault returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("cannot read token file {path}: {source}")]
    TokenFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid Vault address {0}")]
    InvalidAddress(String),

    #[error("cannot read CA certificate {path}: {source}")]
    CaCert {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid CA certificate {path}: {message}")]
    InvalidCaCert { path: String, message: String },
}

impl From<VaultApiError> for StoreError {
    fn from(err: VaultApiError) -> Self {
        match err {
            VaultApiError::NotFound(path) => Self::NotFound(path),
            VaultApiError::Api { status, message } => Self::Api { status, message },
            VaultApiError::Malformed(msg) => Self::Malformed(msg),
            VaultApiError::Http(e) => Self::Unavailable(e.to_string()),
            other => Self::Other(anyhow::anyhow!("{other}")),
        }
    }
}

/// Join the `errors` array of a Vault error body into one message.
///
/// Falls back to the raw body when it is not the usual JSON shape.
pub(crate) fn error_message(body: &str) -> String {
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        errors: Vec<String>,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) if !parsed.errors.is_empty() => parsed.errors.join("; "),
        _ if body.trim().is_empty() => "no response body".to_string(),
        _ => body.trim().to_string(),
    }
}
