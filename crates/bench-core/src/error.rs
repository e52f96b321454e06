use thiserror::Error;

/// Errors raised while talking to the queue service.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The service rejected a create request with 400 Bad Request.
    #[error("failed to create {resource} '{name}' (status {status})")]
    CreateFailed {
        resource: &'static str,
        name: String,
        status: u16,
    },

    #[error("unexpected status {status} for {method} {url}")]
    UnexpectedStatus {
        method: &'static str,
        url: String,
        status: u16,
    },

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
