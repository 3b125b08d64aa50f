use thiserror::Error;

use super::state::UserId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable not found - please add this to your .env file")]
    Missing(&'static str),
    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("model request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("model returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model response had no content")]
    EmptyResponse,
    #[error("ollama request failed: {0}")]
    Ollama(String),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("{provider} request failed: {source}")]
    Request {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider} API error ({status}): {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("{provider} returned a malformed response: {reason}")]
    Malformed {
        provider: &'static str,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("email request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("email provider rejected the message (code {code}): {message}")]
    Rejected { code: i64, message: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no session stored for user {0}")]
    NotFound(UserId),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid chat id {0:?}")]
    InvalidChat(String),
    #[error("failed to send message: {0}")]
    SendFailed(String),
}
