//! Error taxonomy of the completion engine.
//!
//! Compile and build errors are resolved before any network call. Transport
//! errors end the current session. Cancellation is never an error.

use thiserror::Error;

/// A provider description could not be compiled into a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("malformed provider description: {0}")]
    Malformed(String),

    #[error("unknown placeholder `{{{{{name}}}}}`")]
    UnknownPlaceholder { name: String },
}

/// A compiled descriptor could not be bound to runtime values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("no value bound for placeholder `{{{{{placeholder}}}}}`")]
    MissingBinding { placeholder: String },

    #[error("invalid payload for `{{{{{placeholder}}}}}`: {reason}")]
    InvalidPayload { placeholder: String, reason: String },
}

impl BuildError {
    pub fn user_message(&self) -> String {
        match self {
            BuildError::MissingBinding { placeholder } => {
                format!("Provider misconfigured: no value for {{{{{placeholder}}}}}")
            }
            BuildError::InvalidPayload { placeholder, .. } => {
                format!("Provider misconfigured: invalid data for {{{{{placeholder}}}}}")
            }
        }
    }
}

/// Failure while executing a request or decoding its response.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode response: {message} (raw: {raw})")]
    Decode { message: String, raw: String },

    #[error("provider error: {0}")]
    Provider(String),
}

impl TransportError {
    pub fn user_message(&self) -> String {
        match self {
            TransportError::Request(msg) => format!("Could not reach the provider: {msg}"),
            TransportError::Status { status, body } => {
                format!("Provider returned HTTP {status}: {}", truncate(body, 200))
            }
            TransportError::Decode { message, .. } => {
                format!("Could not read the provider response: {message}")
            }
            TransportError::Provider(msg) => format!("Provider error: {}", truncate(msg, 200)),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        TransportError::Request(e.to_string())
    }
}

/// Failure reported by a conversation store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid stored data: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Why a submission was refused before any session started.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("nothing to send")]
    EmptyInput,

    #[error(transparent)]
    Build(#[from] BuildError),
}

/// Cut `s` to at most `max` characters on a char boundary.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
