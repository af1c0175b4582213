use std::fmt;
use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Keychain(#[from] keyring::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
}

/// Status reported by a remote provider, normalized across the Places and
/// Michelin backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Http(u16),
    Network,
    Timeout,
    RequestDenied,
    OverQueryLimit,
    InvalidRequest,
    NotFound,
    UnrecognizedShape,
    Unknown(String),
}

impl ProviderStatus {
    pub fn from_http(code: u16) -> Self {
        match code {
            401 | 403 => ProviderStatus::RequestDenied,
            404 => ProviderStatus::NotFound,
            429 => ProviderStatus::OverQueryLimit,
            400 => ProviderStatus::InvalidRequest,
            other => ProviderStatus::Http(other),
        }
    }

    /// Transient 5xx, network, timeout and rate-limit failures are retried.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderStatus::Http(code) => *code >= 500,
            ProviderStatus::Network
            | ProviderStatus::Timeout
            | ProviderStatus::OverQueryLimit => true,
            ProviderStatus::Unknown(tag) => tag == "UNKNOWN_ERROR",
            _ => false,
        }
    }

    pub fn suggestion(&self) -> &'static str {
        match self {
            ProviderStatus::RequestDenied => "check the API key and that the API is enabled",
            ProviderStatus::OverQueryLimit => "rate limited; wait a moment and retry",
            ProviderStatus::InvalidRequest => "check the search radius and location",
            ProviderStatus::NotFound => "check the API base URL",
            ProviderStatus::Timeout => "the provider is slow to respond; retry shortly",
            ProviderStatus::Network => "check the network connection",
            ProviderStatus::UnrecognizedShape => "the provider returned an unexpected response",
            ProviderStatus::Http(code) if *code >= 500 => "the provider is having trouble; retry later",
            ProviderStatus::Http(_) | ProviderStatus::Unknown(_) => "retry the search",
        }
    }
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderStatus::Http(code) => write!(f, "HTTP {code}"),
            ProviderStatus::Network => f.write_str("NETWORK_ERROR"),
            ProviderStatus::Timeout => f.write_str("TIMEOUT"),
            ProviderStatus::RequestDenied => f.write_str("REQUEST_DENIED"),
            ProviderStatus::OverQueryLimit => f.write_str("OVER_QUERY_LIMIT"),
            ProviderStatus::InvalidRequest => f.write_str("INVALID_REQUEST"),
            ProviderStatus::NotFound => f.write_str("NOT_FOUND"),
            ProviderStatus::UnrecognizedShape => f.write_str("UNRECOGNIZED_SHAPE"),
            ProviderStatus::Unknown(tag) => f.write_str(tag),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{provider} request failed ({status}): {message}")]
pub struct SearchError {
    pub provider: &'static str,
    pub status: ProviderStatus,
    pub message: String,
    pub retryable: bool,
    pub attempts: u32,
}

impl SearchError {
    pub fn new(provider: &'static str, status: ProviderStatus, message: impl Into<String>) -> Self {
        let retryable = status.is_transient();
        Self {
            provider,
            status,
            message: message.into(),
            retryable,
            attempts: 1,
        }
    }

    pub fn from_reqwest(provider: &'static str, err: reqwest::Error) -> Self {
        let status = if err.is_timeout() {
            ProviderStatus::Timeout
        } else if err.is_decode() {
            ProviderStatus::UnrecognizedShape
        } else if let Some(code) = err.status() {
            ProviderStatus::from_http(code.as_u16())
        } else {
            ProviderStatus::Network
        };
        Self::new(provider, status, err.to_string())
    }

    pub fn suggestion(&self) -> &'static str {
        self.status.suggestion()
    }
}

/// Soft failure of the optional text-extraction step. Logged, never returned
/// to import callers.
#[derive(Debug, Error)]
#[error("concept extraction degraded: {reason}")]
pub struct ExtractionDegraded {
    pub reason: String,
}

impl ExtractionDegraded {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
