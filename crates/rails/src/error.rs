use thiserror::Error;

/// Failure of a single rail attempt.
///
/// Fatal to that wallet's attempt only: the engine logs the detail and falls
/// through to the next wallet in priority order.
#[derive(Debug, Error)]
pub enum RailError {
    /// The wallet row is missing required connection/credential material.
    #[error("wallet misconfigured: {0}")]
    Misconfigured(String),
    /// Could not reach or authenticate against the backend.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The backend, or the execution path behind it, rejected the attempt.
    #[error("{0}")]
    Rejected(String),
}

impl RailError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Misconfigured(_) => "misconfigured",
            Self::Transport(_) => "transport",
            Self::Rejected(_) => "rejected",
        }
    }

    /// Uniform human detail for wallet log entries, independent of which rail
    /// failed and of the shape of its native error.
    pub fn detail(&self) -> String {
        match self {
            Self::Misconfigured(message) | Self::Transport(message) | Self::Rejected(message) => {
                message.clone()
            }
        }
    }
}

/// Credential fields are nullable on the wallet row; an absent or blank one
/// fails the attempt before any network traffic.
pub(crate) fn required<'a>(value: Option<&'a str>, missing: &str) -> Result<&'a str, RailError> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| RailError::Misconfigured(missing.to_string()))
}
