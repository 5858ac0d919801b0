use std::collections::HashMap;
use thiserror::Error;

/// Broad classification of a [`CoreError`]. Used both for retry/reconnect decisions and for
/// the `{kind, message, context}` shape surfaced to callers.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Ord, PartialOrd)]
pub enum ErrorKind {
    /// Validation failure at initialize time. Fatal to the owning component.
    Config,
    /// Transport establish/drop.
    Connection,
    /// Ping/pong contract broken.
    Heartbeat,
    /// Clean close or protocol-level peer rejection.
    Protocol,
    /// Decoding or parse failure.
    Data,
    /// Authentication failure.
    Auth,
    /// Subscription validation or capacity rejection.
    Subscription,
    /// Stage-level pipeline failure.
    Pipeline,
    /// Downstream publishing sink failure.
    Publish,
}

impl ErrorKind {
    /// Whether [`crate::reconnect::ReconnectStrategy`] should schedule a reconnect attempt for
    /// an error of this kind: CONNECTION/HEARTBEAT/NETWORK reconnect, everything
    /// else (DATA, PROTOCOL clean close, AUTH, CONFIG) does not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Connection | ErrorKind::Heartbeat)
    }

    fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "CONFIG",
            ErrorKind::Connection => "CONNECTION",
            ErrorKind::Heartbeat => "HEARTBEAT",
            ErrorKind::Protocol => "PROTOCOL",
            ErrorKind::Data => "DATA",
            ErrorKind::Auth => "AUTH",
            ErrorKind::Subscription => "SUBSCRIPTION",
            ErrorKind::Pipeline => "PIPELINE",
            ErrorKind::Publish => "PUBLISH",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured error carrying the `{kind, message, context}` triple required by for
/// both public operation return values and the component events that mirror them.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    pub context: HashMap<String, String>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: HashMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn heartbeat(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Heartbeat, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Data, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn subscription(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Subscription, message)
    }

    pub fn pipeline(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Pipeline, message)
    }

    pub fn publish(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Publish, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CoreError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        CoreError::connection(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::data(err.to_string())
    }
}

impl From<regex::Error> for CoreError {
    fn from(err: regex::Error) -> Self {
        CoreError::config(format!("invalid regex: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_match_spec_table() {
        assert!(ErrorKind::Connection.is_retryable());
        assert!(ErrorKind::Heartbeat.is_retryable());
        assert!(!ErrorKind::Data.is_retryable());
        assert!(!ErrorKind::Protocol.is_retryable());
        assert!(!ErrorKind::Auth.is_retryable());
        assert!(!ErrorKind::Config.is_retryable());
    }

    #[test]
    fn display_uses_shouting_kind_names() {
        let err = CoreError::subscription("too many").with_context("cap", "1000");
        assert_eq!(err.to_string(), "SUBSCRIPTION: too many");
        assert_eq!(err.context.get("cap").map(String::as_str), Some("1000"));
    }
}
