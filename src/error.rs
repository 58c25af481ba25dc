//! Error type for every Nimbus service call
//!
//! The engine surfaces exactly one error type. Transport failures and
//! service-reported failures are told apart only by [`ClientError::status`]:
//! `0` means no HTTP status was ever obtained.

use std::path::PathBuf;

use serde_json::Value;
use thiserror::Error;

/// Result type alias for Nimbus client operations
pub type Result<T> = std::result::Result<T, ClientError>;

const UNKNOWN_ERROR: &str = "Unknown client error";

/// Error raised by the HTTP engine and every service wrapper built on it
///
/// When the message carries a service error body of the form
/// `{"<key>": {"code": <int>, "message": <str>, "details": <str|null>}}`,
/// the constructor rewrites message, status and details from it. Anything
/// that does not parse is kept verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ClientError {
    message: String,
    status: u16,
    details: Vec<String>,
}

impl ClientError {
    /// Transport-level error (status `0`)
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_details(message, 0, Vec::new())
    }

    /// Error carrying a service-reported HTTP status
    pub fn with_status(message: impl Into<String>, status: u16) -> Self {
        Self::with_details(message, status, Vec::new())
    }

    /// Error with status and supplementary detail lines
    pub fn with_details(message: impl Into<String>, status: u16, details: Vec<String>) -> Self {
        let message = message.into();
        tracing::debug!(
            target: "nimbus::client",
            message = %message.trim_end(),
            status,
            ?details,
            "ClientError"
        );

        let (message, status, details) = match enrich(&message, status, &details) {
            Some(enriched) => enriched,
            None => (message, status, details),
        };

        Self {
            message: normalize(message),
            status,
            details,
        }
    }

    /// Human-readable message, never empty
    pub fn message(&self) -> &str {
        &self.message
    }

    /// HTTP status reported by the service, or `0` for transport failures
    pub const fn status(&self) -> u16 {
        self.status
    }

    /// Supplementary detail lines, in the order they were collected
    pub fn details(&self) -> &[String] {
        &self.details
    }

    /// Whether the failure happened before any HTTP status was obtained
    pub const fn is_transport(&self) -> bool {
        self.status == 0
    }

    /// Get the exit code for this error
    pub const fn exit_code(&self) -> i32 {
        match self.status {
            0 => 4,
            401 | 403 => 3,
            400..=499 => 5,
            500..=599 => 6,
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("JSON error: {err}"))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::new(format!("HTTP error: {err}"))
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::new(format!("I/O error: {err}"))
    }
}

/// Errors from loading, validating or saving the config file
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Configuration not found at {0}. Run 'nimbus config set-url' and 'nimbus config set-token' first")]
    NoConfig(PathBuf),

    /// Failed to read configuration file
    #[error("Failed to read config from {path}: {reason}")]
    ConfigRead { path: PathBuf, reason: String },

    /// Failed to write configuration file
    #[error("Failed to write config to {path}: {reason}")]
    ConfigWrite { path: PathBuf, reason: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Could not locate the config directory
    #[error("Could not determine config directory: XDG_CONFIG_HOME not set and no home directory found")]
    NoConfigDir,
}

/// Pull a structured service error out of `message`, if one is embedded in it
///
/// Returns `None` whenever the body is absent or does not have the expected shape.
fn enrich(message: &str, status: u16, details: &[String]) -> Option<(String, u16, Vec<String>)> {
    let start = message.find('{')?;
    let (prefix, body) = message.split_at(start);
    let body = body.trim_end();

    let parsed: Value = serde_json::from_str(body).ok()?;
    let (key, fault) = parsed.as_object()?.iter().next()?;
    let fault = fault.as_object()?;

    let head = [prefix.trim(), key.as_str()]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ");
    let message = match fault.get("message") {
        Some(text) => format!("{head} ({})", as_text(text)),
        None => head,
    };

    // A present but non-integral code wipes the status rather than keeping a stale one
    let status = fault.get("code").map_or(status, |code| {
        code.as_u64()
            .and_then(|code| u16::try_from(code).ok())
            .unwrap_or(0)
    });

    let mut details = details.to_vec();
    if let Some(extra) = fault.get("details") {
        if !is_blank(extra) {
            details.push(as_text(extra));
        }
    }

    Some((message, status, details))
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        _ => false,
    }
}

/// Collapse trailing newlines to at most one and never return an empty message
fn normalize(mut message: String) -> String {
    while message.ends_with("\n\n") {
        let _ = message.pop();
    }
    if message.trim().is_empty() {
        return UNKNOWN_ERROR.to_string();
    }
    message
}
