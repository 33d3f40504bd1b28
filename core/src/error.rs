//! Typed failures surfaced by the transport and the typed API layer.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

pub mod codes {
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const CONFLICT: &str = "CONFLICT";
    pub const PAYLOAD_TOO_LARGE: &str = "PAYLOAD_TOO_LARGE";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    pub const UNKNOWN: &str = "UNKNOWN";
}

/// Failure reported by the remote service or by the transport itself.
///
/// `http_status` is `0` when no response was received (timeouts and
/// connection failures).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code} (HTTP {http_status}): {message}")]
pub struct ApiError {
    pub code: String,
    pub http_status: u16,
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, http_status: u16, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            http_status,
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            codes::TIMEOUT,
            0,
            format!("request timed out after {}ms", after.as_millis()),
        )
    }

    pub fn network(detail: impl fmt::Display) -> Self {
        Self::new(codes::NETWORK_ERROR, 0, detail.to_string())
    }

    pub fn conflict(&self) -> bool {
        self.code == codes::CONFLICT
    }

    pub fn unauthorized(&self) -> bool {
        self.code == codes::UNAUTHORIZED
    }

    pub fn forbidden(&self) -> bool {
        self.code == codes::FORBIDDEN
    }

    pub fn payload_too_large(&self) -> bool {
        self.code == codes::PAYLOAD_TOO_LARGE
    }

    pub fn not_found(&self) -> bool {
        self.code == codes::NOT_FOUND || self.code.ends_with("_NOT_FOUND")
    }

    pub fn is_timeout(&self) -> bool {
        self.code == codes::TIMEOUT
    }

    pub fn is_server_error(&self) -> bool {
        self.http_status >= 500
    }

    /// Failures worth repeating for an idempotent read.
    pub fn is_retriable(&self) -> bool {
        self.is_server_error() || self.is_timeout() || self.code == codes::NETWORK_ERROR
    }

    pub fn user_message(&self) -> UserMessage {
        let (title, description) = match self.code.as_str() {
            codes::UNAUTHORIZED => ("Not signed in", "Please sign in again.".to_string()),
            codes::FORBIDDEN => (
                "Permission denied",
                "Your account may not perform this action.".to_string(),
            ),
            codes::CONFLICT => (
                "Conflict",
                "The resource changed; refresh and try again.".to_string(),
            ),
            codes::PAYLOAD_TOO_LARGE => (
                "Content too large",
                "The request body or source code exceeds the limit.".to_string(),
            ),
            codes::TIMEOUT | codes::NETWORK_ERROR => (
                "Service unreachable",
                "Check your connection and try again.".to_string(),
            ),
            _ if self.not_found() => (
                "Not found",
                "The resource may have been deleted.".to_string(),
            ),
            _ if self.is_server_error() => {
                ("Server error", "Please try again later.".to_string())
            }
            _ => ("Request failed", self.message.clone()),
        };
        UserMessage {
            title: title.to_string(),
            description,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMessage {
    pub title: String,
    pub description: String,
}

impl fmt::Display for UserMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.title, self.description)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaIssue {
    /// JSON-path-like location, `$` for the document root.
    pub path: String,
    pub message: String,
}

/// Response body did not match the expected shape. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("SCHEMA_VALIDATION_FAILED: {}", describe(.issues))]
pub struct SchemaValidationError {
    pub issues: Vec<SchemaIssue>,
}

fn describe(issues: &[SchemaIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("{}: {}", issue.path, issue.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl SchemaValidationError {
    pub fn at(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            issues: vec![SchemaIssue {
                path: path.into(),
                message: message.into(),
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Schema(#[from] SchemaValidationError),
}

impl ClientError {
    pub fn as_api(&self) -> Option<&ApiError> {
        match self {
            Self::Api(err) => Some(err),
            Self::Schema(_) => None,
        }
    }

    pub fn not_found(&self) -> bool {
        self.as_api().map(ApiError::not_found).unwrap_or(false)
    }

    pub fn user_message(&self) -> UserMessage {
        match self {
            Self::Api(err) => err.user_message(),
            Self::Schema(_) => UserMessage {
                title: "Unexpected response".to_string(),
                description: "The server returned data in an unexpected format.".to_string(),
            },
        }
    }
}

/// Decodes `value` into `T`, reporting a mismatch at the document root.
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, SchemaValidationError> {
    serde_json::from_value(value).map_err(|err| SchemaValidationError::at("$", err.to_string()))
}

/// Decodes a JSON array element by element so every bad entry is reported
/// with its index.
pub fn decode_list<T: DeserializeOwned>(value: Value) -> Result<Vec<T>, SchemaValidationError> {
    let items = match value {
        Value::Array(items) => items,
        Value::Null => return Ok(Vec::new()),
        other => {
            return Err(SchemaValidationError::at(
                "$",
                format!("expected an array, found {}", kind_of(&other)),
            ))
        }
    };
    let mut decoded = Vec::with_capacity(items.len());
    let mut issues = Vec::new();
    for (idx, item) in items.into_iter().enumerate() {
        match serde_json::from_value(item) {
            Ok(entry) => decoded.push(entry),
            Err(err) => issues.push(SchemaIssue {
                path: format!("$[{idx}]"),
                message: err.to_string(),
            }),
        }
    }
    if issues.is_empty() {
        Ok(decoded)
    } else {
        Err(SchemaValidationError { issues })
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
