use serde::Serialize;
use thiserror::Error;

pub type PiwikResult<T> = Result<T, PiwikError>;

/// Errors surfaced to the assistant as structured tool failures
#[derive(Debug, Error)]
pub enum PiwikError {
    /// Malformed or missing input, caught before any network call
    /// (or reported distinctly by the analytics endpoint)
    #[error("{message}")]
    Validation {
        message: String,
        status: Option<u16>,
    },

    /// Credentials rejected, token endpoint unreachable, or a second 401
    #[error("{message}")]
    Auth {
        message: String,
        status: Option<u16>,
    },

    #[error("{message}")]
    NotFound { message: String },

    #[error("{0}")]
    Transport(String),

    #[error("Piwik PRO API error ({status}): {message}")]
    Upstream { status: u16, message: String },
}

impl PiwikError {
    pub fn validation(message: impl Into<String>) -> Self {
        PiwikError::Validation {
            message: message.into(),
            status: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PiwikError::Validation { .. } => "validation_error",
            PiwikError::Auth { .. } => "auth_error",
            PiwikError::NotFound { .. } => "not_found_error",
            PiwikError::Transport(_) => "transport_error",
            PiwikError::Upstream { .. } => "upstream_error",
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            PiwikError::Validation { status, .. } | PiwikError::Auth { status, .. } => *status,
            PiwikError::NotFound { .. } => Some(404),
            PiwikError::Transport(_) => None,
            PiwikError::Upstream { status, .. } => Some(*status),
        }
    }

    pub fn to_payload(&self) -> ToolError {
        ToolError {
            kind: self.kind(),
            message: self.to_string(),
            status: self.status(),
        }
    }
}

impl From<reqwest::Error> for PiwikError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PiwikError::Transport(format!("Request to Piwik PRO timed out: {}", err))
        } else {
            PiwikError::Transport(format!("Failed to reach Piwik PRO: {}", err))
        }
    }
}

/// Wire shape of a failed tool call
#[derive(Debug, Clone, Serialize)]
pub struct ToolError {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

/// Pull a human-readable message out of an error response body
pub fn upstream_message(body: &str) -> String {
    const MAX_LEN: usize = 500;

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(errors) = json.get("errors").and_then(|v| v.as_array()) {
            let parts: Vec<String> = errors
                .iter()
                .filter_map(|e| {
                    let title = e.get("title").and_then(|v| v.as_str());
                    let detail = e.get("detail").and_then(|v| v.as_str());
                    match (title, detail) {
                        (Some(t), Some(d)) => Some(format!("{}: {}", t, d)),
                        (Some(t), None) => Some(t.to_string()),
                        (None, Some(d)) => Some(d.to_string()),
                        (None, None) => None,
                    }
                })
                .collect();
            if !parts.is_empty() {
                return parts.join("; ");
            }
        }
        for key in ["message", "error_description", "error"] {
            if let Some(msg) = json.get(key).and_then(|v| v.as_str()) {
                return msg.to_string();
            }
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response body".to_string();
    }
    trimmed.chars().take(MAX_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_status() {
        let err = PiwikError::Upstream {
            status: 500,
            message: "boom".to_string(),
        };
        assert_eq!(err.kind(), "upstream_error");
        assert_eq!(err.status(), Some(500));

        let err = PiwikError::validation("bad");
        assert_eq!(err.kind(), "validation_error");
        assert_eq!(err.status(), None);
    }

    #[test]
    fn test_payload_omits_missing_status() {
        let payload = PiwikError::Transport("connection refused".to_string()).to_payload();
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "transport_error");
        assert!(json.get("status").is_none());
    }

    #[test]
    fn test_upstream_message_jsonapi_errors() {
        let body = r#"{"errors":[{"title":"Invalid column","detail":"foo is not a column"}]}"#;
        assert_eq!(upstream_message(body), "Invalid column: foo is not a column");
    }

    #[test]
    fn test_upstream_message_plain_fields() {
        assert_eq!(upstream_message(r#"{"message":"nope"}"#), "nope");
        assert_eq!(upstream_message("  gateway down "), "gateway down");
        assert_eq!(upstream_message(""), "empty response body");
    }

    #[test]
    fn test_upstream_message_truncates_text() {
        let body = "x".repeat(2000);
        assert_eq!(upstream_message(&body).len(), 500);
    }
}
