use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error reported by a provider, as seen by an adaptor or a probe.
#[derive(Clone, Debug, Default, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("upstream error (status {status}): {message}")]
pub struct UpstreamError {
    pub status: u16,
    #[serde(default, rename = "type")]
    pub error_type: String,
    #[serde(default)]
    pub code: String,
    pub message: String,
}

const DISABLING_TYPES: &[&str] = &[
    "insufficient_quota",
    "authentication_error",
    "permission_error",
    "forbidden",
];

const DISABLING_CODES: &[&str] = &["invalid_api_key", "account_deactivated"];

const DISABLING_MESSAGES: &[&str] = &[
    "your access was terminated",
    "violation of our policy",
    "your credit balance is too low",
    "organization has been disabled",
    "organization has been restricted",
    "permission denied",
    "credit",
    "balance",
];

impl UpstreamError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            error_type: String::new(),
            code: String::new(),
            message: message.into(),
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    /// Whether the error means the credential itself is unusable (revoked key,
    /// exhausted account) rather than a transient failure.
    pub fn should_disable_channel(&self) -> bool {
        if self.status == 401 {
            return true;
        }
        if DISABLING_TYPES.contains(&self.error_type.as_str())
            || DISABLING_CODES.contains(&self.code.as_str())
        {
            return true;
        }
        let message = self.message.to_lowercase();
        DISABLING_MESSAGES
            .iter()
            .any(|needle| message.contains(needle))
    }

    /// Parses an OpenAI-style `{"error": {...}}` body, falling back to the raw
    /// text as the message.
    pub fn from_response_body(status: u16, body: &str) -> Self {
        #[derive(Deserialize)]
        struct Envelope {
            error: Detail,
        }

        #[derive(Deserialize)]
        struct Detail {
            #[serde(default)]
            message: String,
            #[serde(default, rename = "type")]
            error_type: Option<String>,
            #[serde(default)]
            code: Option<serde_json::Value>,
        }

        match serde_json::from_str::<Envelope>(body) {
            Ok(envelope) => Self {
                status,
                error_type: envelope.error.error_type.unwrap_or_default(),
                code: match envelope.error.code {
                    Some(serde_json::Value::String(code)) => code,
                    Some(serde_json::Value::Number(code)) => code.to_string(),
                    _ => String::new(),
                },
                message: envelope.error.message,
            },
            Err(_) => Self::new(status, body.trim()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_errors_disable() {
        assert!(UpstreamError::new(401, "bad key").should_disable_channel());
        assert!(
            UpstreamError::new(429, "You exceeded your current quota")
                .with_type("insufficient_quota")
                .should_disable_channel()
        );
        assert!(
            UpstreamError::new(400, "x")
                .with_code("invalid_api_key")
                .should_disable_channel()
        );
        assert!(
            UpstreamError::new(400, "Your credit balance is too low to access the API")
                .should_disable_channel()
        );
    }

    #[test]
    fn transient_errors_do_not_disable() {
        assert!(!UpstreamError::new(500, "internal error").should_disable_channel());
        assert!(
            !UpstreamError::new(429, "Rate limit reached")
                .with_type("rate_limit_error")
                .should_disable_channel()
        );
    }

    #[test]
    fn parses_openai_error_envelope() {
        let err = UpstreamError::from_response_body(
            403,
            r#"{"error":{"message":"denied","type":"permission_error","code":null}}"#,
        );
        assert_eq!(err.status, 403);
        assert_eq!(err.error_type, "permission_error");
        assert_eq!(err.message, "denied");
        assert!(err.code.is_empty());

        let err = UpstreamError::from_response_body(502, " bad gateway \n");
        assert_eq!(err.message, "bad gateway");
    }
}
