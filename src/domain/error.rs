use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::protocol::ErrorShape;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestionErrorCode {
    InvalidPayload,
    ProviderNotSupported,
    ValidationFailed,
    IdentityResolutionFailed,
    DuplicateMessage,
    ThreadingFailed,
    UnknownError,
}

impl IngestionErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::ProviderNotSupported => "PROVIDER_NOT_SUPPORTED",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::IdentityResolutionFailed => "IDENTITY_RESOLUTION_FAILED",
            Self::DuplicateMessage => "DUPLICATE_MESSAGE",
            Self::ThreadingFailed => "THREADING_FAILED",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Inverse of [`Self::as_str`]; unrecognised codes map to `UnknownError`.
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        match code {
            "INVALID_PAYLOAD" => Self::InvalidPayload,
            "PROVIDER_NOT_SUPPORTED" => Self::ProviderNotSupported,
            "VALIDATION_FAILED" => Self::ValidationFailed,
            "IDENTITY_RESOLUTION_FAILED" => Self::IdentityResolutionFailed,
            "DUPLICATE_MESSAGE" => Self::DuplicateMessage,
            "THREADING_FAILED" => Self::ThreadingFailed,
            _ => Self::UnknownError,
        }
    }
}

impl fmt::Display for IngestionErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure raised by any ingestion stage.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct IngestionError {
    pub code: IngestionErrorCode,
    pub message: String,
    pub provider_id: String,
    pub provider_message_id: Option<String>,
    pub details: Option<Value>,
}

impl IngestionError {
    #[must_use]
    pub fn new(
        code: IngestionErrorCode,
        message: impl Into<String>,
        provider_id: impl Into<String>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            provider_id: provider_id.into(),
            provider_message_id: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_message_id(mut self, provider_message_id: impl Into<String>) -> Self {
        self.provider_message_id = Some(provider_message_id.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Rebinds the error to the message being processed.
    #[must_use]
    pub fn for_message(mut self, provider_id: &str, provider_message_id: &str) -> Self {
        self.provider_id = provider_id.to_owned();
        self.provider_message_id = Some(provider_message_id.to_owned());
        self
    }

    /// Wraps an infrastructure failure under `code`, keeping the source text in `details`.
    #[must_use]
    pub fn from_domain(
        code: IngestionErrorCode,
        error: &DomainError,
        provider_id: &str,
        provider_message_id: &str,
    ) -> Self {
        Self::new(code, error.to_string(), provider_id)
            .with_message_id(provider_message_id)
            .with_details(serde_json::json!({ "cause": error.to_string() }))
    }

    #[must_use]
    pub fn to_shape(&self) -> ErrorShape {
        let mut details = serde_json::Map::new();
        details.insert("providerId".to_owned(), Value::String(self.provider_id.clone()));
        if let Some(message_id) = &self.provider_message_id {
            details.insert(
                "providerMessageId".to_owned(),
                Value::String(message_id.clone()),
            );
        }
        if let Some(extra) = &self.details {
            details.insert("context".to_owned(), extra.clone());
        }

        let shape = ErrorShape::new(self.code.as_str(), self.message.clone())
            .with_details(Value::Object(details));
        if self.code == IngestionErrorCode::UnknownError {
            shape.retryable()
        } else {
            shape
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{IngestionError, IngestionErrorCode};

    #[test]
    fn codes_serialize_as_screaming_snake() {
        let text = serde_json::to_string(&IngestionErrorCode::ProviderNotSupported)
            .expect("code should serialize");
        assert_eq!(text, "\"PROVIDER_NOT_SUPPORTED\"");
        assert_eq!(
            IngestionErrorCode::IdentityResolutionFailed.to_string(),
            "IDENTITY_RESOLUTION_FAILED"
        );
    }

    #[test]
    fn shape_carries_provider_context() {
        let error = IngestionError::new(IngestionErrorCode::InvalidPayload, "bad", "twilio-main")
            .with_message_id("SM1");
        let shape = error.to_shape();
        assert_eq!(shape.code, "INVALID_PAYLOAD");
        let details = shape.details.expect("details expected");
        assert_eq!(details["providerId"], "twilio-main");
        assert_eq!(details["providerMessageId"], "SM1");
        assert!(shape.retryable.is_none());
    }
}
