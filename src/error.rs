//! The fixed error taxonomy shared by every memory operation.
//!
//! Tool handlers serialize these into a stable `{code, message, hint?}` wire
//! object via [`MemoryError::to_wire`]. Classification and entity-extraction
//! failures are recovered inside the model gateway and never reach callers;
//! every other category surfaces.

use thiserror::Error;

/// Result type alias used throughout the memory core.
pub type Result<T> = std::result::Result<T, MemoryError>;

#[derive(Error, Debug)]
pub enum MemoryError {
    /// The requested session, memory, or user has no record.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed input: unknown category/subtype pair, negative token budget,
    /// dimension mismatch in a supplied vector.
    #[error("validation error: {0}")]
    Validation(String),

    /// Content matched one or more credential patterns. Carries the matched
    /// pattern names; never the matched text.
    #[error("security violation: content matched {}", patterns.join(", "))]
    SecurityViolation { patterns: Vec<String> },

    /// The store returned a serialization/conflict error after the retry
    /// budget was exhausted.
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// The operation deadline elapsed.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The model service failed or returned output the fallback could not
    /// rescue.
    #[error("upstream model error: {0}")]
    UpstreamModel(String),

    /// Every other invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MemoryError {
    /// Stable machine-readable code for the wire object.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "validation_error",
            Self::SecurityViolation { .. } => "security_violation",
            Self::TransientStore(_) => "transient_store",
            Self::Timeout(_) => "timeout",
            Self::UpstreamModel(_) => "upstream_model",
            Self::Internal(_) => "internal",
        }
    }

    /// Serialize into the stable `{code, message, hint?}` error object.
    pub fn to_wire(&self) -> serde_json::Value {
        let mut obj = serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        if let Some(hint) = self.hint() {
            obj["hint"] = serde_json::Value::String(hint.to_string());
        }
        obj
    }

    fn hint(&self) -> Option<&'static str> {
        match self {
            Self::SecurityViolation { .. } => Some(
                "Sensitive data like API keys, passwords, and tokens cannot be \
                 stored in memory. Store a reference or description instead.",
            ),
            Self::TransientStore(_) => Some("The store was busy; retry the operation."),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound("row not found".into()),
            rusqlite::Error::SqliteFailure(code, _)
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Self::TransientStore(err.to_string())
            }
            _ => Self::Internal(format!("database error: {err}")),
        }
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_object_has_code_and_message() {
        let err = MemoryError::NotFound("session abc".into());
        let wire = err.to_wire();
        assert_eq!(wire["code"], "not_found");
        assert!(wire["message"].as_str().unwrap().contains("session abc"));
        assert!(wire.get("hint").is_none());
    }

    #[test]
    fn security_violation_lists_patterns_and_hint() {
        let err = MemoryError::SecurityViolation {
            patterns: vec!["openai_api_key".into(), "bearer_token".into()],
        };
        let wire = err.to_wire();
        assert_eq!(wire["code"], "security_violation");
        let msg = wire["message"].as_str().unwrap();
        assert!(msg.contains("openai_api_key"));
        assert!(msg.contains("bearer_token"));
        assert!(wire["hint"].as_str().unwrap().contains("reference"));
    }

    #[test]
    fn busy_sqlite_error_maps_to_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        let mapped: MemoryError = err.into();
        assert_eq!(mapped.code(), "transient_store");
    }

    #[test]
    fn no_rows_maps_to_not_found() {
        let mapped: MemoryError = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(mapped.code(), "not_found");
    }
}
