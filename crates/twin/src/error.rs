use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::EntityKind;

#[derive(Debug)]
pub enum TwinError {
    Validation(String),
    NotFound { kind: EntityKind, id: String },
    DuplicateId(String),
    MalformedId { kind: EntityKind, id: String },
    Internal(String),
    /// Failure reported by a daemon, as seen from the client.
    Remote { code: String, message: String },
}

impl fmt::Display for TwinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TwinError::Validation(msg) => write!(f, "validation failed: {msg}"),
            TwinError::NotFound { kind, id } => write!(f, "{kind} not found: {id}"),
            TwinError::DuplicateId(id) => write!(f, "identifier {id} is already taken"),
            TwinError::MalformedId { kind, id } => write!(
                f,
                "latest {kind} identifier {id:?} does not match {}<{} digits>",
                kind.prefix(),
                kind.pad_width()
            ),
            TwinError::Internal(msg) => write!(f, "internal error: {msg}"),
            TwinError::Remote { message, .. } => f.write_str(message),
        }
    }
}

impl std::error::Error for TwinError {}

impl TwinError {
    pub fn code(&self) -> &str {
        match self {
            TwinError::Validation(_) => "validation",
            TwinError::NotFound { .. } => "not_found",
            TwinError::DuplicateId(_) => "duplicate_id",
            TwinError::MalformedId { .. } => "malformed_id",
            TwinError::Internal(_) => "internal",
            TwinError::Remote { code, .. } => code,
        }
    }
}

/// Failure half of the `{success, message, ...}` envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl From<&TwinError> for ErrorResponse {
    fn from(err: &TwinError) -> Self {
        ErrorResponse {
            success: false,
            message: err.to_string(),
            code: Some(err.code().to_string()),
        }
    }
}
