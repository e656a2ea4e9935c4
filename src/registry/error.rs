use std::fmt::{Display, Formatter};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryErrorKind {
    /// Credentials missing or rejected.
    Unauthorized,
    Forbidden,
    NotFound,
    /// The registry answered with something this client does not understand.
    UnexpectedResponse,
    /// No response was received.
    Transport,
}

/// One entry of the `{"errors": [...]}` body registries attach to failures.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorEntryTemplate {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Display for ErrorEntryTemplate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => write!(f, "{}: {}", code, message),
            (Some(code), None) => write!(f, "{}", code),
            (None, Some(message)) => write!(f, "{}", message),
            (None, None) => write!(f, "unknown error"),
        }
    }
}

#[derive(Deserialize)]
struct ErrorResponseTemplate {
    #[serde(default)]
    errors: Vec<ErrorEntryTemplate>,
}

/// Extracts the error list from a registry response body, if it has one.
pub fn parse_error_entries(body: &[u8]) -> Vec<ErrorEntryTemplate> {
    serde_json::from_slice::<ErrorResponseTemplate>(body)
        .map(|response| response.errors)
        .unwrap_or_default()
}

/// A failed registry operation.
///
/// The message names the action (which includes the digest or tag involved)
/// and the image reference, followed by the reason and the registry's own
/// error list, e.g.
/// `Tried to pull blob sha256:... of registry.example/app but failed because: 404 Not Found | BLOB_UNKNOWN: blob unknown to registry`.
#[derive(Debug, Error)]
#[error("Tried to {action} of {image_reference} but failed because: {reason}{}", format_entries(.errors))]
pub struct RegistryError {
    kind: RegistryErrorKind,
    action: String,
    image_reference: String,
    reason: String,
    status: Option<u16>,
    errors: Vec<ErrorEntryTemplate>,
}

impl RegistryError {
    pub fn new(kind: RegistryErrorKind, action: impl Into<String>, image_reference: impl Into<String>, reason: impl Into<String>) -> RegistryError {
        RegistryError {
            kind,
            action: action.into(),
            image_reference: image_reference.into(),
            reason: reason.into(),
            status: None,
            errors: Vec::new(),
        }
    }

    pub fn with_status(mut self, status: u16) -> RegistryError {
        self.status = Some(status);
        self
    }

    pub fn with_errors(mut self, errors: Vec<ErrorEntryTemplate>) -> RegistryError {
        self.errors = errors;
        self
    }

    pub fn kind(&self) -> RegistryErrorKind {
        self.kind
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn image_reference(&self) -> &str {
        &self.image_reference
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn errors(&self) -> &[ErrorEntryTemplate] {
        &self.errors
    }
}

fn format_entries(errors: &[ErrorEntryTemplate]) -> String {
    errors.iter().map(|entry| format!(" | {}", entry)).collect()
}
