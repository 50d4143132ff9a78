use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StatementInsightError {
    #[error("Malformed table: {0}")]
    Shape(String),

    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error("External service '{service}' failed: {details}")]
    ExternalService { service: String, details: String },

    #[error("External service '{service}' did not answer within {waited:?}")]
    Timeout { service: String, waited: Duration },

    #[error("No account holder name could be resolved for document {document}")]
    IdentityResolution { document: String },

    #[error("Insufficient data for recommendation: {0}")]
    InsufficientData(String),

    #[error("Account holder not found: {0}")]
    HolderNotFound(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[cfg(feature = "remote")]
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, StatementInsightError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Shape,
    Precondition,
    ExternalService,
    IdentityResolution,
    InsufficientData,
    NotFound,
    Internal,
}

/// Serializable error body for the HTTP/CLI layer.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub status: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
}

impl StatementInsightError {
    pub(crate) fn external(service: impl Into<String>, details: impl Into<String>) -> Self {
        Self::ExternalService {
            service: service.into(),
            details: details.into(),
        }
    }

    /// Transient failures of an external call that a retry may fix.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ExternalService { .. } | Self::Timeout { .. } => true,
            #[cfg(feature = "remote")]
            Self::HttpError(_) => true,
            _ => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Shape(_) => ErrorKind::Shape,
            Self::Precondition(_) => ErrorKind::Precondition,
            Self::ExternalService { .. } | Self::Timeout { .. } => ErrorKind::ExternalService,
            #[cfg(feature = "remote")]
            Self::HttpError(_) => ErrorKind::ExternalService,
            Self::IdentityResolution { .. } => ErrorKind::IdentityResolution,
            Self::InsufficientData(_) => ErrorKind::InsufficientData,
            Self::HolderNotFound(_) => ErrorKind::NotFound,
            Self::Config(_) | Self::SerializationError(_) | Self::IoError(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        let kind = self.kind();
        let status = match (kind, self) {
            (_, Self::Timeout { .. }) => 504,
            (ErrorKind::Shape, _) => 422,
            (ErrorKind::Precondition, _) => 500,
            (ErrorKind::ExternalService, _) => 502,
            (ErrorKind::IdentityResolution, _) => 422,
            (ErrorKind::InsufficientData, _) => 409,
            (ErrorKind::NotFound, _) => 404,
            (ErrorKind::Internal, _) => 500,
        };
        let document = match self {
            Self::IdentityResolution { document } => Some(document.clone()),
            _ => None,
        };

        ErrorPayload {
            kind,
            status,
            message: self.to_string(),
            document,
        }
    }
}
