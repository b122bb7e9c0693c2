//! Error types for the AS4 codec.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while encoding or decoding AS4 messages.
///
/// All variants except `Io` are fatal for the current message; retry and
/// exception-store policy belongs to the calling pipeline, never to this
/// layer.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Bad or absent XML structure: unparsable document, missing Messaging
    /// header, or a signal entry with zero or several marker elements.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The dispatcher has no codec registered for the given content type.
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// Empty or unparsable multipart input, or an attachment the MIME
    /// writer cannot represent.
    #[error("MIME usage not conformant: {0}")]
    MimeInconsistency(String),

    /// Certificate not found in the store, or an unrecognized security
    /// token reference shape.
    #[error("security token resolution failed: {0}")]
    SecurityResolutionFailure(String),

    /// An asynchronous entry point observed its cancellation token at a
    /// stream boundary.
    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Severity of an ebMS error signal line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    #[serde(rename = "failure")]
    Failure,
    #[serde(rename = "warning")]
    Warning,
}

impl Severity {
    /// Wire spelling used in the `severity` attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Failure => "failure",
            Self::Warning => "warning",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "failure" => Some(Self::Failure),
            "warning" => Some(Self::Warning),
            _ => None,
        }
    }
}

/// Well-known ebMS v3 error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EbmsErrorCode {
    ValueNotRecognized,
    FeatureNotSupported,
    ValueInconsistent,
    Other,
    ConnectionFailure,
    EmptyMessagePartitionChannel,
    MimeInconsistency,
    InvalidHeader,
    ProcessingModeMismatch,
    ExternalPayloadError,
    FailedAuthentication,
    FailedDecryption,
    PolicyNoncompliance,
    MissingReceipt,
    InvalidReceipt,
    DecompressionFailure,
}

impl EbmsErrorCode {
    /// The `EBMS:NNNN` code carried on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValueNotRecognized => "EBMS:0001",
            Self::FeatureNotSupported => "EBMS:0002",
            Self::ValueInconsistent => "EBMS:0003",
            Self::Other => "EBMS:0004",
            Self::ConnectionFailure => "EBMS:0005",
            Self::EmptyMessagePartitionChannel => "EBMS:0006",
            Self::MimeInconsistency => "EBMS:0007",
            Self::InvalidHeader => "EBMS:0009",
            Self::ProcessingModeMismatch => "EBMS:0010",
            Self::ExternalPayloadError => "EBMS:0011",
            Self::FailedAuthentication => "EBMS:0101",
            Self::FailedDecryption => "EBMS:0102",
            Self::PolicyNoncompliance => "EBMS:0103",
            Self::MissingReceipt => "EBMS:0301",
            Self::InvalidReceipt => "EBMS:0302",
            Self::DecompressionFailure => "EBMS:0303",
        }
    }

    /// The short description the ebMS3 core specification attaches to each code.
    pub fn short_description(&self) -> &'static str {
        match self {
            Self::ValueNotRecognized => "ValueNotRecognized",
            Self::FeatureNotSupported => "FeatureNotSupported",
            Self::ValueInconsistent => "ValueInconsistent",
            Self::Other => "Other",
            Self::ConnectionFailure => "ConnectionFailure",
            Self::EmptyMessagePartitionChannel => "EmptyMessagePartitionChannel",
            Self::MimeInconsistency => "MimeInconsistency",
            Self::InvalidHeader => "InvalidHeader",
            Self::ProcessingModeMismatch => "ProcessingModeMismatch",
            Self::ExternalPayloadError => "ExternalPayloadError",
            Self::FailedAuthentication => "FailedAuthentication",
            Self::FailedDecryption => "FailedDecryption",
            Self::PolicyNoncompliance => "PolicyNoncompliance",
            Self::MissingReceipt => "MissingReceipt",
            Self::InvalidReceipt => "InvalidReceipt",
            Self::DecompressionFailure => "DecompressionFailure",
        }
    }
}

/// One `<eb:Error>` line inside an Error signal message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLine {
    /// Error code, e.g. `EBMS:0004`.
    pub error_code: String,
    pub severity: Severity,
    /// Functional area, e.g. "Content" or "Communication".
    pub category: Option<String>,
    /// Module or party where the error originated.
    pub origin: Option<String>,
    pub short_description: Option<String>,
    /// Human-readable description (carried as element text).
    pub description: Option<String>,
    /// Free-form detail, e.g. an exception trail.
    pub detail: Option<String>,
}

impl ErrorLine {
    /// Create an error line for a well-known ebMS code.
    pub fn from_code(code: EbmsErrorCode, severity: Severity, detail: impl Into<String>) -> Self {
        Self {
            error_code: code.as_str().to_string(),
            severity,
            category: None,
            origin: None,
            short_description: Some(code.short_description().to_string()),
            description: None,
            detail: Some(detail.into()),
        }
    }

    /// Create an `EBMS:0004 Other` failure line.
    pub fn other(detail: impl Into<String>) -> Self {
        Self::from_code(EbmsErrorCode::Other, Severity::Failure, detail)
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}
