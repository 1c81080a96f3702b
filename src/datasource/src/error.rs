//! Error types for the Open-Falcon datasource.

use crate::targets::SeriesLetter;
use crate::template::TemplateError;
use crate::transport::TransportError;

/// Errors surfaced by datasource operations.
///
/// Nothing in this crate logs these; every failure is returned to the caller.
#[derive(Debug, thiserror::Error)]
pub enum DatasourceError {
    /// A time boundary could not be parsed as `now`, date math or an absolute date.
    #[error("Invalid time boundary '{input}': {reason}")]
    InvalidTime { input: String, reason: String },

    /// Template variable interpolation failed.
    #[error("Template interpolation failed: {0}")]
    Template(#[from] TemplateError),

    /// More targets than there are series reference letters.
    #[error("Too many targets: {count} given, at most {max} are supported")]
    TooManyTargets { count: usize, max: usize },

    /// A `#X` back-reference points at a letter with no resolved target.
    #[error("Target {target} references unknown series #{reference}")]
    UnknownSeriesReference {
        target: SeriesLetter,
        reference: char,
    },

    /// Back-references form a cycle (e.g. `#A` -> `#B` -> `#A`).
    #[error("Cyclic series reference involving #{0}")]
    CyclicSeriesReference(SeriesLetter),

    /// The backend answered with a payload that cannot be normalized.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The transport failed to deliver the request or its response.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl DatasourceError {
    pub(crate) fn invalid_time(input: &str, reason: impl Into<String>) -> Self {
        Self::InvalidTime {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for DatasourceError {
    fn from(err: serde_json::Error) -> Self {
        DatasourceError::MalformedResponse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DatasourceError>;
