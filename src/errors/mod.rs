//! Closed error taxonomy for the crawler engine.
//!
//! Validation and compilation are pre-run stages and are reported separately
//! (see [`ValidationError`] and [`CrawlerError::Compilation`]); every other
//! kind below is a runtime failure and is never retried locally — see the
//! Error Handling Design section of the spec this crate implements.

use std::fmt;

/// A single structural problem found while validating a plan, before
/// compilation ever begins. Validation collects every violation instead of
/// stopping at the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted/bracketed location, e.g. `steps[1].steps[0]`, or `plan` for
    /// top-level problems.
    pub location: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

/// Every runtime (and compile-time) failure kind this crate can produce.
///
/// Deliberately closed: no catch-all/"other" variant, matching the error
/// kinds enumerated for this system. There is no local recovery or retry for
/// any of these; they always abort the current step and bubble to the plan.
#[derive(Debug, thiserror::Error)]
pub enum CrawlerError {
    #[error("compilation failed at {location}: expression `{expression}` — {cause}")]
    Compilation {
        location: String,
        expression: String,
        cause: String,
    },

    #[error("unknown step type at {location}")]
    UnknownStepType { location: String },

    #[error("unknown context `{name}` referenced at {location}")]
    UnknownContext { location: String, name: String },

    #[error("expression `{expression}` at {location} produced more than one result")]
    MultiResult { location: String, expression: String },

    #[error("unsupported content type `{content_type}` at {location}")]
    UnsupportedContentType {
        location: String,
        content_type: String,
    },

    #[error("query `{expression}` at {location} failed: {cause}")]
    QueryRuntimeError { location: String, expression: String, cause: String },

    #[error("transport error for {url}: {cause}")]
    TransportError { url: String, cause: String },

    #[error("authentication failed ({kind}): {cause}")]
    AuthError { kind: String, cause: String },

    #[error("authentication misconfigured: {message}")]
    AuthConfigError { message: String },

    #[error("cancelled")]
    Cancelled,
}

impl CrawlerError {
    pub fn query(location: impl Into<String>, expression: impl Into<String>, cause: impl fmt::Display) -> Self {
        CrawlerError::QueryRuntimeError {
            location: location.into(),
            expression: expression.into(),
            cause: cause.to_string(),
        }
    }

    pub fn transport(url: impl Into<String>, cause: impl fmt::Display) -> Self {
        CrawlerError::TransportError {
            url: url.into(),
            cause: cause.to_string(),
        }
    }
}

/// The result of validation + compilation: either a frozen compiled plan, or
/// a non-empty list of structural problems. This is distinct from a runtime
/// `CrawlerError` so hosts can report the two stages differently, per the
/// spec's CLI exit semantics.
pub type ValidationResult<T> = Result<T, Vec<ValidationError>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_displays_location_and_message() {
        let err = ValidationError::new("steps[0]", "missing `request`");
        assert_eq!(err.to_string(), "steps[0]: missing `request`");
    }

    #[test]
    fn crawler_error_messages_include_location_or_expression() {
        let err = CrawlerError::query("steps[1].steps[0]", ".items[0]", "no such field");
        let msg = err.to_string();
        assert!(msg.contains("steps[1].steps[0]"));
        assert!(msg.contains(".items[0]"));
    }
}
