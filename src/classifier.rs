//! # Step Error Classification
//!
//! Deterministic classification of handler errors into the six classes the
//! engine uses for every control-flow decision.
//!
//! ## Overview
//!
//! Handlers are opaque: the engine interprets only the error signature they
//! report (`kind` plus optional `code`). Classification is a pure lookup —
//! the same signature always yields the same class. The base table ships with
//! the engine; a step may override individual signatures (typically to
//! downgrade a normally-retryable error to [`ErrorClass::NonRetryable`] when
//! it knows the side effect cannot be safely repeated).
//!
//! Anything the table cannot place fails closed as
//! [`ErrorClass::NonRetryable`]: surfacing uncertainty beats risking a
//! repeated unsafe side effect.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// The six error classes used for control-flow decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Short-lived fault (network blip, timeout); safe to retry
    Transient,
    /// Failure the handler reports as retryable (e.g. optimistic-lock conflict)
    Retryable,
    /// An upstream limiter rejected the call; retry after backing off
    RateLimited,
    /// A declared dependency is unavailable; retry when it recovers
    DependencyFailed,
    /// Retrying can never succeed; the execution must surface the failure
    NonRetryable,
    /// The side effect may be partially applied; a human must compensate
    CompensationRequired,
}

impl ErrorClass {
    /// Check if the retry matrix may recover this class locally
    pub fn is_auto_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transient | Self::Retryable | Self::RateLimited | Self::DependencyFailed
        )
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Retryable => write!(f, "retryable"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::DependencyFailed => write!(f, "dependency_failed"),
            Self::NonRetryable => write!(f, "non_retryable"),
            Self::CompensationRequired => write!(f, "compensation_required"),
        }
    }
}

/// Error signature kinds a handler may report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerErrorKind {
    /// The handler (or the engine's per-attempt timer) timed out
    Timeout,
    /// Connection-level failure reaching the collaborator
    Network,
    /// The collaborator throttled the call
    RateLimited,
    /// Concurrent-modification or version conflict
    Conflict,
    /// The input can never satisfy the collaborator's contract
    Validation,
    /// The caller lacks permission at the collaborator
    Unauthorized,
    /// A declared upstream dependency is down
    DependencyUnavailable,
    /// The handler cannot tell whether its side effect was applied
    SideEffectUnknown,
    /// The handler reported an error the signature table does not know
    Unclassified,
}

/// Error reported by a step handler.
///
/// Only `kind` and `code` participate in classification; `message` is kept as
/// an opaque, redacted summary on the attempt row and never branched on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("handler error ({kind:?}{}): {message}", code.as_deref().map(|c| format!(", code {c}")).unwrap_or_default())]
pub struct HandlerError {
    pub kind: HandlerErrorKind,
    pub code: Option<String>,
    pub message: String,
    /// Server-requested delay before the next attempt, when the collaborator
    /// supplied one (e.g. a Retry-After header)
    pub retry_after: Option<Duration>,
}

impl HandlerError {
    pub fn new(kind: HandlerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Network, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::RateLimited, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Validation, message)
    }

    pub fn side_effect_unknown(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::SideEffectUnknown, message)
    }

    /// Redacted one-line summary persisted on the attempt row
    pub fn summary(&self) -> String {
        match &self.code {
            Some(code) => format!("{:?}/{code}: {}", self.kind, self.message),
            None => format!("{:?}: {}", self.kind, self.message),
        }
    }
}

/// Per-step classification overrides, declared on the step definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassifierOverrides {
    /// Overrides matched by exact error code, checked first
    #[serde(default)]
    pub by_code: HashMap<String, ErrorClass>,
    /// Overrides matched by signature kind
    #[serde(default)]
    pub by_kind: HashMap<HandlerErrorKind, ErrorClass>,
}

impl ClassifierOverrides {
    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty() && self.by_kind.is_empty()
    }
}

/// Fixed base table shipped with the engine
fn base_class(kind: HandlerErrorKind) -> ErrorClass {
    match kind {
        HandlerErrorKind::Timeout | HandlerErrorKind::Network => ErrorClass::Transient,
        HandlerErrorKind::RateLimited => ErrorClass::RateLimited,
        HandlerErrorKind::Conflict => ErrorClass::Retryable,
        HandlerErrorKind::DependencyUnavailable => ErrorClass::DependencyFailed,
        HandlerErrorKind::SideEffectUnknown => ErrorClass::CompensationRequired,
        // Fail closed: permission, validation, and unknown signatures are
        // never auto-retried.
        HandlerErrorKind::Validation
        | HandlerErrorKind::Unauthorized
        | HandlerErrorKind::Unclassified => ErrorClass::NonRetryable,
    }
}

/// Classify a handler error given the step's declared overrides.
///
/// Pure and deterministic: code override, then kind override, then the base
/// table.
pub fn classify(error: &HandlerError, overrides: &ClassifierOverrides) -> ErrorClass {
    if let Some(code) = &error.code {
        if let Some(class) = overrides.by_code.get(code) {
            return *class;
        }
    }
    if let Some(class) = overrides.by_kind.get(&error.kind) {
        return *class;
    }
    base_class(error.kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_table() {
        let none = ClassifierOverrides::default();
        assert_eq!(
            classify(&HandlerError::timeout("slow"), &none),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&HandlerError::network("refused"), &none),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&HandlerError::rate_limited("429"), &none),
            ErrorClass::RateLimited
        );
        assert_eq!(
            classify(&HandlerError::new(HandlerErrorKind::Conflict, "lock"), &none),
            ErrorClass::Retryable
        );
        assert_eq!(
            classify(
                &HandlerError::new(HandlerErrorKind::DependencyUnavailable, "down"),
                &none
            ),
            ErrorClass::DependencyFailed
        );
        assert_eq!(
            classify(&HandlerError::validation("bad input"), &none),
            ErrorClass::NonRetryable
        );
        assert_eq!(
            classify(&HandlerError::side_effect_unknown("uncertain"), &none),
            ErrorClass::CompensationRequired
        );
    }

    #[test]
    fn test_unclassifiable_fails_closed() {
        let error = HandlerError::new(HandlerErrorKind::Unclassified, "mystery failure");
        assert_eq!(
            classify(&error, &ClassifierOverrides::default()),
            ErrorClass::NonRetryable
        );
    }

    #[test]
    fn test_step_override_downgrades_retryable() {
        let mut overrides = ClassifierOverrides::default();
        overrides
            .by_kind
            .insert(HandlerErrorKind::Network, ErrorClass::NonRetryable);

        let error = HandlerError::network("payment gateway reset mid-call");
        assert_eq!(classify(&error, &overrides), ErrorClass::NonRetryable);
    }

    #[test]
    fn test_code_override_takes_precedence_over_kind() {
        let mut overrides = ClassifierOverrides::default();
        overrides
            .by_kind
            .insert(HandlerErrorKind::Conflict, ErrorClass::NonRetryable);
        overrides
            .by_code
            .insert("DOC_LOCKED".to_string(), ErrorClass::Retryable);

        let error =
            HandlerError::new(HandlerErrorKind::Conflict, "document locked").with_code("DOC_LOCKED");
        assert_eq!(classify(&error, &overrides), ErrorClass::Retryable);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let error = HandlerError::rate_limited("throttled").with_code("T429");
        let overrides = ClassifierOverrides::default();
        let first = classify(&error, &overrides);
        for _ in 0..10 {
            assert_eq!(classify(&error, &overrides), first);
        }
    }

    #[test]
    fn test_auto_recoverable_partition() {
        assert!(ErrorClass::Transient.is_auto_recoverable());
        assert!(ErrorClass::Retryable.is_auto_recoverable());
        assert!(ErrorClass::RateLimited.is_auto_recoverable());
        assert!(ErrorClass::DependencyFailed.is_auto_recoverable());
        assert!(!ErrorClass::NonRetryable.is_auto_recoverable());
        assert!(!ErrorClass::CompensationRequired.is_auto_recoverable());
    }

    #[test]
    fn test_error_summary_redaction_shape() {
        let error = HandlerError::validation("amount must be positive").with_code("NEG_AMOUNT");
        assert_eq!(
            error.summary(),
            "Validation/NEG_AMOUNT: amount must be positive"
        );
    }
}
