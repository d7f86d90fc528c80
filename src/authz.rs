//! Authorization boundary for human-triggered actions.
//!
//! The engine consumes authorization as a yes/no decision plus a trace; the
//! evaluation itself is an external collaborator. Every permission-gated
//! operation (approval, manual retry, cancellation) consults the configured
//! [`Authorizer`] before mutating anything.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Human-triggered actions subject to authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    ApproveStep,
    RetryStep,
    RetryExecution,
    CancelExecution,
    PauseExecution,
    ResumeExecution,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApproveStep => write!(f, "approve_step"),
            Self::RetryStep => write!(f, "retry_step"),
            Self::RetryExecution => write!(f, "retry_execution"),
            Self::CancelExecution => write!(f, "cancel_execution"),
            Self::PauseExecution => write!(f, "pause_execution"),
            Self::ResumeExecution => write!(f, "resume_execution"),
        }
    }
}

/// Decision returned by the authorization collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub allowed: bool,
    /// Opaque trace from the evaluator, kept for audit logging
    pub trace: String,
}

impl AccessDecision {
    pub fn allow(trace: impl Into<String>) -> Self {
        Self {
            allowed: true,
            trace: trace.into(),
        }
    }

    pub fn deny(trace: impl Into<String>) -> Self {
        Self {
            allowed: false,
            trace: trace.into(),
        }
    }
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, actor: &str, action: Action, resource: &str) -> AccessDecision;
}

/// Permits everything; for embedding and tests
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _actor: &str, _action: Action, _resource: &str) -> AccessDecision {
        AccessDecision::allow("allow-all")
    }
}

/// Denies everything; for tests exercising the permission gate
pub struct DenyAll;

#[async_trait]
impl Authorizer for DenyAll {
    async fn authorize(&self, actor: &str, action: Action, _resource: &str) -> AccessDecision {
        AccessDecision::deny(format!("deny-all refused {action} for {actor}"))
    }
}
