//! Handler registration and idempotency key management.

pub mod handlers;
pub mod idempotency;

pub use handlers::{HandlerRegistry, StepHandler};
pub use idempotency::{step_idempotency_key, IdempotencyRegistry};
