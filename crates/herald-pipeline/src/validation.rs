//! Validation decorator
//!
//! Rejects messages failing schema/constraint checks with
//! Failure(Validation) before anything downstream runs. Validators are
//! registered per type tag; the envelope sanity checks always apply.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use herald_common::{Envelope, ErrorKind, Outcome, ProcessingFailure};

use crate::processor::{ProcessContext, Processor};

/// Constraint check for one message type.
pub trait MessageValidator: Send + Sync {
    /// All violations, empty when the message is acceptable.
    fn validate(&self, envelope: &Envelope) -> Vec<String>;
}

/// Closure-backed validator.
pub struct FnValidator<F>(pub F);

impl<F> MessageValidator for FnValidator<F>
where
    F: Fn(&Envelope) -> Vec<String> + Send + Sync,
{
    fn validate(&self, envelope: &Envelope) -> Vec<String> {
        (self.0)(envelope)
    }
}

/// Envelope shape checks that apply to every message: a real id, a
/// non-empty type tag, and a timestamp not absurdly in the future.
fn envelope_violations(envelope: &Envelope, ctx: &ProcessContext) -> Vec<String> {
    let mut violations = Vec::new();
    if envelope.id.is_nil() {
        violations.push("message id must not be nil".to_string());
    }
    if envelope.message_type.trim().is_empty() {
        violations.push("message type tag must not be empty".to_string());
    }
    let skew = chrono::Duration::minutes(5);
    if envelope.timestamp > ctx.now() + skew {
        violations.push("message timestamp is in the future".to_string());
    }
    violations
}

pub struct ValidationDecorator {
    validators: HashMap<String, Vec<Arc<dyn MessageValidator>>>,
    inner: Arc<dyn Processor>,
}

impl ValidationDecorator {
    pub fn new(inner: Arc<dyn Processor>) -> Self {
        Self { validators: HashMap::new(), inner }
    }

    pub fn with_validator(
        mut self,
        message_type: impl Into<String>,
        validator: Arc<dyn MessageValidator>,
    ) -> Self {
        self.validators.entry(message_type.into()).or_default().push(validator);
        self
    }
}

#[async_trait]
impl Processor for ValidationDecorator {
    async fn process(&self, envelope: &Envelope, ctx: &ProcessContext) -> Outcome {
        if let Some(failure) = ctx.interruption() {
            return Outcome::Failure(failure);
        }

        let mut violations = envelope_violations(envelope, ctx);
        if let Some(validators) = self.validators.get(&envelope.message_type) {
            for validator in validators {
                violations.extend(validator.validate(envelope));
            }
        }

        if !violations.is_empty() {
            debug!(
                message_id = %envelope.id,
                message_type = %envelope.message_type,
                violations = violations.len(),
                "Message failed validation"
            );
            return Outcome::Failure(
                ProcessingFailure::new(ErrorKind::Validation, violations.join("; ")),
            );
        }

        self.inner.process(envelope, ctx).await
    }
}
