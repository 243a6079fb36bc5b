// validator.rs — Precondition validation collaborator.
//
// Plan preconditions are opaque descriptive strings ("Git repository is
// clean"). Whether one actually holds is answered by an injected
// validator. Validation fails closed: an unreachable validator is an
// error, never a silent pass.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure modes of a validator collaborator.
#[derive(Debug, Error)]
pub enum ValidatorError {
    /// The validator could not be reached at all.
    #[error("validator unavailable: {0}")]
    Unavailable(String),
}

/// External collaborator that decides whether a precondition holds.
pub trait PreconditionValidator {
    fn check(&self, condition: &str) -> Result<bool, ValidatorError>;
}

/// Outcome of validating a plan's preconditions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationReport {
    pub passed: bool,
    /// Preconditions the validator reported as not holding.
    pub violated: Vec<String>,
}

/// Validator over a fixed set of satisfied conditions.
///
/// Useful for tests and for hosts that resolve conditions up front.
#[derive(Debug, Default)]
pub struct StaticValidator {
    satisfied: HashSet<String>,
}

impl StaticValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a condition as satisfied.
    pub fn satisfy(mut self, condition: impl Into<String>) -> Self {
        self.satisfied.insert(condition.into());
        self
    }
}

impl PreconditionValidator for StaticValidator {
    fn check(&self, condition: &str) -> Result<bool, ValidatorError> {
        Ok(self.satisfied.contains(condition))
    }
}

/// A validator that is never reachable — models a down collaborator.
#[derive(Debug, Default)]
pub struct UnavailableValidator;

impl PreconditionValidator for UnavailableValidator {
    fn check(&self, _condition: &str) -> Result<bool, ValidatorError> {
        Err(ValidatorError::Unavailable(
            "validator endpoint unreachable".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_validator_checks_membership() {
        let validator = StaticValidator::new().satisfy("Git repository is clean");
        assert!(validator.check("Git repository is clean").unwrap());
        assert!(!validator.check("All tests pass currently").unwrap());
    }

    #[test]
    fn unavailable_validator_always_errors() {
        let validator = UnavailableValidator;
        assert!(matches!(
            validator.check("anything"),
            Err(ValidatorError::Unavailable(_))
        ));
    }
}
