//! Errors for operator-facing registration.
//!
//! Recording and analytics never fail; only definitions can be rejected.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DefinitionError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DefinitionError {
    #[error("definition id must not be empty")]
    EmptyId,

    #[error("experiment {0} has no variants")]
    NoVariants(String),

    #[error("experiment {experiment}: variant {variant} weight {weight} outside 0..=100")]
    WeightOutOfRange {
        experiment: String,
        variant: String,
        weight: f64,
    },

    #[error("experiment {experiment}: duplicate variant id {variant}")]
    DuplicateVariant { experiment: String, variant: String },

    #[error("experiment {0}: traffic allocation outside 0..=100")]
    AllocationOutOfRange(String),

    #[error("experiment {0}: active window ends before it starts")]
    EmptyWindow(String),

    #[error("experiment {0} is referenced by recorded events; only activity and window may change")]
    Locked(String),

    #[error("funnel {0} has no steps")]
    NoSteps(String),

    #[error("funnel {funnel}: step order must be strictly increasing (step {step})")]
    StepOrder { funnel: String, step: String },

    #[error("funnel {funnel}: duplicate step id {step}")]
    DuplicateStep { funnel: String, step: String },

    #[error("{0} is referenced by recorded events and cannot be removed")]
    InUse(String),
}
