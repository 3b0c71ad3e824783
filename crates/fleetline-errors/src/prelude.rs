//! One import for the types most callers need.

pub use crate::{
    class::FailureClass,
    severity::ErrorSeverity,
    validation::{Problem, ValidationError},
};
