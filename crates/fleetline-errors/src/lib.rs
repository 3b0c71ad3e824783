//! Shared error types for Fleetline
//!
//! Every crate in the workspace reports failures in its own `thiserror` enum and
//! maps them onto the rollout failure taxonomy defined here, so the session
//! machine can decide between retry, transport fallback, rollback and operator
//! escalation without knowing which component failed.
//!
//! - [`class`]: [`FailureClass`] taxonomy and its retry/fallback rules
//! - [`severity`]: [`ErrorSeverity`] reporting levels
//! - [`validation`]: Problems found in operator-supplied settings
//!
//! # Example
//!
//! ```
//! use fleetline_errors::prelude::*;
//!
//! fn check_chunk_size(size: usize) -> Result<usize, ValidationError> {
//!     if size == 0 {
//!         return Err(ValidationError::not_positive("supervisor.chunk_size"));
//!     }
//!     Ok(size)
//! }
//!
//! assert!(check_chunk_size(0).is_err());
//! assert!(FailureClass::TransientChannel.is_retryable());
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod class;
pub mod prelude;
pub mod severity;
pub mod validation;

pub use class::FailureClass;
pub use severity::ErrorSeverity;
pub use validation::{Problem, ValidationError};
