// SPDX-License-Identifier: MIT OR Apache-2.0
//! rumi-flow
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Flow/Modifier YAML composition (§4.1) and ordered, cancellable step
//! execution (§4.2). [`loader::FlowLoader`] turns search-path YAML plus
//! Modifiers into a composed [`rumi_core::Flow`] set; [`executor::FlowExecutor`]
//! dispatches its Steps in `(phase_index, priority, id)` order against an
//! injected [`executor::KernelHandler`] registry and
//! [`executor::BlockDispatcher`].

pub mod condition;
pub mod executor;
pub mod loader;
pub mod substitution;

pub use executor::{BlockDispatcher, ExecutionOutcome, FlowExecutor, KernelHandler, StepFailure};
pub use loader::FlowLoader;

use rumi_error::{ErrorKind, RumiError};

/// Errors from Flow loading and execution.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// No Flow with this id exists after composition.
    #[error("unknown flow_id: {0}")]
    UnknownFlow(String),
    /// A non-fail-soft Step failed, aborting the Flow.
    #[error("{0}")]
    ExecutionFailed(String),
    /// Execution was cancelled via the caller's `CancellationToken`.
    #[error("execution was cancelled")]
    Cancelled,
}

impl From<FlowError> for RumiError {
    fn from(err: FlowError) -> Self {
        let kind = match &err {
            FlowError::UnknownFlow(_) => ErrorKind::Conflict,
            FlowError::ExecutionFailed(_) => ErrorKind::SchemaInvalid,
            FlowError::Cancelled => ErrorKind::Cancelled,
        };
        RumiError::new(kind, err.to_string())
    }
}
