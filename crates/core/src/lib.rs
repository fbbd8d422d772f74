//! # toolgate core
//!
//! Domain types, traits, and error definitions for the toolgate
//! policy-enforcement gateway. This crate carries no I/O: it defines the
//! request/outcome model and the handler seam that the other crates
//! implement against.
//!
//! - [`operation`]: operation kinds, requests, outputs, and the tagged [`Outcome`]
//! - [`error`]: the [`GateError`] taxonomy
//! - [`lifecycle`]: the per-request state machine
//! - [`handler`]: [`OperationHandler`] and the [`HandlerRegistry`]

pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod operation;

pub use error::{ErrorKind, GateError, Result};
pub use handler::{Admission, HandlerRegistry, OperationHandler};
pub use lifecycle::{GateState, IllegalTransition, Lifecycle};
pub use operation::{Denial, OperationKind, OperationOutput, OperationRequest, Outcome};
