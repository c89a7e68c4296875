//! Graph engine core: preparation, scheduling and local execution.
//!
//! - `binding` -- reference checks, type and artifact-flag unification
//! - `dag` -- dependency inference, cycle detection, execution waves
//! - `context` -- per-container binding environment and scopes
//! - `expression` -- guard, output and fan-out expression evaluation
//! - `slices` -- fan-out expansion and ordered reassembly
//! - `body` -- step body trait, closure and process bodies
//! - `retry` -- retry decisions and backoff
//! - `script` / `container` / `executor` -- the local execution engine
//! - `definition` -- template enumeration and YAML round trip
//! - `query` -- read-only queries over a finished run

pub mod binding;
pub mod body;
mod container;
pub mod context;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod query;
pub mod retry;
mod script;
pub mod slices;

pub use body::{BodyRegistry, BoxStepBody, CommandBody, FnBody, Invocation, StepBody, StepError};
pub use executor::{ExecutorError, GraphExecutor, LocalExecutor};
pub use query::RunQuery;
