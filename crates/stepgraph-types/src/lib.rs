//! Graph model types for stepgraph.
//!
//! This crate holds the data model shared by graph construction, the local
//! execution engine and any cluster adapter: templates and their typed
//! signatures, steps with bound arguments, references and expressions,
//! artifact handles, run records, events and configuration.
//!
//! Zero runtime dependencies -- only serde, uuid, chrono, thiserror.

pub mod artifact;
pub mod config;
pub mod error;
pub mod event;
pub mod expr;
pub mod io;
pub mod run;
pub mod step;
pub mod template;
