//! Graph preparation, fan-out slicing and the local execution engine.
//!
//! Template trees built with `stepgraph-types` are validated by
//! [`workflow::binding::prepare`] and run by [`workflow::LocalExecutor`].
//! Configuration is loaded by [`config::load_engine_config`]; run progress is
//! published on an [`event::EventBus`].

pub mod config;
pub mod event;
pub mod workflow;
