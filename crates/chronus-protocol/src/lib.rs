//! Protocol crate - shared contracts between the supervisor and DSP workers.
//!
//! This crate contains the canonical definitions for module kinds, parameter
//! specifications, command records, and engine configuration, ensuring
//! consistency between the control plane, the worker slots, and the DSP layer.

pub mod command;
pub mod config;
pub mod kind;
pub mod params;

pub use command::{
    Command, CommandOp, MAX_GRAPH_EDGES, MAX_GRAPH_MODULES, pack_source, unpack_source,
};
pub use config::{ConfigError, EngineConfig};
pub use kind::ModuleKind;
pub use params::{ParamSpec, module_param_specs, param_index};
