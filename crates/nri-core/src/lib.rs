//! Runtime-side plugin adaptation engine.
//!
//! This crate mediates between an OCI-adjacent container runtime and a set
//! of third-party plugins that observe and adjust container lifecycle. It
//! owns the plugin registry and dispatch pipeline, the ownership-tracking
//! merge of per-plugin proposals into one consolidated adjustment, the
//! framed multiplexer that carries plugin RPC over a single byte stream,
//! and the heterogeneous plugin execution backings (external process,
//! in-process builtin, sandboxed WebAssembly).

// Generated protobuf message types.
pub mod api {
    include!(concat!(env!("OUT_DIR"), "/mod.rs"));
}

// Generated ttrpc service stubs.
pub mod api_ttrpc {
    include!(concat!(env!("OUT_DIR"), "/api_ttrpc.rs"));
}

pub mod error;
pub mod events_mask;
pub mod merge;
pub mod mux;
pub mod orchestrator;
pub mod ownership;
pub mod plugin;
pub mod transport;
pub mod validate;

pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, OrchestratorConfig};

#[cfg(feature = "examples")]
pub mod examples;
