//! Capability workflow runtime.
//!
//! This crate turns provider capability schemas into callable descriptors
//! (`schema`, `capability`, `manifest`), binds them into per-provider
//! dispatch namespaces (`dispatch`, `provider`), runs generated workflow
//! source as an isolated unit with a streamed progress log (`program`,
//! `runtime`, `events`, `prompt`), and renders the same source as a flow
//! diagram (`flowchart`).
//!
//! Invariants the runtime holds:
//! - a run's event stream begins with one `WorkflowStart` and ends with one
//!   `WorkflowEnd`, whatever happened in between
//! - every loaded unit is unloaded exactly once, success or failure
//! - a `Wait` join returns results in argument order and brackets its
//!   members' begin/end event pairs
//! - diagram rendering is a pure function of the source text

pub mod capability;
pub mod demo;
pub mod dispatch;
pub mod events;
pub mod flowchart;
pub mod manifest;
pub mod program;
pub mod prompt;
pub mod provider;
pub mod runtime;
pub mod schema;
