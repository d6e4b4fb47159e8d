//! Policy-enforced execution engine for user-supplied scripts.
//!
//! A script is described by a JSON manifest. Before it runs, the manifest
//! and the script source are screened; while it runs, the child process is
//! sampled against per-script resource limits and stopped on the first
//! violation. Every step is published on an in-process event bus.

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod execution;
pub mod manifest;
pub mod registry;
pub mod sandbox;
pub mod security;

pub use error::{Result, ScriptError};
