//! Runtime containment for script executions.
//!
//! Containment is advisory. Nothing here uses namespaces, seccomp or
//! cgroups; the layers are:
//!
//! 1. Permissions: per-script capability sets, handed to the interpreter
//!    as a JSON security profile
//! 2. Limits: resource ceilings checked against live samples
//! 3. Monitor: periodic CPU/memory sampling of the child process
//! 4. Process: the interpreter child itself, with timeout and kill

pub mod limits;
pub mod monitor;
pub mod permissions;
pub mod process;

pub use limits::{
    LimitOverrides, ResourceKind, ResourceLimits, ResourceLimitsManager, UsageReport, Violation,
};
pub use monitor::{ProbeFactory, ProcessProbe, ResourceMonitor, ResourceUsage, SysinfoProbe};
pub use permissions::{
    PermissionGrant, PermissionKind, PermissionManager, PermissionOverrides, PermissionSet,
};
pub use process::{ExecOptions, ProcessExecutor, ProcessOutput};
