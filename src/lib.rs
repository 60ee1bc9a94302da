//! geoflow: a framework that turns a collection of compute entry points
//! into a command-line driver for geospatial, embarrassingly-parallel
//! workloads on an HPC cluster.
//!
//! Users describe a multi-step pipeline, optionally multiplied by a batch
//! parameter sweep. Each step fans out into one or more scheduler jobs,
//! every job's progress lands in a persistent per-project status store, and
//! later invocations resume or re-run failed work from that record.

/// Uniform interface over cluster schedulers and local execution
pub mod backend;
/// Parameter-sweep expansion into sibling pipeline directories
pub mod batch;
/// Command-line surface
pub mod cli;
/// Entry-point registry and node-side task execution
pub mod command;
/// Format-agnostic config I/O
pub mod config;
/// Step fan-out, task tags, and submission
pub mod dispatch;
/// Tracing subscriber setup
pub mod logging;
/// Linear step state machine
pub mod pipeline;
/// Site tables and contiguous partitioning
pub mod points;
/// Persistent per-project status store
pub mod status;

pub use backend::{Backend, ExecutionControl, SchedulerKind};
pub use command::{CommandRegistry, EntryPoint};
pub use config::{load_config, Config, ConfigFormat};
pub use pipeline::Pipeline;
pub use points::SiteTable;
pub use status::{StatusStore, TaskState};
