//! codar-workflow — core library
//!
//! A concurrent execution engine for node-budgeted HPC pipelines: admission,
//! largest-fit scheduling, per-run process supervision, kill-on-partial-
//! failure, post-processing, and durable status tracking.
pub mod adios;
pub mod consumer;
pub mod error;
pub mod job_list;
pub mod launcher;
pub mod node_layout;
pub mod pipeline;
pub mod producer;
pub mod run;
pub mod schema;
pub mod status_store;
