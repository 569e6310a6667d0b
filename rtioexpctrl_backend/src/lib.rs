//! # RTIO sequence execution
//!
//! Builds on [`rtiocompiler_backend`]: compiled sequences are checked against a model of the
//! core device ([`core_device`]) and streamed per device to [`device::OutputSink`]s, either
//! one-shot or through long-lived workers ([`experiment`]).

pub mod core_device;
pub mod device;
pub mod error;
pub mod experiment;
pub mod logging;
pub mod utils;
pub mod worker_cmd_chan;

pub use crate::core_device::{CoreDevice, RunReport};
pub use crate::device::{LogSink, MemorySink, OutputSink, StreamableDevice};
pub use crate::error::{Result, RunError};
pub use crate::experiment::{Experiment, StreamWorkers};
pub use crate::logging::init_logging;
