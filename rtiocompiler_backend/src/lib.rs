//! # RTIO timeline compiler
//!
//! Schedules hardware writes (TTL edges, DDS updates, attenuator, servo and DAC writes) on a
//! single timeline with a movable cursor, and compiles them into a time-ordered event list
//! that fits a fixed budget of output lanes.
//!
//! ## Module overview
//!
//! - [`units`]: machine units, coarse cycles and the write stagger.
//! - [`event`]: hardware [`Action`]s and scheduled [`RtioEvent`]s.
//! - [`channel`], [`device`]: edit and compile caches per channel, grouped per device.
//! - [`lanes`]: the lane distributor enforcing the output-lane budget.
//! - [`timeline`], [`dma`]: cursor, program order and recorded sequences.
//! - [`experiment`]: the [`BaseExperiment`] trait tying everything together.
//! - [`beams`], [`suservo`], [`ramp`]: controllers for beam switching, servo setpoints
//!   and precomputed ramps.
//! - [`config`]: TOML configuration of devices, controllers and timing.
//!
//! ## Example
//! ```
//! use rtiocompiler_backend::*;
//!
//! let mut exp = Experiment::default();
//! exp.add_device("ttl0", DeviceKind::Ttl, 0).unwrap();
//! exp.add_channel("ttl0", "ttl4", 0, ChannelState::default()).unwrap();
//!
//! exp.at_mu(1_000);
//! exp.pulse("ttl0", "ttl4", 500).unwrap();
//! let seq = exp.compile(None).unwrap();
//! assert_eq!(seq.timestamps().to_vec(), vec![1_000, 1_500]);
//! assert_eq!(seq.lane_report.lanes_used, 1);
//! ```

pub mod beams;
pub mod channel;
pub mod config;
pub mod device;
pub mod dma;
pub mod error;
pub mod event;
pub mod experiment;
pub mod lanes;
#[cfg(feature = "python")]
pub mod python;
pub mod ramp;
pub mod sequence;
pub mod suservo;
pub mod timeline;
pub mod units;
pub mod utils;

pub use indexmap::IndexMap;

pub use beams::*;
pub use channel::*;
pub use config::SystemConfig;
pub use device::*;
pub use dma::{DmaHandle, DmaStore};
pub use error::{Result, TimelineError};
pub use event::*;
pub use experiment::*;
pub use lanes::{LaneDistributor, LaneReport};
pub use ramp::*;
pub use sequence::CompiledSequence;
pub use suservo::*;
pub use timeline::{StaggerChain, Timeline};
pub use units::{Mu, TimeBase};
pub use utils::*;
