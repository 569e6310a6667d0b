//! Error type shared by every scheduling operation.
//!
//! All editing, recording and compiling entry points return [`Result`]. A
//! returned error always means the timeline was left exactly as it was
//! before the failing call.

use thiserror::Error;

use crate::channel::DeviceKind;
use crate::units::Mu;

/// Result type alias for timeline operations.
pub type Result<T> = std::result::Result<T, TimelineError>;

/// Errors raised while building or compiling a timeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TimelineError {
    /// Device not registered in the experiment
    #[error("There is no device {name} registered. Registered devices are {registered:?}")]
    UnknownDevice { name: String, registered: Vec<String> },

    /// Channel not registered on the device
    #[error("Channel {channel} not found in device {device}. Registered channels are {registered:?}")]
    UnknownChannel {
        device: String,
        channel: String,
        registered: Vec<String>,
    },

    /// Device name used twice
    #[error("Device {0} already registered")]
    DuplicateDevice(String),

    /// Channel name used twice on one device
    #[error("Channel {channel} already registered on device {device}")]
    DuplicateChannel { device: String, channel: String },

    /// Channel name does not follow the device's naming convention
    #[error("Expecting channels of device {device} to be of format '{expected}' yet received channel name {channel}")]
    InvalidChannelName {
        device: String,
        channel: String,
        expected: String,
    },

    /// Device-level operation addressed to a device of another kind
    #[error("Device {device} is a {actual} device, expected {expected}")]
    WrongDeviceKind {
        device: String,
        expected: DeviceKind,
        actual: DeviceKind,
    },

    /// Action cannot be executed by the target device
    #[error("Channel {device}/{channel} is incompatible with action {action}")]
    IncompatibleAction {
        device: String,
        channel: String,
        action: String,
    },

    /// Action carries a value outside the hardware range
    #[error("Invalid value for {what}: {value} (allowed range {min}..={max})")]
    InvalidValue {
        what: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    /// Event placed before the start of the timeline
    #[error("Event on {device}/{channel} at {timestamp} mu lies before the timeline origin")]
    NegativeTimestamp {
        device: String,
        channel: String,
        timestamp: Mu,
    },

    /// Event placed further in the past than the channel allows
    #[error("Event on {device}/{channel} at {timestamp} mu is more than {limit} mu behind the cursor at {now} mu")]
    PastLimit {
        device: String,
        channel: String,
        timestamp: Mu,
        now: Mu,
        limit: Mu,
    },

    /// Two different events in the same coarse cycle on one channel
    #[error("Collision on {device}/{channel}: event at {timestamp} mu shares coarse cycle with existing event at {existing} mu")]
    Collision {
        device: String,
        channel: String,
        timestamp: Mu,
        existing: Mu,
    },

    /// No lane can take the event without reordering
    #[error("All {lanes} lanes exhausted: event at {timestamp} mu (coarse {coarse}) is not later than the last event of lane {lane}")]
    LanesExhausted {
        timestamp: Mu,
        coarse: Mu,
        lane: usize,
        lanes: usize,
    },

    /// Compile asked to stop before the last scheduled event
    #[error("Attempted to compile with stop_time={stop} mu while the last event is at {last} mu")]
    StopBeforeLastEvent { stop: Mu, last: Mu },

    /// `record` called while another recording is open
    #[error("Cannot record {name}: recording {active} is still open")]
    RecordingInProgress { name: String, active: String },

    /// Capture or finish without an open recording
    #[error("No recording is open")]
    NotRecording,

    /// No recording of the given name
    #[error("There is no recording named {0}")]
    UnknownRecording(String),

    /// Handle refers to an overwritten recording
    #[error("Handle for recording {name} is stale (handle epoch {handle}, current epoch {current})")]
    StaleHandle {
        name: String,
        handle: u64,
        current: u64,
    },

    /// Ramp step too short for its staggered writes
    #[error("Ramp {name}: step interval {step} mu cannot fit {writes} staggered writes of {stagger} mu")]
    RampTooDense {
        name: String,
        step: Mu,
        writes: usize,
        stagger: Mu,
    },

    /// Beam not defined
    #[error("There is no beam named {0}")]
    UnknownBeam(String),

    /// Servo not defined
    #[error("There is no servo named {0}")]
    UnknownServo(String),

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<toml::de::Error> for TimelineError {
    fn from(e: toml::de::Error) -> Self {
        TimelineError::Config(e.to_string())
    }
}

impl From<std::io::Error> for TimelineError {
    fn from(e: std::io::Error) -> Self {
        TimelineError::Config(format!("I/O error: {e}"))
    }
}
