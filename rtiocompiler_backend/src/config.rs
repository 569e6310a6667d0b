//! System configuration.
//!
//! Configuration is loaded from the following sources, later ones overriding earlier ones:
//!
//! 1. Built-in defaults
//! 2. A TOML file (`rtio.toml` in the working directory unless a path is given)
//! 3. Environment variables (`RTIO_*`)
//!
//! ```toml
//! [timing]
//! coarse_cycle_mu = 8
//! lookbehind_s = 0.0
//!
//! [rtio]
//! lanes = 8
//!
//! [[devices]]
//! name = "ttl0"
//! kind = "ttl"
//! channels = [{ name = "ttl4", latency_s = 4e-3 }]
//!
//! [[beams]]
//! name = "mot"
//! aom = { device = "urukul0", channel = "ch0" }
//! shutter = { device = "ttl0", channel = "ttl4" }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::Path;

use crate::beams::BeamSpec;
use crate::channel::{ChannelRef, DeviceKind};
use crate::error::{Result, TimelineError};
use crate::event::ChannelState;
use crate::ramp::RampSpec;
use crate::suservo::SuServoSpec;
use crate::units::TimeBase;

pub const DEFAULT_CONFIG_PATH: &str = "rtio.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub rtio: RtioConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub beams: Vec<BeamSpec>,
    #[serde(default)]
    pub servos: Vec<SuServoSpec>,
    #[serde(default)]
    pub ramps: Vec<RampSpec>,
}

impl SystemConfig {
    /// Loads configuration from `path` (or the default location) and the environment.
    ///
    /// A missing default file is not an error; a missing explicit path is.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_toml_str(&std::fs::read_to_string(path)?)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Self::from_toml_str(&std::fs::read_to_string(path)?)?
                } else {
                    SystemConfig::default()
                }
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Some(lanes) = env_parse("RTIO_LANES") {
            self.rtio.lanes = lanes;
        }
        if let Some(depth) = env_parse("RTIO_FIFO_DEPTH") {
            self.rtio.fifo_depth = depth;
        }
        if let Some(slack) = env_parse("RTIO_INITIAL_SLACK_S") {
            self.rtio.initial_slack_s = slack;
        }
        if let Some(lookbehind) = env_parse("RTIO_LOOKBEHIND_S") {
            self.timing.lookbehind_s = lookbehind;
        }
        if let Ok(level) = env::var("RTIO_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("RTIO_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    pub fn timebase(&self) -> TimeBase {
        TimeBase::new(
            self.timing.ref_period_s,
            self.timing.coarse_cycle_mu,
            self.timing.stagger_cycles,
        )
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        let t = &self.timing;
        if !(t.ref_period_s.is_finite() && t.ref_period_s > 0.) {
            return Err(TimelineError::Config(format!(
                "reference period must be positive, got {} s",
                t.ref_period_s
            )));
        }
        if t.coarse_cycle_mu < 1 || t.stagger_cycles < 1 {
            return Err(TimelineError::Config(
                "coarse cycle and stagger must be at least 1".into(),
            ));
        }
        if t.lookbehind_s < 0. {
            return Err(TimelineError::Config("lookbehind cannot be negative".into()));
        }
        if self.rtio.lanes == 0 {
            return Err(TimelineError::Config("at least one lane is required".into()));
        }
        if self.rtio.fifo_depth == 0 {
            return Err(TimelineError::Config("lane FIFO depth cannot be 0".into()));
        }
        if self.rtio.submit_cost_s < 0. || self.rtio.initial_slack_s < 0. {
            return Err(TimelineError::Config(
                "submit cost and initial slack cannot be negative".into(),
            ));
        }
        if !["pretty", "compact", "json"].contains(&self.logging.format.as_str()) {
            return Err(TimelineError::Config(format!(
                "unknown log format {}",
                self.logging.format
            )));
        }

        let mut names = HashSet::new();
        for dev in &self.devices {
            if !names.insert(dev.name.as_str()) {
                return Err(TimelineError::DuplicateDevice(dev.name.clone()));
            }
        }
        if self.devices.iter().filter(|d| d.primary).count() > 1 {
            return Err(TimelineError::Config(
                "more than one device is marked primary".into(),
            ));
        }
        for beam in &self.beams {
            self.check_ref(&beam.aom)?;
            if let Some(shutter) = &beam.shutter {
                self.check_ref(shutter)?;
            }
        }
        for servo in &self.servos {
            self.check_ref(&servo.channel)?;
        }
        for ramp in &self.ramps {
            for param in &ramp.params {
                self.check_ref(&param.target)?;
            }
        }
        if self.logging.level.is_empty() {
            tracing::warn!("empty log level, falling back to info");
        }
        Ok(())
    }

    fn check_ref(&self, target: &ChannelRef) -> Result<()> {
        let dev = self
            .devices
            .iter()
            .find(|d| d.name == target.device)
            .ok_or_else(|| TimelineError::UnknownDevice {
                name: target.device.clone(),
                registered: self.devices.iter().map(|d| d.name.clone()).collect(),
            })?;
        if dev.channels.iter().any(|c| c.name == target.channel) {
            Ok(())
        } else {
            Err(TimelineError::UnknownChannel {
                device: target.device.clone(),
                channel: target.channel.clone(),
                registered: dev.channels.iter().map(|c| c.name.clone()).collect(),
            })
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.parse().ok())
}

/// Machine-unit time base and write bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_ref_period")]
    pub ref_period_s: f64,
    #[serde(default = "default_coarse_cycle")]
    pub coarse_cycle_mu: i64,
    /// Coarse cycles between logically simultaneous writes
    #[serde(default = "default_one")]
    pub stagger_cycles: i64,
    /// How far any write may reach behind the cursor, regardless of latency
    #[serde(default)]
    pub lookbehind_s: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            ref_period_s: default_ref_period(),
            coarse_cycle_mu: default_coarse_cycle(),
            stagger_cycles: default_one(),
            lookbehind_s: 0.,
        }
    }
}

/// Output hardware: lane budget and core device model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtioConfig {
    #[serde(default = "default_lanes")]
    pub lanes: usize,
    /// Events each lane FIFO can hold
    #[serde(default = "default_fifo_depth")]
    pub fifo_depth: usize,
    /// CPU time to submit one event
    #[serde(default = "default_submit_cost")]
    pub submit_cost_s: f64,
    /// Slack between the RTIO counter and the first event when the kernel starts
    #[serde(default = "default_initial_slack")]
    pub initial_slack_s: f64,
}

impl Default for RtioConfig {
    fn default() -> Self {
        Self {
            lanes: default_lanes(),
            fifo_depth: default_fifo_depth(),
            submit_cost_s: default_submit_cost(),
            initial_slack_s: default_initial_slack(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,
    /// pretty, compact or json
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub kind: DeviceKind,
    #[serde(default)]
    pub attenuator_latency_s: f64,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(default)]
    pub latency_s: f64,
    #[serde(default)]
    pub default: ChannelState,
}

impl ChannelConfig {
    pub fn default_state(&self) -> ChannelState {
        self.default
    }
}

fn default_ref_period() -> f64 {
    1e-9
}

fn default_coarse_cycle() -> i64 {
    8
}

fn default_one() -> i64 {
    1
}

fn default_lanes() -> usize {
    8
}

fn default_fifo_depth() -> usize {
    128
}

fn default_submit_cost() -> f64 {
    300e-9
}

fn default_initial_slack() -> f64 {
    125e-6
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}
