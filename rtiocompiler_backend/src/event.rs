//! Hardware actions and the timeline events that carry them.
//!
//! ## Main Structures:
//!
//! - [`Action`]: the payload of a single hardware write (TTL edge, DDS update,
//!   attenuator write, servo update, DAC write). Actions validate their own value
//!   ranges and know which [`DeviceKind`]s can execute them.
//! - [`ChannelState`]: the output state of a channel obtained by applying
//!   actions on top of a default state.
//! - [`RtioEvent`]: an action bound to a channel and an absolute timestamp,
//!   together with its program-order sequence number and assigned lane.
//!   Events order by `(timestamp, seq)`.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::channel::DeviceKind;
use crate::error::{Result, TimelineError};
use crate::units::Mu;

pub const MAX_ATTENUATION_DB: f64 = 31.5;
pub const MAX_DDS_FREQUENCY_HZ: f64 = 400e6;
pub const MAX_DAC_VOLTAGE: f64 = 10.0;

/// A single hardware write.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Action {
    TtlOn,
    TtlOff,
    /// RF switch of a DDS channel
    DdsSwitch(bool),
    DdsFrequency(f64),
    /// Amplitude scale factor in `0..=1`
    DdsAmplitude(f64),
    /// Digital step attenuator in dB
    Attenuation(f64),
    /// Servo loop (IIR) on/off
    ServoEnable(bool),
    /// Servo setpoint in volts at the photodiode ADC
    ServoSetpoint(f64),
    DacVoltage(f64),
}

impl Action {
    /// Checks the value range of the action.
    pub fn validate(&self) -> Result<()> {
        let check = |what, value: f64, min: f64, max: f64| {
            if value.is_finite() && (min..=max).contains(&value) {
                Ok(())
            } else {
                Err(TimelineError::InvalidValue {
                    what,
                    value,
                    min,
                    max,
                })
            }
        };
        match *self {
            Action::DdsFrequency(f) => check("DDS frequency", f, 0.0, MAX_DDS_FREQUENCY_HZ),
            Action::DdsAmplitude(a) => check("DDS amplitude", a, 0.0, 1.0),
            Action::Attenuation(db) => check("attenuation", db, 0.0, MAX_ATTENUATION_DB),
            Action::ServoSetpoint(v) => check("servo setpoint", v, -MAX_DAC_VOLTAGE, MAX_DAC_VOLTAGE),
            Action::DacVoltage(v) => check("DAC voltage", v, -MAX_DAC_VOLTAGE, MAX_DAC_VOLTAGE),
            Action::TtlOn | Action::TtlOff | Action::DdsSwitch(_) | Action::ServoEnable(_) => Ok(()),
        }
    }

    /// Whether a device of the given kind can execute this action.
    pub fn accepted_by(&self, kind: DeviceKind) -> bool {
        match self {
            Action::TtlOn | Action::TtlOff => kind == DeviceKind::Ttl,
            Action::DdsSwitch(_)
            | Action::DdsFrequency(_)
            | Action::DdsAmplitude(_)
            | Action::Attenuation(_) => matches!(kind, DeviceKind::Urukul | DeviceKind::SuServo),
            Action::ServoEnable(_) | Action::ServoSetpoint(_) => kind == DeviceKind::SuServo,
            Action::DacVoltage(_) => kind == DeviceKind::Zotino,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Action::TtlOn => write!(f, "TTL_ON"),
            Action::TtlOff => write!(f, "TTL_OFF"),
            Action::DdsSwitch(on) => write!(f, "DDS_SWITCH({on})"),
            Action::DdsFrequency(hz) => write!(f, "DDS_FREQ({hz} Hz)"),
            Action::DdsAmplitude(a) => write!(f, "DDS_AMP({a})"),
            Action::Attenuation(db) => write!(f, "ATT({db} dB)"),
            Action::ServoEnable(on) => write!(f, "SERVO_EN({on})"),
            Action::ServoSetpoint(v) => write!(f, "SERVO_SET({v} V)"),
            Action::DacVoltage(v) => write!(f, "DAC({v} V)"),
        }
    }
}

/// Output state of one channel.
///
/// `enabled` is the TTL level for TTL channels, the RF switch for DDS channels
/// and the servo loop state for servo channels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelState {
    pub enabled: bool,
    pub rf_on: bool,
    pub frequency_hz: f64,
    pub amplitude: f64,
    pub attenuation_db: f64,
    pub setpoint: f64,
    pub voltage: f64,
}

impl ChannelState {
    pub fn apply(&mut self, action: &Action) {
        match *action {
            Action::TtlOn => self.enabled = true,
            Action::TtlOff => self.enabled = false,
            Action::DdsSwitch(on) => self.rf_on = on,
            Action::DdsFrequency(hz) => self.frequency_hz = hz,
            Action::DdsAmplitude(a) => self.amplitude = a,
            Action::Attenuation(db) => self.attenuation_db = db,
            Action::ServoEnable(on) => self.enabled = on,
            Action::ServoSetpoint(v) => self.setpoint = v,
            Action::DacVoltage(v) => self.voltage = v,
        }
    }

    /// Scalar output used when sampling a channel.
    ///
    /// TTL: level. DDS: amplitude while the RF switch is on. Servo: setpoint while
    /// the loop is enabled, otherwise the held amplitude while RF is on. DAC: voltage.
    pub fn output(&self, kind: DeviceKind) -> f64 {
        match kind {
            DeviceKind::Ttl => f64::from(u8::from(self.enabled)),
            DeviceKind::Urukul => {
                if self.rf_on {
                    self.amplitude
                } else {
                    0.
                }
            }
            DeviceKind::SuServo => match (self.enabled, self.rf_on) {
                (true, _) => self.setpoint,
                (false, true) => self.amplitude,
                (false, false) => 0.,
            },
            DeviceKind::Zotino => self.voltage,
        }
    }
}

/// An action scheduled on a channel at an absolute timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtioEvent {
    pub timestamp: Mu,
    pub device: String,
    pub channel: String,
    pub action: Action,
    /// Program-order submission index
    pub seq: u64,
    /// Lane assigned by the lane distributor
    pub lane: usize,
}

impl RtioEvent {
    pub fn target(&self) -> String {
        format!("{}/{}", self.device, self.channel)
    }

    /// Ordering by timestamp, program order breaking ties.
    pub fn time_order(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.seq.cmp(&other.seq))
    }
}

impl fmt::Display for RtioEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RtioEvent({} @ {} mu on {}/{}, seq {}, lane {})",
            self.action, self.timestamp, self.device, self.channel, self.seq, self.lane
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn validate_ranges() {
        assert!(Action::DdsAmplitude(0.5).validate().is_ok());
        assert!(Action::DdsAmplitude(1.5).validate().is_err());
        assert!(Action::Attenuation(31.5).validate().is_ok());
        assert!(Action::Attenuation(32.0).validate().is_err());
        assert!(Action::DacVoltage(f64::NAN).validate().is_err());
        assert!(Action::TtlOn.validate().is_ok());
    }

    #[test]
    fn accepted_by_kind() {
        assert!(Action::TtlOn.accepted_by(DeviceKind::Ttl));
        assert!(!Action::TtlOn.accepted_by(DeviceKind::Urukul));
        assert!(Action::DdsAmplitude(0.1).accepted_by(DeviceKind::SuServo));
        assert!(!Action::ServoEnable(true).accepted_by(DeviceKind::Urukul));
        assert!(Action::DacVoltage(1.0).accepted_by(DeviceKind::Zotino));
    }

    #[test]
    fn dds_output_follows_switch() {
        let mut state = ChannelState::default();
        state.apply(&Action::DdsAmplitude(0.8));
        assert_eq!(state.output(DeviceKind::Urukul), 0.);
        state.apply(&Action::DdsSwitch(true));
        assert_eq!(state.output(DeviceKind::Urukul), 0.8);
    }
}
