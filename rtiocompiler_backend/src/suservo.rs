//! Setpoint and loop control for servo-stabilised beam intensities.
//!
//! Each servo channel closes an IIR loop from a photodiode ADC to the DDS amplitude.
//! The loop needs one update cycle (the channel latency) before a new setpoint takes
//! effect, so setpoints are written that far ahead of the cursor, slowest channel first.
//! Disabling a loop first pins the DDS amplitude to a hold value so the beam does not
//! jump to whatever the integrator last produced.

use std::cmp::Reverse;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::channel::*;
use crate::device::BaseDevice;
use crate::error::{Result, TimelineError};
use crate::event::Action;
use crate::experiment::BaseExperiment;
use crate::timeline::StaggerChain;
use crate::units::Mu;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuServoSpec {
    pub name: String,
    pub channel: ChannelRef,
    #[serde(default)]
    pub default_setpoint: f64,
    #[serde(default)]
    pub default_enabled: bool,
    /// DDS amplitude held while the loop is open
    #[serde(default)]
    pub hold_amplitude: f64,
}

#[derive(Debug, Clone, Default)]
pub struct SuServoController {
    servos: IndexMap<String, SuServoSpec>,
}

impl SuServoController {
    pub fn new(specs: Vec<SuServoSpec>) -> Result<Self> {
        let mut servos = IndexMap::new();
        for spec in specs {
            if servos.contains_key(&spec.name) {
                return Err(TimelineError::Config(format!(
                    "servo {} defined twice",
                    spec.name
                )));
            }
            servos.insert(spec.name.clone(), spec);
        }
        Ok(Self { servos })
    }

    pub fn servo(&self, name: &str) -> Result<&SuServoSpec> {
        self.servos
            .get(name)
            .ok_or_else(|| TimelineError::UnknownServo(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.servos.keys().cloned().collect()
    }

    fn latency<E: BaseExperiment>(&self, exp: &E, servo: &SuServoSpec) -> Result<Mu> {
        let ch = &servo.channel;
        Ok(exp.dev(&ch.device)?.chan(&ch.channel)?.latency_mu())
    }

    /// Writes setpoints so that each one takes effect at the cursor.
    ///
    /// The cursor ends one stagger after the last write, or stays put if every write lies
    /// before it.
    pub fn set_setpoints<E: BaseExperiment>(&self, exp: &mut E, setpoints: &[(&str, f64)]) -> Result<()> {
        let mut targets = Vec::with_capacity(setpoints.len());
        for &(name, value) in setpoints {
            let servo = self.servo(name)?;
            targets.push((self.latency(exp, servo)?, servo, value));
        }
        targets.sort_by_key(|(latency, _, _)| Reverse(*latency));
        let t = exp.now_mu();
        let mut chain = StaggerChain::new(exp.timebase().stagger_mu());
        for (latency, servo, value) in &targets {
            let ch = &servo.channel;
            let ts = chain.next(t - latency);
            exp.write_at(&ch.device, &ch.channel, ts, Action::ServoSetpoint(*value))?;
        }
        exp.at_mu(chain.end(t).max(t));
        Ok(())
    }

    /// Closes the loops, staggered from the cursor.
    pub fn enable<E: BaseExperiment>(&self, exp: &mut E, names: &[&str]) -> Result<()> {
        let servos = names
            .iter()
            .map(|name| self.servo(name))
            .collect::<Result<Vec<_>>>()?;
        let t = exp.now_mu();
        let mut chain = StaggerChain::new(exp.timebase().stagger_mu());
        for servo in servos {
            let ch = &servo.channel;
            exp.write_at(&ch.device, &ch.channel, chain.next(t), Action::ServoEnable(true))?;
        }
        exp.at_mu(chain.end(t));
        Ok(())
    }

    /// Opens the loops. Each DDS amplitude is pinned to the hold value first.
    pub fn disable<E: BaseExperiment>(&self, exp: &mut E, names: &[&str]) -> Result<()> {
        let servos = names
            .iter()
            .map(|name| self.servo(name))
            .collect::<Result<Vec<_>>>()?;
        let t = exp.now_mu();
        let mut chain = StaggerChain::new(exp.timebase().stagger_mu());
        for servo in servos {
            let ch = &servo.channel;
            let hold = Action::DdsAmplitude(servo.hold_amplitude);
            exp.write_at(&ch.device, &ch.channel, chain.next(t), hold)?;
            exp.write_at(&ch.device, &ch.channel, chain.next(t), Action::ServoEnable(false))?;
        }
        exp.at_mu(chain.end(t));
        Ok(())
    }

    /// Restores setpoints, hold amplitudes and loop states of every servo.
    pub fn set_defaults<E: BaseExperiment>(&self, exp: &mut E) -> Result<()> {
        let setpoints: Vec<(&str, f64)> = self
            .servos
            .values()
            .map(|s| (s.name.as_str(), s.default_setpoint))
            .collect();
        self.set_setpoints(exp, &setpoints)?;

        let t = exp.now_mu();
        let mut chain = StaggerChain::new(exp.timebase().stagger_mu());
        for servo in self.servos.values() {
            let ch = &servo.channel;
            let hold = Action::DdsAmplitude(servo.hold_amplitude);
            exp.write_at(&ch.device, &ch.channel, chain.next(t), hold)?;
            let state = Action::ServoEnable(servo.default_enabled);
            exp.write_at(&ch.device, &ch.channel, chain.next(t), state)?;
        }
        exp.at_mu(chain.end(t));
        tracing::debug!(servos = self.servos.len(), at = t, "servos set to defaults");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::ChannelState;
    use crate::experiment::Experiment;

    fn setup() -> (Experiment, SuServoController) {
        let mut exp = Experiment::default();
        exp.add_device("suservo0", DeviceKind::SuServo, 0).unwrap();
        exp.add_channel("suservo0", "ch0", 1_200, ChannelState::default()).unwrap();
        exp.add_channel("suservo0", "ch1", 3_000, ChannelState::default()).unwrap();
        let servos = SuServoController::new(vec![
            SuServoSpec {
                name: "odt".to_string(),
                channel: ChannelRef::new("suservo0", "ch0"),
                default_setpoint: 1.5,
                default_enabled: true,
                hold_amplitude: 0.2,
            },
            SuServoSpec {
                name: "lattice".to_string(),
                channel: ChannelRef::new("suservo0", "ch1"),
                default_setpoint: 0.5,
                default_enabled: false,
                hold_amplitude: 0.0,
            },
        ])
        .unwrap();
        (exp, servos)
    }

    #[test]
    fn setpoints_land_on_the_cursor() {
        let (mut exp, servos) = setup();
        exp.at_mu(10_000);
        servos
            .set_setpoints(&mut exp, &[("odt", 2.0), ("lattice", 1.0)])
            .unwrap();
        // slowest channel first, both ahead of the cursor
        let seq = exp.compile(None).unwrap();
        let stamps: Vec<(Mu, String)> = seq
            .program_order()
            .iter()
            .map(|e| (e.timestamp, e.channel.clone()))
            .collect();
        assert_eq!(stamps, vec![(7_000, "ch1".to_string()), (8_800, "ch0".to_string())]);
        assert_eq!(exp.now_mu(), 10_000);
        assert_eq!(exp.channel_state_at("suservo0", "ch0", 10_000).unwrap().setpoint, 2.0);
    }

    #[test]
    fn disable_pins_amplitude_first() {
        let (mut exp, servos) = setup();
        exp.at_mu(5_000);
        servos.enable(&mut exp, &["odt"]).unwrap();
        assert_eq!(exp.now_mu(), 5_008);
        servos.disable(&mut exp, &["odt"]).unwrap();
        assert_eq!(exp.now_mu(), 5_024);
        let state = exp.channel_state_at("suservo0", "ch0", 5_024).unwrap();
        assert!(!state.enabled);
        assert_eq!(state.amplitude, 0.2);
        let seq = exp.compile(None).unwrap();
        let actions: Vec<Action> = seq.events.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![
                Action::ServoEnable(true),
                Action::DdsAmplitude(0.2),
                Action::ServoEnable(false)
            ]
        );
    }

    #[test]
    fn unknown_servo_writes_nothing() {
        let (mut exp, servos) = setup();
        exp.at_mu(5_000);
        assert!(matches!(
            servos.set_setpoints(&mut exp, &[("odt", 1.0), ("mot", 1.0)]),
            Err(TimelineError::UnknownServo(_))
        ));
        assert!(servos.disable(&mut exp, &["mot"]).is_err());
        assert!(!exp.is_edited());
    }

    #[test]
    fn defaults_restore_every_servo() {
        let (mut exp, servos) = setup();
        exp.at_mu(20_000);
        servos.set_defaults(&mut exp).unwrap();
        let end = exp.now_mu();
        let odt = exp.channel_state_at("suservo0", "ch0", end).unwrap();
        assert!(odt.enabled);
        assert_eq!(odt.setpoint, 1.5);
        let lattice = exp.channel_state_at("suservo0", "ch1", end).unwrap();
        assert!(!lattice.enabled);
        assert_eq!(lattice.setpoint, 0.5);
        assert_eq!(exp.timeline().lanes().report().lanes_used, 1);
    }
}
