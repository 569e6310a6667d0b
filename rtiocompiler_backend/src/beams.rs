//! Switching groups of laser beams, each made of an AOM (DDS channel) and an optional
//! mechanical shutter (TTL channel).
//!
//! A shutter takes its channel latency to move, so it must be commanded ahead of the
//! moment the light should appear. [`BeamController::turn_on`] therefore works in two
//! phases around the cursor `T`:
//!
//! 1. every shutter is opened at `T - latency`, slowest shutter first. Beams kept hot
//!    (RF running while the shutter is closed) get their RF switched off right after, in
//!    a cursor excursion to the same point, so no light leaks through the opening shutter;
//! 2. every AOM is switched on from `T`.
//!
//! [`BeamController::turn_off`] is the mirror image: AOMs off and shutters closed at `T`,
//! fastest shutter first, and hot beams get their RF back on once their shutter has
//! closed at `T + latency`.
//!
//! All writes of one call form a [`StaggerChain`], so their timestamps increase by at
//! least one coarse cycle and the group never needs more than one lane.

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

/// Idle state of a beam.
///
/// `keep_hot` leaves the RF running while the beam is off so that the amplifier stays
/// thermally settled; the shutter keeps the light blocked.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeamDefaults {
    pub frequency_hz: f64,
    pub amplitude: f64,
    pub attenuation_db: f64,
    pub enabled: bool,
    pub keep_hot: bool,
}

impl Default for BeamDefaults {
    fn default() -> Self {
        Self {
            frequency_hz: 80e6,
            amplitude: 0.0,
            attenuation_db: 0.0,
            enabled: false,
            keep_hot: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamSpec {
    pub name: String,
    pub aom: ChannelRef,
    #[serde(default)]
    pub shutter: Option<ChannelRef>,
    #[serde(default)]
    pub defaults: BeamDefaults,
}

impl BeamSpec {
    /// RF stays on behind a closed shutter. Without a shutter there is nothing to keep hot behind.
    pub fn is_hot(&self) -> bool {
        self.defaults.keep_hot && self.shutter.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BeamController {
    beams: IndexMap<String, BeamSpec>,
}

impl BeamController {
    pub fn new(specs: Vec<BeamSpec>) -> Result<Self> {
        let mut beams = IndexMap::new();
        for spec in specs {
            if beams.contains_key(&spec.name) {
                return Err(TimelineError::Config(format!(
                    "beam {} defined twice",
                    spec.name
                )));
            }
            beams.insert(spec.name.clone(), spec);
        }
        Ok(Self { beams })
    }

    pub fn beam(&self, name: &str) -> Result<&BeamSpec> {
        self.beams
            .get(name)
            .ok_or_else(|| TimelineError::UnknownBeam(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.beams.keys().cloned().collect()
    }

    /// Shutter latency of a beam, zero without a shutter.
    pub fn shutter_latency<E: BaseExperiment>(&self, exp: &E, beam: &BeamSpec) -> Result<Mu> {
        match &beam.shutter {
            Some(shutter) => Ok(exp.dev(&shutter.device)?.chan(&shutter.channel)?.latency_mu()),
            None => Ok(0),
        }
    }

    /// Resolves `names` into beams with their shutter latencies, failing before any write.
    fn resolve<E: BaseExperiment>(&self, exp: &E, names: &[&str]) -> Result<Vec<(Mu, &BeamSpec)>> {
        names
            .iter()
            .map(|name| {
                let beam = self.beam(name)?;
                Ok((self.shutter_latency(exp, beam)?, beam))
            })
            .collect()
    }

    /// Turns the beams on so that light is present from the cursor on.
    ///
    /// The cursor ends one stagger after the last AOM write.
    pub fn turn_on<E: BaseExperiment>(&self, exp: &mut E, names: &[&str]) -> Result<()> {
        let mut beams = self.resolve(exp, names)?;
        beams.sort_by_key(|(latency, _)| Reverse(*latency));
        let t = exp.now_mu();
        let mut chain = StaggerChain::new(exp.timebase().stagger_mu());

        for (latency, beam) in &beams {
            let Some(shutter) = &beam.shutter else {
                continue;
            };
            let ts = chain.next(t - latency);
            exp.write_at(&shutter.device, &shutter.channel, ts, Action::TtlOn)?;
            if beam.is_hot() {
                // the AOM has no latency to write ahead with; travel there instead
                let ts = chain.next(t - latency);
                exp.write_excursion(&beam.aom.device, &beam.aom.channel, ts, Action::DdsSwitch(false))?;
            }
        }
        for (_, beam) in &beams {
            let ts = chain.next(t);
            exp.write_at(&beam.aom.device, &beam.aom.channel, ts, Action::DdsSwitch(true))?;
        }
        exp.at_mu(chain.end(t));
        tracing::debug!(beams = ?names, at = t, "beams on");
        Ok(())
    }

    /// Turns the beams off at the cursor.
    ///
    /// The cursor ends one stagger after the last immediate write; the RF-on writes of hot
    /// beams stay ahead of it.
    pub fn turn_off<E: BaseExperiment>(&self, exp: &mut E, names: &[&str]) -> Result<()> {
        let mut beams = self.resolve(exp, names)?;
        beams.sort_by_key(|(latency, _)| *latency);
        let t = exp.now_mu();
        let mut chain = StaggerChain::new(exp.timebase().stagger_mu());

        for (_, beam) in &beams {
            let ts = chain.next(t);
            exp.write_at(&beam.aom.device, &beam.aom.channel, ts, Action::DdsSwitch(false))?;
            if let Some(shutter) = &beam.shutter {
                let ts = chain.next(t);
                exp.write_at(&shutter.device, &shutter.channel, ts, Action::TtlOff)?;
            }
        }
        let end = chain.end(t);
        for (latency, beam) in beams.iter().filter(|(_, beam)| beam.is_hot()) {
            let ts = chain.next(t + latency);
            exp.write_at(&beam.aom.device, &beam.aom.channel, ts, Action::DdsSwitch(true))?;
        }
        exp.at_mu(end);
        tracing::debug!(beams = ?names, at = t, "beams off");
        Ok(())
    }

    /// Puts every beam into its default state. Calling it twice at the same cursor
    /// produces the same events.
    ///
    /// Attenuators are written one attenuator latency ahead of the cursor, everything
    /// else from the cursor on. The cursor ends one stagger after the last write.
    pub fn set_to_defaults<E: BaseExperiment>(&self, exp: &mut E) -> Result<()> {
        let t = exp.now_mu();
        let mut chain = StaggerChain::new(exp.timebase().stagger_mu());

        let mut attenuators = Vec::with_capacity(self.beams.len());
        for beam in self.beams.values() {
            let latency = exp
                .dev(&beam.aom.device)?
                .effective_latency(&beam.aom.channel, &Action::Attenuation(0.))?;
            attenuators.push((latency, beam));
        }
        attenuators.sort_by_key(|(latency, _)| Reverse(*latency));
        for (latency, beam) in &attenuators {
            let ts = chain.next(t - latency);
            let action = Action::Attenuation(beam.defaults.attenuation_db);
            exp.write_at(&beam.aom.device, &beam.aom.channel, ts, action)?;
        }

        for beam in self.beams.values() {
            let d = &beam.defaults;
            let aom = &beam.aom;
            for action in [
                Action::DdsFrequency(d.frequency_hz),
                Action::DdsAmplitude(d.amplitude),
                Action::DdsSwitch(d.enabled || beam.is_hot()),
            ] {
                let ts = chain.next(t);
                exp.write_at(&aom.device, &aom.channel, ts, action)?;
            }
            if let Some(shutter) = &beam.shutter {
                let action = if d.enabled { Action::TtlOn } else { Action::TtlOff };
                let ts = chain.next(t);
                exp.write_at(&shutter.device, &shutter.channel, ts, action)?;
            }
        }
        exp.at_mu(chain.end(t));
        tracing::debug!(beams = self.beams.len(), at = t, "beams set to defaults");
        Ok(())
    }
}
