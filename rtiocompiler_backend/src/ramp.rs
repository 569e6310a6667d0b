//! Multi-parameter ramps, recorded once and replayed.
//!
//! A ramp moves several quantities (DDS amplitudes and frequencies, DAC voltages,
//! servo setpoints) linearly from their start to their end value in `steps` equal
//! steps. The value table is computed once with `ndarray`; scheduling it produces
//! `(steps + 1) * params` writes, which is why a [`RampingPhase`] records itself into
//! the DMA store on first use and afterwards only replays the recording.

use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelRef;
use crate::dma::DmaHandle;
use crate::error::{Result, TimelineError};
use crate::event::Action;
use crate::experiment::BaseExperiment;
use crate::units::{Mu, TimeBase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RampQuantity {
    DdsAmplitude,
    DdsFrequency,
    DacVoltage,
    ServoSetpoint,
}

impl RampQuantity {
    pub fn action(&self, value: f64) -> Action {
        match self {
            RampQuantity::DdsAmplitude => Action::DdsAmplitude(value),
            RampQuantity::DdsFrequency => Action::DdsFrequency(value),
            RampQuantity::DacVoltage => Action::DacVoltage(value),
            RampQuantity::ServoSetpoint => Action::ServoSetpoint(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RampParam {
    pub target: ChannelRef,
    pub quantity: RampQuantity,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RampSpec {
    pub name: String,
    pub duration_s: f64,
    pub steps: usize,
    pub params: Vec<RampParam>,
}

pub struct RampingPhase {
    spec: RampSpec,
    /// `steps + 1` rows, one column per parameter
    table: Array2<f64>,
    handle: Option<DmaHandle>,
}

impl RampingPhase {
    pub fn new(spec: RampSpec) -> Result<Self> {
        if spec.steps == 0 {
            return Err(TimelineError::Config(format!(
                "ramp {} needs at least one step",
                spec.name
            )));
        }
        if !(spec.duration_s.is_finite() && spec.duration_s > 0.) {
            return Err(TimelineError::Config(format!(
                "ramp {} has invalid duration {} s",
                spec.name, spec.duration_s
            )));
        }
        let mut table = Array2::zeros((spec.steps + 1, spec.params.len()));
        for (j, param) in spec.params.iter().enumerate() {
            table
                .slice_mut(s![.., j])
                .assign(&Array1::linspace(param.start, param.end, spec.steps + 1));
        }
        Ok(Self {
            spec,
            table,
            handle: None,
        })
    }

    pub fn spec(&self) -> &RampSpec {
        &self.spec
    }

    pub fn table(&self) -> &Array2<f64> {
        &self.table
    }

    pub fn handle(&self) -> Option<&DmaHandle> {
        self.handle.as_ref()
    }

    /// Step interval, checked against the staggered writes it has to hold.
    pub fn step_mu(&self, timebase: &TimeBase) -> Result<Mu> {
        let step = timebase.seconds_to_mu(self.spec.duration_s) / self.spec.steps as Mu;
        let writes = self.spec.params.len();
        let stagger = timebase.stagger_mu();
        if step < writes as Mu * stagger {
            return Err(TimelineError::RampTooDense {
                name: self.spec.name.clone(),
                step,
                writes,
                stagger,
            });
        }
        Ok(step)
    }

    /// Writes the whole ramp from the cursor, one row of the table per step.
    ///
    /// The cursor ends after the last step plus its write stagger.
    pub fn schedule<E: BaseExperiment>(&self, exp: &mut E) -> Result<()> {
        let timebase = exp.timebase();
        let step = self.step_mu(&timebase)?;
        let stagger = timebase.stagger_mu();
        let start = exp.now_mu();
        for (i, row) in self.table.outer_iter().enumerate() {
            let t = start + i as Mu * step;
            for (j, (param, &value)) in self.spec.params.iter().zip(row.iter()).enumerate() {
                let ts = t + j as Mu * stagger;
                let target = &param.target;
                exp.write_at(&target.device, &target.channel, ts, param.quantity.action(value))?;
            }
        }
        exp.at_mu(start + self.spec.steps as Mu * step + self.spec.params.len() as Mu * stagger);
        Ok(())
    }

    /// Records the ramp into the DMA store under its name.
    pub fn prepare<E: BaseExperiment>(&mut self, exp: &mut E) -> Result<DmaHandle> {
        let handle = exp.record(&self.spec.name, |e| self.schedule(e))?;
        tracing::info!(
            ramp = %self.spec.name,
            events = handle.n_events,
            duration_mu = handle.duration_mu,
            "ramp recorded"
        );
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Replays the ramp at the cursor, recording it first if there is no valid recording.
    pub fn run<E: BaseExperiment>(&mut self, exp: &mut E) -> Result<()> {
        let current = match &self.handle {
            Some(handle) => exp
                .get_handle(&handle.name)
                .ok()
                .filter(|latest| latest.epoch == handle.epoch),
            None => None,
        };
        let handle = match current {
            Some(handle) => handle,
            None => self.prepare(exp)?,
        };
        exp.playback_handle(&handle)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::DeviceKind;
    use crate::event::ChannelState;
    use crate::experiment::Experiment;

    fn setup() -> Experiment {
        let mut exp = Experiment::default();
        exp.add_device("urukul0", DeviceKind::Urukul, 0).unwrap();
        exp.add_channel("urukul0", "ch0", 0, ChannelState::default()).unwrap();
        exp.add_device("zotino0", DeviceKind::Zotino, 0).unwrap();
        exp.add_channel("zotino0", "dac3", 0, ChannelState::default()).unwrap();
        exp
    }

    fn spec(duration_s: f64, steps: usize) -> RampSpec {
        RampSpec {
            name: "evap".to_string(),
            duration_s,
            steps,
            params: vec![
                RampParam {
                    target: ChannelRef::new("urukul0", "ch0"),
                    quantity: RampQuantity::DdsAmplitude,
                    start: 1.0,
                    end: 0.2,
                },
                RampParam {
                    target: ChannelRef::new("zotino0", "dac3"),
                    quantity: RampQuantity::DacVoltage,
                    start: 0.0,
                    end: 4.0,
                },
            ],
        }
    }

    #[test]
    fn value_table() {
        let ramp = RampingPhase::new(spec(1e-6, 4)).unwrap();
        assert_eq!(ramp.table().dim(), (5, 2));
        assert_eq!(ramp.table().column(1).to_vec(), vec![0., 1., 2., 3., 4.]);
        assert!((ramp.table()[[4, 0]] - 0.2).abs() < 1e-12);
    }

    #[test]
    fn too_dense_ramp_is_refused() {
        let ramp = RampingPhase::new(spec(40e-9, 4)).unwrap();
        let mut exp = setup();
        // 10 mu steps cannot hold two writes 8 mu apart
        assert!(matches!(
            ramp.schedule(&mut exp),
            Err(TimelineError::RampTooDense { step: 10, writes: 2, .. })
        ));
        assert!(!exp.is_edited());
        assert!(RampingPhase::new(spec(1e-6, 0)).is_err());
    }

    #[test]
    fn run_records_once() {
        let mut ramp = RampingPhase::new(spec(1e-6, 4)).unwrap();
        let mut exp = setup();
        exp.at_mu(1_000);
        ramp.run(&mut exp).unwrap();
        let first = ramp.handle().cloned().unwrap();
        assert_eq!(first.n_events, 10);
        assert_eq!(first.duration_mu, 1_016);
        assert_eq!(exp.now_mu(), 2_016);

        ramp.run(&mut exp).unwrap();
        assert_eq!(ramp.handle(), Some(&first));
        assert_eq!(exp.now_mu(), 3_032);

        let seq = exp.compile(None).unwrap();
        assert_eq!(seq.len(), 20);
        assert_eq!(seq.lane_report.lanes_used, 1);
        let dac = exp.channel_state_at("zotino0", "dac3", 3_032).unwrap();
        assert_eq!(dac.voltage, 4.0);
    }

    #[test]
    fn stale_recording_is_rerecorded() {
        let mut ramp = RampingPhase::new(spec(1e-6, 2)).unwrap();
        let mut exp = setup();
        let first = ramp.prepare(&mut exp).unwrap();
        // someone else records under the same name
        exp.record("evap", |e| e.set_dac("zotino0", "dac3", 1.0)).unwrap();
        ramp.run(&mut exp).unwrap();
        let second = ramp.handle().cloned().unwrap();
        assert!(second.epoch > first.epoch);
        assert_eq!(second.n_events, 6);
    }
}
