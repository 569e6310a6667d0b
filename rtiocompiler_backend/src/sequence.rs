//! Output of [`crate::experiment::BaseExperiment::compile`].

use ndarray::Array1;

use crate::event::RtioEvent;
use crate::lanes::LaneReport;
use crate::units::{Mu, TimeBase};

/// A compiled, immutable event list.
///
/// `events` is sorted by `(timestamp, seq)`. `duration_mu` is the stop time of the
/// sequence, i.e. the point at which a subsequent run may start.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledSequence {
    pub events: Vec<RtioEvent>,
    pub duration_mu: Mu,
    pub lane_report: LaneReport,
    pub timebase: TimeBase,
}

impl CompiledSequence {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn duration_s(&self) -> f64 {
        self.timebase.mu_to_seconds(self.duration_mu)
    }

    pub fn timestamps(&self) -> Array1<Mu> {
        self.events.iter().map(|e| e.timestamp).collect()
    }

    /// Events in the order they were submitted, which is the order the core
    /// device emits them.
    pub fn program_order(&self) -> Vec<&RtioEvent> {
        let mut events: Vec<&RtioEvent> = self.events.iter().collect();
        events.sort_by_key(|e| e.seq);
        events
    }

    pub fn events_for_device<'a>(&'a self, device: &'a str) -> impl Iterator<Item = &'a RtioEvent> + 'a {
        self.events.iter().filter(move |e| e.device == device)
    }

    pub fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for ev in &self.events {
            if !names.contains(&ev.device) {
                names.push(ev.device.clone());
            }
        }
        names
    }
}
