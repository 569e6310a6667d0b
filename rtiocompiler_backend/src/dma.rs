//! Recorded sequences: compile once, replay many times.
//!
//! Sequences that are replayed many times (ramps, repeated pulse trains) are
//! scheduled once while recording. Writes made during a recording are captured
//! with timestamps relative to the cursor at record start instead of being
//! committed to the timeline. Playback then only shifts the recorded events to the
//! current cursor, which skips the per-write bookkeeping of the controllers that
//! produced them.
//!
//! Recordings are addressed by name. Re-recording a name bumps its epoch, so
//! handles obtained earlier become stale and are refused on playback.

use indexmap::IndexMap;

use crate::error::{Result, TimelineError};
use crate::event::Action;
use crate::units::Mu;

/// One captured write, relative to the recording start.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub offset_mu: Mu,
    pub device: String,
    pub channel: String,
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DmaTrace {
    pub events: Vec<RecordedEvent>,
    pub duration_mu: Mu,
    pub epoch: u64,
}

/// Reference to a recording at a given epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct DmaHandle {
    pub name: String,
    pub epoch: u64,
    pub duration_mu: Mu,
    pub n_events: usize,
}

#[derive(Debug)]
struct Recorder {
    name: String,
    start_mu: Mu,
    events: Vec<RecordedEvent>,
}

#[derive(Debug, Default)]
pub struct DmaStore {
    traces: IndexMap<String, DmaTrace>,
    active: Option<Recorder>,
    next_epoch: u64,
}

impl DmaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_name(&self) -> Option<&str> {
        self.active.as_ref().map(|rec| rec.name.as_str())
    }

    pub fn names(&self) -> Vec<String> {
        self.traces.keys().cloned().collect()
    }

    pub fn begin(&mut self, name: &str, start_mu: Mu) -> Result<()> {
        if let Some(active) = &self.active {
            return Err(TimelineError::RecordingInProgress {
                name: name.to_string(),
                active: active.name.clone(),
            });
        }
        self.active = Some(Recorder {
            name: name.to_string(),
            start_mu,
            events: Vec::new(),
        });
        Ok(())
    }

    /// Captures a write at absolute `timestamp` into the open recording.
    ///
    /// Within one recording the usual channel rules hold: the same timestamp replaces,
    /// the same coarse cycle collides.
    pub fn capture(
        &mut self,
        device: &str,
        channel: &str,
        timestamp: Mu,
        action: Action,
        coarse_cycle_mu: Mu,
    ) -> Result<()> {
        let rec = self
            .active
            .as_mut()
            .ok_or(TimelineError::NotRecording)?;
        let offset_mu = timestamp - rec.start_mu;
        let same_target = |e: &&mut RecordedEvent| e.device == device && e.channel == channel;
        let coarse = offset_mu.div_euclid(coarse_cycle_mu);
        if let Some(existing) = rec
            .events
            .iter_mut()
            .filter(same_target)
            .find(|e| e.offset_mu.div_euclid(coarse_cycle_mu) == coarse)
        {
            if existing.offset_mu != offset_mu {
                return Err(TimelineError::Collision {
                    device: device.to_string(),
                    channel: channel.to_string(),
                    timestamp,
                    existing: existing.offset_mu + rec.start_mu,
                });
            }
            existing.action = action;
            return Ok(());
        }
        rec.events.push(RecordedEvent {
            offset_mu,
            device: device.to_string(),
            channel: channel.to_string(),
            action,
        });
        Ok(())
    }

    /// Closes the open recording; `end_mu` is the cursor at the end of the body.
    pub fn finish(&mut self, end_mu: Mu) -> Result<DmaHandle> {
        let rec = self
            .active
            .take()
            .ok_or(TimelineError::NotRecording)?;
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        let trace = DmaTrace {
            events: rec.events,
            duration_mu: end_mu - rec.start_mu,
            epoch,
        };
        tracing::debug!(
            name = %rec.name,
            epoch,
            events = trace.events.len(),
            duration_mu = trace.duration_mu,
            "recording stored"
        );
        let handle = DmaHandle {
            name: rec.name.clone(),
            epoch,
            duration_mu: trace.duration_mu,
            n_events: trace.events.len(),
        };
        self.traces.insert(rec.name, trace);
        Ok(handle)
    }

    /// Drops the open recording without storing it.
    pub fn abort(&mut self) {
        self.active = None;
    }

    pub fn get_handle(&self, name: &str) -> Result<DmaHandle> {
        let trace = self
            .traces
            .get(name)
            .ok_or_else(|| TimelineError::UnknownRecording(name.to_string()))?;
        Ok(DmaHandle {
            name: name.to_string(),
            epoch: trace.epoch,
            duration_mu: trace.duration_mu,
            n_events: trace.events.len(),
        })
    }

    /// Trace referenced by `handle`, refusing stale handles.
    pub fn trace(&self, handle: &DmaHandle) -> Result<&DmaTrace> {
        let trace = self
            .traces
            .get(&handle.name)
            .ok_or_else(|| TimelineError::UnknownRecording(handle.name.clone()))?;
        if trace.epoch != handle.epoch {
            return Err(TimelineError::StaleHandle {
                name: handle.name.clone(),
                handle: handle.epoch,
                current: trace.epoch,
            });
        }
        Ok(trace)
    }

    pub fn erase(&mut self, name: &str) -> Result<()> {
        self.traces
            .shift_remove(name)
            .map(|_| ())
            .ok_or_else(|| TimelineError::UnknownRecording(name.to_string()))
    }
}
