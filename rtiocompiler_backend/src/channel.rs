//! Struct and methods corresponding to RTIO output channels. See [`BaseChannel`] for
//! implementation details.
//!
//! A channel is the unit of timed output: one TTL line driving a shutter, one DDS
//! output feeding an AOM, one servo channel or one DAC output. Each channel belongs
//! to a device and inherits its [`DeviceKind`], which decides which actions the
//! channel accepts.
//!
//! ## Editing behavior
//! Editing inserts [`RtioEvent`]s into the `edit_cache`, a map sorted by timestamp.
//! Two events on the same channel at the very same timestamp replace each other
//! (the later write wins). Two events within the same coarse cycle but at different
//! timestamps are a collision, which the hardware cannot resolve.
//!
//! ## Compilation behavior
//! Compilation flattens the edit cache into a sorted event list (`compile_cache`)
//! and marks the channel `fresh_compiled` until the next edit.
//!
//! ## Physical latency
//! `latency_mu` is the time between the write and the physical effect: the
//! mechanical travel of a shutter, the settling of a DDS, one servo update cycle.
//! Controllers write latency-bound channels *in advance* of the cursor so that the
//! effect lands on time; the same latency bounds how far into the past a write
//! may reach.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, TimelineError};
use crate::event::*;
use crate::units::Mu;

/// Kind of device a channel lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// TTL outputs (switches, shutters)
    Ttl,
    /// DDS synthesizer with RF switches and step attenuators
    Urukul,
    /// DDS channels under closed-loop intensity control
    SuServo,
    /// DAC outputs
    Zotino,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                DeviceKind::Ttl => "TTL",
                DeviceKind::Urukul => "URUKUL",
                DeviceKind::SuServo => "SUSERVO",
                DeviceKind::Zotino => "ZOTINO",
            }
        )
    }
}

impl FromStr for DeviceKind {
    type Err = TimelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ttl" => Ok(DeviceKind::Ttl),
            "urukul" => Ok(DeviceKind::Urukul),
            "suservo" => Ok(DeviceKind::SuServo),
            "zotino" => Ok(DeviceKind::Zotino),
            _ => Err(TimelineError::Config(format!("unknown device kind {s}"))),
        }
    }
}

/// Address of a channel: device name plus channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelRef {
    pub device: String,
    pub channel: String,
}

impl ChannelRef {
    pub fn new(device: &str, channel: &str) -> Self {
        Self {
            device: device.to_string(),
            channel: channel.to_string(),
        }
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.channel)
    }
}

/// The [`BaseChannel`] trait defines the editing and compilation behavior of a channel.
///
/// Implementors only supply field accessors; every operation is a default method.
pub trait BaseChannel {
    // Immutable field methods
    fn name(&self) -> &str;
    fn kind(&self) -> DeviceKind;
    fn latency_mu(&self) -> Mu;
    /// Output state before the first event
    fn default_state(&self) -> ChannelState;
    /// Set to true by each [`BaseChannel::compile`] call and false by each edit
    fn is_fresh_compiled(&self) -> bool;
    fn edit_cache(&self) -> &BTreeMap<Mu, RtioEvent>;
    fn compile_cache(&self) -> &Vec<RtioEvent>;
    // Mutable field methods
    fn fresh_compiled_(&mut self) -> &mut bool;
    fn edit_cache_(&mut self) -> &mut BTreeMap<Mu, RtioEvent>;
    fn compile_cache_(&mut self) -> &mut Vec<RtioEvent>;

    /// Channel is marked as compiled if its compile cache is nonempty
    fn is_compiled(&self) -> bool {
        !self.compile_cache().is_empty()
    }
    /// Channel is marked as edited if its edit cache is nonempty
    fn is_edited(&self) -> bool {
        !self.edit_cache().is_empty()
    }

    /// Checks whether an event at `timestamp` would collide with an existing event.
    ///
    /// Events at the identical timestamp do not collide; they replace each other.
    fn check_collision(&self, device: &str, timestamp: Mu, coarse_cycle_mu: Mu) -> Result<()> {
        let lo = timestamp.div_euclid(coarse_cycle_mu) * coarse_cycle_mu;
        let hi = lo + coarse_cycle_mu;
        match self
            .edit_cache()
            .range(lo..hi)
            .find(|&(&t, _)| t != timestamp)
        {
            Some((&existing, _)) => Err(TimelineError::Collision {
                device: device.to_string(),
                channel: self.name().to_string(),
                timestamp,
                existing,
            }),
            None => Ok(()),
        }
    }

    /// Inserts an event into the edit cache. Returns the event it replaced, if any.
    fn add_event(&mut self, event: RtioEvent) -> Option<RtioEvent> {
        *self.fresh_compiled_() = false;
        let replaced = self.edit_cache_().insert(event.timestamp, event);
        if let Some(old) = &replaced {
            tracing::debug!(event = %old, "event replaced by a later write at the same timestamp");
        }
        replaced
    }

    /// Flattens the edit cache into the compile cache. Double compiles are ignored.
    fn compile(&mut self) {
        if self.is_fresh_compiled() && self.is_compiled() {
            return;
        }
        let events: Vec<RtioEvent> = self.edit_cache().values().cloned().collect();
        *self.compile_cache_() = events;
        *self.fresh_compiled_() = true;
    }

    fn clear_edit_cache(&mut self) {
        *self.fresh_compiled_() = self.compile_cache().is_empty();
        self.edit_cache_().clear();
    }

    fn clear_compile_cache(&mut self) {
        *self.fresh_compiled_() = self.edit_cache().is_empty();
        self.compile_cache_().clear();
    }

    fn first_event_time(&self) -> Option<Mu> {
        self.edit_cache().keys().next().copied()
    }

    fn last_event_time(&self) -> Option<Mu> {
        self.edit_cache().keys().next_back().copied()
    }

    /// Output state after every event with timestamp `<= t` has been applied.
    fn state_at(&self, t: Mu) -> ChannelState {
        let mut state = self.default_state();
        for event in self.edit_cache().range(..=t).map(|(_, ev)| ev) {
            state.apply(&event.action);
        }
        state
    }

    /// Samples the channel's scalar output on `nsamps` evenly spaced points of `[start, end]`.
    ///
    /// See [`ChannelState::output`] for what the scalar is for each device kind.
    fn calc_signal_nsamps(&self, start: Mu, end: Mu, nsamps: usize) -> Array1<f64> {
        let kind = self.kind();
        let times = Array1::linspace(start as f64, end as f64, nsamps);
        let mut events = self.edit_cache().iter().peekable();
        let mut state = self.default_state();
        times.mapv(|t| {
            let t = t.floor() as Mu;
            while let Some((_, ev)) = events.next_if(|&(&ts, _)| ts <= t) {
                state.apply(&ev.action);
            }
            state.output(kind)
        })
    }
}

pub struct Channel {
    name: String,
    kind: DeviceKind,
    latency_mu: Mu,
    default_state: ChannelState,
    fresh_compiled: bool,
    edit_cache: BTreeMap<Mu, RtioEvent>,
    compile_cache: Vec<RtioEvent>,
}

impl BaseChannel for Channel {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> DeviceKind {
        self.kind
    }
    fn latency_mu(&self) -> Mu {
        self.latency_mu
    }
    fn default_state(&self) -> ChannelState {
        self.default_state
    }
    fn is_fresh_compiled(&self) -> bool {
        self.fresh_compiled
    }
    fn edit_cache(&self) -> &BTreeMap<Mu, RtioEvent> {
        &self.edit_cache
    }
    fn compile_cache(&self) -> &Vec<RtioEvent> {
        &self.compile_cache
    }
    fn fresh_compiled_(&mut self) -> &mut bool {
        &mut self.fresh_compiled
    }
    fn edit_cache_(&mut self) -> &mut BTreeMap<Mu, RtioEvent> {
        &mut self.edit_cache
    }
    fn compile_cache_(&mut self) -> &mut Vec<RtioEvent> {
        &mut self.compile_cache
    }
}

impl Channel {
    pub fn new(kind: DeviceKind, name: &str, latency_mu: Mu, default_state: ChannelState) -> Self {
        Self {
            name: name.to_string(),
            kind,
            latency_mu,
            default_state,
            fresh_compiled: true,
            edit_cache: BTreeMap::new(),
            compile_cache: Vec::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ev(timestamp: Mu, action: Action, seq: u64) -> RtioEvent {
        RtioEvent {
            timestamp,
            device: "ttl0".to_string(),
            channel: "ttl4".to_string(),
            action,
            seq,
            lane: 0,
        }
    }

    #[test]
    fn identical_timestamp_replaces() {
        let mut chan = Channel::new(DeviceKind::Ttl, "ttl4", 0, ChannelState::default());
        assert!(chan.add_event(ev(100, Action::TtlOn, 0)).is_none());
        let replaced = chan.add_event(ev(100, Action::TtlOff, 1));
        assert_eq!(replaced.map(|e| e.action), Some(Action::TtlOn));
        assert_eq!(chan.edit_cache().len(), 1);
        assert!(!chan.state_at(100).enabled);
    }

    #[test]
    fn same_coarse_cycle_collides() {
        let mut chan = Channel::new(DeviceKind::Ttl, "ttl4", 0, ChannelState::default());
        chan.add_event(ev(16, Action::TtlOn, 0));
        assert!(chan.check_collision("ttl0", 16, 8).is_ok());
        assert!(matches!(
            chan.check_collision("ttl0", 20, 8),
            Err(TimelineError::Collision { existing: 16, .. })
        ));
        assert!(chan.check_collision("ttl0", 24, 8).is_ok());
        assert!(chan.check_collision("ttl0", 15, 8).is_ok());
    }

    #[test]
    fn compile_and_fresh_flag() {
        let mut chan = Channel::new(DeviceKind::Ttl, "ttl4", 0, ChannelState::default());
        chan.add_event(ev(40, Action::TtlOff, 1));
        chan.add_event(ev(8, Action::TtlOn, 0));
        assert!(!chan.is_fresh_compiled());
        chan.compile();
        assert!(chan.is_fresh_compiled());
        let stamps: Vec<Mu> = chan.compile_cache().iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![8, 40]);

        chan.clear_compile_cache();
        assert!(!chan.is_compiled());
        chan.clear_edit_cache();
        assert!(!chan.is_edited());
        assert!(chan.is_fresh_compiled());
    }

    #[test]
    fn fresh_channel_skips_recompile() {
        let mut chan = Channel::new(DeviceKind::Ttl, "ttl4", 0, ChannelState::default());
        chan.add_event(ev(8, Action::TtlOn, 0));
        chan.compile();
        chan.compile_cache_().push(ev(64, Action::TtlOff, 9));
        chan.compile();
        let stamps: Vec<Mu> = chan.compile_cache().iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![8, 64]);

        chan.add_event(ev(16, Action::TtlOff, 1));
        chan.compile();
        let stamps: Vec<Mu> = chan.compile_cache().iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![8, 16]);
    }

    #[test]
    fn device_kind_names() {
        assert_eq!("SuServo".parse::<DeviceKind>().unwrap(), DeviceKind::SuServo);
        assert!("pxi".parse::<DeviceKind>().is_err());
        assert_eq!(ChannelRef::new("ttl0", "ttl4").to_string(), "ttl0/ttl4");
    }

    #[test]
    fn sampled_signal() {
        let mut chan = Channel::new(DeviceKind::Ttl, "ttl4", 0, ChannelState::default());
        chan.add_event(ev(10, Action::TtlOn, 0));
        chan.add_event(ev(20, Action::TtlOff, 1));
        let sig = chan.calc_signal_nsamps(0, 30, 4);
        assert_eq!(sig.to_vec(), vec![0., 1., 0., 0.]);
    }
}
