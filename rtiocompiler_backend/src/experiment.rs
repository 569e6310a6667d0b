//! The experiment module provides the highest level of abstraction for scheduling RTIO events.
//!
//! ## Overview
//!
//! At the heart of this module lies the [`Experiment`] struct: a collection of devices plus a
//! [`Timeline`] (cursor, lanes, recordings). Its behavior is defined by the [`BaseExperiment`]
//! trait, which prescribes the methods for experiment management and manipulation through
//! default implementations over four accessors.
//!
//! The module is organized into:
//!
//! 1. **Experiment struct**: devices and timeline of the experimental setup.
//! 2. **Traits**: [`BaseExperiment`], defining every operation on an experiment.
//! 3. **Macro**: `impl_exp_boilerplate!` generates the accessor implementations so that other
//!    structs (e.g. the streaming experiment of the control crate) can reuse the trait.
//!
//! ## Write path
//!
//! Every write, from the convenience writers to DMA playback, goes through the same steps:
//! 1. resolve the device and channel, check that the device kind accepts the action and that
//!    the value is in range;
//! 2. check the time bound: `0 <= t` and `t >= now - max(latency, lookbehind)`;
//! 3. if a recording is open, capture the write and stop here;
//! 4. pre-check the channel for a collision in the same coarse cycle;
//! 5. submit the timestamp to the lane distributor;
//! 6. insert the event into the channel's edit cache.
//!
//! Steps 1 to 5 do not mutate anything on failure, so a failed write leaves the experiment
//! exactly as it was.

use std::collections::{BTreeSet, HashMap};

use indexmap::IndexMap;
use ndarray::Array2;

use crate::channel::*;
use crate::config::SystemConfig;
use crate::device::*;
use crate::dma::DmaHandle;
use crate::error::{Result, TimelineError};
use crate::event::*;
use crate::sequence::CompiledSequence;
use crate::timeline::Timeline;
use crate::units::{Mu, TimeBase};

/// This trait defines the behavior of the [`Experiment`] struct through default trait implementations.
///
/// Trait methods are classified into the following categories:
/// 1. Registration: [`add_device`], [`add_channel`], [`cfg_primary`], [`load_config`]
/// 2. Cursor: [`now_mu`], [`at_mu`], [`delay_mu`], [`delay`]
/// 3. Writes: [`write`], [`write_at`], [`write_advanced`] and the convenience writers
/// 4. Blocks: [`parallel`], [`sequential`]
/// 5. Recordings: [`record`], [`get_handle`], [`playback`], [`playback_handle`], [`erase`]
/// 6. Compilation and caches: [`compile`], [`is_edited`], [`is_compiled`], [`is_fresh_compiled`],
///    [`clear_edit_cache`], [`clear_compile_cache`]
///
/// [`add_device`]: BaseExperiment::add_device
/// [`add_channel`]: BaseExperiment::add_channel
/// [`cfg_primary`]: BaseExperiment::cfg_primary
/// [`load_config`]: BaseExperiment::load_config
/// [`now_mu`]: BaseExperiment::now_mu
/// [`at_mu`]: BaseExperiment::at_mu
/// [`delay_mu`]: BaseExperiment::delay_mu
/// [`delay`]: BaseExperiment::delay
/// [`write`]: BaseExperiment::write
/// [`write_at`]: BaseExperiment::write_at
/// [`write_advanced`]: BaseExperiment::write_advanced
/// [`parallel`]: BaseExperiment::parallel
/// [`sequential`]: BaseExperiment::sequential
/// [`record`]: BaseExperiment::record
/// [`get_handle`]: BaseExperiment::get_handle
/// [`playback`]: BaseExperiment::playback
/// [`playback_handle`]: BaseExperiment::playback_handle
/// [`erase`]: BaseExperiment::erase
/// [`compile`]: BaseExperiment::compile
/// [`is_edited`]: BaseExperiment::is_edited
/// [`is_compiled`]: BaseExperiment::is_compiled
/// [`is_fresh_compiled`]: BaseExperiment::is_fresh_compiled
/// [`clear_edit_cache`]: BaseExperiment::clear_edit_cache
/// [`clear_compile_cache`]: BaseExperiment::clear_compile_cache
pub trait BaseExperiment {
    fn devices(&self) -> &IndexMap<String, Device>;
    fn devices_(&mut self) -> &mut IndexMap<String, Device>;
    fn timeline(&self) -> &Timeline;
    fn timeline_(&mut self) -> &mut Timeline;

    /// Borrows the device registered under `name`.
    fn dev(&self, name: &str) -> Result<&Device> {
        match self.devices().get(name) {
            Some(dev) => Ok(dev),
            None => Err(self.unknown_device(name)),
        }
    }

    fn dev_(&mut self, name: &str) -> Result<&mut Device> {
        if !self.devices().contains_key(name) {
            return Err(self.unknown_device(name));
        }
        self.devices_()
            .get_mut(name)
            .ok_or_else(|| TimelineError::Config(format!("device {name} vanished")))
    }

    fn unknown_device(&self, name: &str) -> TimelineError {
        TimelineError::UnknownDevice {
            name: name.to_string(),
            registered: self.devices().keys().cloned().collect(),
        }
    }

    /// Registers a new device. Device names are unique.
    ///
    /// # Example
    /// ```
    /// use rtiocompiler_backend::*;
    ///
    /// let mut exp = Experiment::default();
    /// exp.add_device("urukul0", DeviceKind::Urukul, 0).unwrap();
    /// assert!(exp.add_device("urukul0", DeviceKind::Urukul, 0).is_err());
    /// ```
    fn add_device(&mut self, name: &str, kind: DeviceKind, attenuator_latency_mu: Mu) -> Result<()> {
        if self.devices().contains_key(name) {
            return Err(TimelineError::DuplicateDevice(name.to_string()));
        }
        self.devices_()
            .insert(name.to_string(), Device::new(name, kind, attenuator_latency_mu));
        tracing::debug!(device = name, %kind, "device registered");
        Ok(())
    }

    fn add_channel(
        &mut self,
        dev_name: &str,
        chan_name: &str,
        latency_mu: Mu,
        default_state: ChannelState,
    ) -> Result<()> {
        self.dev_(dev_name)?
            .add_channel(chan_name, latency_mu, default_state)
    }

    /// Marks `dev_name` as the primary device; every other device becomes secondary.
    fn cfg_primary(&mut self, dev_name: &str) -> Result<()> {
        self.dev(dev_name)?;
        for (name, dev) in self.devices_().iter_mut() {
            dev.cfg_primary(name == dev_name);
        }
        Ok(())
    }

    /// Registers every device and channel listed in the configuration.
    fn load_config(&mut self, cfg: &SystemConfig) -> Result<()> {
        let tb = self.timebase();
        for dev_cfg in &cfg.devices {
            self.add_device(
                &dev_cfg.name,
                dev_cfg.kind,
                tb.seconds_to_mu(dev_cfg.attenuator_latency_s),
            )?;
            for chan_cfg in &dev_cfg.channels {
                self.add_channel(
                    &dev_cfg.name,
                    &chan_cfg.name,
                    tb.seconds_to_mu(chan_cfg.latency_s),
                    chan_cfg.default_state(),
                )?;
            }
            if dev_cfg.primary {
                self.cfg_primary(&dev_cfg.name)?;
            }
        }
        Ok(())
    }

    fn timebase(&self) -> TimeBase {
        self.timeline().timebase()
    }

    fn now_mu(&self) -> Mu {
        self.timeline().now_mu()
    }

    fn at_mu(&mut self, t: Mu) {
        self.timeline_().at_mu(t);
    }

    /// Moves the cursor by `dt`, which may be negative.
    fn delay_mu(&mut self, dt: Mu) {
        self.timeline_().delay_mu(dt);
    }

    fn delay(&mut self, seconds: f64) {
        let dt = self.timebase().seconds_to_mu(seconds);
        self.delay_mu(dt);
    }

    /// Schedules `action` on a channel at absolute time `timestamp`.
    ///
    /// See the module documentation for the checks performed. On error nothing changes.
    fn write_at(&mut self, dev_name: &str, chan_name: &str, timestamp: Mu, action: Action) -> Result<()> {
        let latency = {
            let dev = self.dev(dev_name)?;
            dev.check_action(chan_name, &action)?;
            dev.effective_latency(chan_name, &action)?
        };
        let recording = self.timeline().dma().is_recording();
        // Recorded timestamps are relative; the origin is checked at playback.
        if !recording && timestamp < 0 {
            return Err(TimelineError::NegativeTimestamp {
                device: dev_name.to_string(),
                channel: chan_name.to_string(),
                timestamp,
            });
        }
        let now = self.now_mu();
        let limit = self.timeline().earliest_write(latency);
        if timestamp < limit {
            return Err(TimelineError::PastLimit {
                device: dev_name.to_string(),
                channel: chan_name.to_string(),
                timestamp,
                now,
                limit: now - limit,
            });
        }
        if recording {
            let coarse_cycle_mu = self.timebase().coarse_cycle_mu();
            return self
                .timeline_()
                .dma_()
                .capture(dev_name, chan_name, timestamp, action, coarse_cycle_mu);
        }
        self.commit_event(dev_name, chan_name, timestamp, action)
    }

    /// Collision check, lane submission and insertion of an already validated write.
    fn commit_event(&mut self, dev_name: &str, chan_name: &str, timestamp: Mu, action: Action) -> Result<()> {
        if timestamp < 0 {
            return Err(TimelineError::NegativeTimestamp {
                device: dev_name.to_string(),
                channel: chan_name.to_string(),
                timestamp,
            });
        }
        let coarse_cycle_mu = self.timebase().coarse_cycle_mu();
        self.dev(dev_name)?
            .chan(chan_name)?
            .check_collision(dev_name, timestamp, coarse_cycle_mu)?;
        let lane = self.timeline_().lanes_().submit(timestamp)?;
        let seq = self.timeline_().take_seq();
        let event = RtioEvent {
            timestamp,
            device: dev_name.to_string(),
            channel: chan_name.to_string(),
            action,
            seq,
            lane,
        };
        tracing::trace!(%event, "event scheduled");
        self.dev_(dev_name)?.chan_(chan_name)?.add_event(event);
        Ok(())
    }

    /// Schedules `action` at the cursor.
    fn write(&mut self, dev_name: &str, chan_name: &str, action: Action) -> Result<()> {
        let now = self.now_mu();
        self.write_at(dev_name, chan_name, now, action)
    }

    /// Schedules `action` one effective latency before the cursor so that its physical effect
    /// lands at the cursor. Returns the write timestamp.
    fn write_advanced(&mut self, dev_name: &str, chan_name: &str, action: Action) -> Result<Mu> {
        let latency = self.dev(dev_name)?.effective_latency(chan_name, &action)?;
        let timestamp = self.now_mu() - latency;
        self.write_at(dev_name, chan_name, timestamp, action)?;
        Ok(timestamp)
    }

    /// Moves the cursor to `timestamp`, writes there and moves it back.
    ///
    /// Unlike [`BaseExperiment::write_at`] this is not bounded by the channel latency: the
    /// write happens at the cursor, which is allowed to travel into the past.
    fn write_excursion(&mut self, dev_name: &str, chan_name: &str, timestamp: Mu, action: Action) -> Result<()> {
        let now = self.now_mu();
        self.at_mu(timestamp);
        let outcome = self.write(dev_name, chan_name, action);
        self.at_mu(now);
        outcome
    }

    fn ttl_on(&mut self, dev_name: &str, chan_name: &str) -> Result<()> {
        self.write(dev_name, chan_name, Action::TtlOn)
    }

    fn ttl_off(&mut self, dev_name: &str, chan_name: &str) -> Result<()> {
        self.write(dev_name, chan_name, Action::TtlOff)
    }

    /// TTL high at the cursor, low `duration_mu` later. Advances the cursor by `duration_mu`.
    fn pulse(&mut self, dev_name: &str, chan_name: &str, duration_mu: Mu) -> Result<()> {
        self.ttl_on(dev_name, chan_name)?;
        self.delay_mu(duration_mu);
        self.ttl_off(dev_name, chan_name)
    }

    fn dds_switch(&mut self, dev_name: &str, chan_name: &str, on: bool) -> Result<()> {
        self.write(dev_name, chan_name, Action::DdsSwitch(on))
    }

    fn set_frequency(&mut self, dev_name: &str, chan_name: &str, frequency_hz: f64) -> Result<()> {
        self.write(dev_name, chan_name, Action::DdsFrequency(frequency_hz))
    }

    fn set_amplitude(&mut self, dev_name: &str, chan_name: &str, amplitude: f64) -> Result<()> {
        self.write(dev_name, chan_name, Action::DdsAmplitude(amplitude))
    }

    fn set_attenuation(&mut self, dev_name: &str, chan_name: &str, attenuation_db: f64) -> Result<()> {
        self.write(dev_name, chan_name, Action::Attenuation(attenuation_db))
    }

    fn set_dac(&mut self, dev_name: &str, chan_name: &str, voltage: f64) -> Result<()> {
        self.write(dev_name, chan_name, Action::DacVoltage(voltage))
    }

    /// Runs every branch from the same start cursor; the cursor ends at the latest branch end.
    ///
    /// On error the cursor returns to the block start. Writes of branches that completed stay.
    fn parallel(&mut self, branches: &[&dyn Fn(&mut Self) -> Result<()>]) -> Result<()> {
        let start = self.now_mu();
        let mut end = start;
        for branch in branches {
            self.at_mu(start);
            if let Err(e) = branch(self) {
                self.at_mu(start);
                return Err(e);
            }
            end = end.max(self.now_mu());
        }
        self.at_mu(end);
        Ok(())
    }

    /// Runs the branches one after another.
    fn sequential(&mut self, branches: &[&dyn Fn(&mut Self) -> Result<()>]) -> Result<()> {
        for branch in branches {
            branch(self)?;
        }
        Ok(())
    }

    /// Records the writes of `body` under `name` instead of scheduling them.
    ///
    /// Captured timestamps are relative to the cursor at record start and the cursor is
    /// restored afterwards. Re-recording a name invalidates its earlier handles.
    fn record<F>(&mut self, name: &str, body: F) -> Result<DmaHandle>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let start = self.now_mu();
        self.timeline_().dma_().begin(name, start)?;
        let outcome = body(self);
        let end = self.now_mu();
        self.at_mu(start);
        match outcome {
            Ok(()) => self.timeline_().dma_().finish(end),
            Err(e) => {
                self.timeline_().dma_().abort();
                Err(e)
            }
        }
    }

    fn get_handle(&self, name: &str) -> Result<DmaHandle> {
        self.timeline().dma().get_handle(name)
    }

    /// Replays a recording at the cursor and advances the cursor by its duration.
    ///
    /// Every event passes the collision and lane checks before the first one is
    /// committed, so a failing playback schedules nothing.
    fn playback_handle(&mut self, handle: &DmaHandle) -> Result<()> {
        if let Some(active) = self.timeline().dma().active_name() {
            return Err(TimelineError::RecordingInProgress {
                name: handle.name.clone(),
                active: active.to_string(),
            });
        }
        let trace = self.timeline().dma().trace(handle)?.clone();
        let now = self.now_mu();
        let coarse_cycle_mu = self.timebase().coarse_cycle_mu();

        let mut lanes = self.timeline().lanes().clone();
        // Trace events already placed by this playback, per channel. A shift that is not
        // coarse aligned can merge two recorded events into one coarse cycle.
        let mut placed: HashMap<(&str, &str), BTreeSet<Mu>> = HashMap::new();
        for ev in &trace.events {
            let timestamp = now + ev.offset_mu;
            if timestamp < 0 {
                return Err(TimelineError::NegativeTimestamp {
                    device: ev.device.clone(),
                    channel: ev.channel.clone(),
                    timestamp,
                });
            }
            self.dev(&ev.device)?
                .chan(&ev.channel)?
                .check_collision(&ev.device, timestamp, coarse_cycle_mu)?;
            let lo = timestamp.div_euclid(coarse_cycle_mu) * coarse_cycle_mu;
            let same_channel = placed
                .entry((ev.device.as_str(), ev.channel.as_str()))
                .or_default();
            if let Some(&existing) = same_channel
                .range(lo..lo + coarse_cycle_mu)
                .find(|&&t| t != timestamp)
            {
                return Err(TimelineError::Collision {
                    device: ev.device.clone(),
                    channel: ev.channel.clone(),
                    timestamp,
                    existing,
                });
            }
            same_channel.insert(timestamp);
            lanes.submit(timestamp)?;
        }

        for ev in &trace.events {
            self.commit_event(&ev.device, &ev.channel, now + ev.offset_mu, ev.action)?;
        }
        self.delay_mu(trace.duration_mu);
        tracing::debug!(
            name = %handle.name,
            epoch = handle.epoch,
            at = now,
            events = trace.events.len(),
            "recording played back"
        );
        Ok(())
    }

    fn playback(&mut self, name: &str) -> Result<()> {
        let handle = self.get_handle(name)?;
        self.playback_handle(&handle)
    }

    fn erase(&mut self, name: &str) -> Result<()> {
        self.timeline_().dma_().erase(name)
    }

    fn last_event_time(&self) -> Option<Mu> {
        self.devices()
            .values()
            .filter_map(|dev| dev.last_event_time())
            .max()
    }

    /// Compiles every device and returns the merged event list.
    ///
    /// `stop_time` defaults to one coarse cycle after the last event and must lie after it.
    fn compile(&mut self, stop_time: Option<Mu>) -> Result<CompiledSequence> {
        let last = self.last_event_time();
        let coarse_cycle_mu = self.timebase().coarse_cycle_mu();
        let duration_mu = match (stop_time, last) {
            (Some(stop), Some(last)) if stop < last => {
                return Err(TimelineError::StopBeforeLastEvent { stop, last });
            }
            (Some(stop), None) if stop < 0 => {
                return Err(TimelineError::StopBeforeLastEvent { stop, last: 0 });
            }
            (Some(stop), _) => stop,
            (None, Some(last)) => last + coarse_cycle_mu,
            (None, None) => 0,
        };
        for dev in self.devices_().values_mut() {
            dev.compile();
        }
        let mut events: Vec<RtioEvent> = self
            .devices()
            .values()
            .flat_map(|dev| dev.compiled_events())
            .collect();
        events.sort_by(|a, b| a.time_order(b));
        let lane_report = self.timeline().lanes().report();
        tracing::info!(
            events = events.len(),
            duration_mu,
            lanes_used = lane_report.lanes_used,
            lane_switches = lane_report.lane_switches,
            "sequence compiled"
        );
        Ok(CompiledSequence {
            events,
            duration_mu,
            lane_report,
            timebase: self.timebase(),
        })
    }

    /// An experiment is marked edited if any of its devices is edited.
    fn is_edited(&self) -> bool {
        self.devices().values().any(|dev| dev.is_edited())
    }

    fn is_compiled(&self) -> bool {
        self.devices().values().any(|dev| dev.is_compiled())
    }

    /// Whether every device is compiled and unedited since.
    fn is_fresh_compiled(&self) -> bool {
        self.devices().values().all(|dev| dev.is_fresh_compiled())
    }

    /// Drops every scheduled event and rewinds the timeline. Recordings are kept.
    fn clear_edit_cache(&mut self) {
        self.devices_()
            .values_mut()
            .for_each(|dev| dev.clear_edit_cache());
        self.timeline_().reset();
    }

    fn clear_compile_cache(&mut self) {
        self.devices_()
            .values_mut()
            .for_each(|dev| dev.clear_compile_cache());
    }

    /// Executes `f` on a device after checking its kind.
    fn typed_device_op<F, R>(&mut self, name: &str, kind: DeviceKind, f: F) -> Result<R>
    where
        F: FnOnce(&mut Device) -> R,
    {
        let dev = self.dev_(name)?;
        if dev.kind() != kind {
            return Err(TimelineError::WrongDeviceKind {
                device: name.to_string(),
                expected: kind,
                actual: dev.kind(),
            });
        }
        Ok(f(dev))
    }

    fn device_op<F, R>(&mut self, name: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut Device) -> R,
    {
        Ok(f(self.dev_(name)?))
    }

    fn channel_op<F, R>(&mut self, name: &str, chan_name: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut Channel) -> R,
    {
        Ok(f(self.dev_(name)?.chan_(chan_name)?))
    }

    fn channel_state_at(&self, name: &str, chan_name: &str, t: Mu) -> Result<ChannelState> {
        Ok(self.dev(name)?.chan(chan_name)?.state_at(t))
    }

    fn device_calc_signal_nsamps(&self, name: &str, start: Mu, end: Mu, nsamps: usize) -> Result<Array2<f64>> {
        Ok(self.dev(name)?.calc_signal_nsamps(start, end, nsamps))
    }
}

/// A concrete struct consisting of a collection of devices and a timeline.
///
/// **Refer to the [`BaseExperiment`] trait for method behavior.**
pub struct Experiment {
    devices: IndexMap<String, Device>,
    timeline: Timeline,
}

/// Generates the [`BaseExperiment`] accessors for a struct with `devices` and `timeline` fields.
///
/// Usage:
/// ```rust
/// use rtiocompiler_backend::*;
///
/// struct CustomExperiment {
///     devices: IndexMap<String, Device>,
///     timeline: Timeline,
///     shots: usize,
/// }
/// impl_exp_boilerplate!(CustomExperiment);
///
/// let mut exp = CustomExperiment {
///     devices: IndexMap::new(),
///     timeline: Timeline::default(),
///     shots: 3,
/// };
/// exp.add_device("ttl0", DeviceKind::Ttl, 0).unwrap();
/// assert_eq!(exp.shots, 3);
/// ```
#[macro_export]
macro_rules! impl_exp_boilerplate {
    ($exp_type: ty) => {
        impl $crate::experiment::BaseExperiment for $exp_type {
            fn devices(&self) -> &$crate::IndexMap<String, $crate::device::Device> {
                &self.devices
            }
            fn devices_(&mut self) -> &mut $crate::IndexMap<String, $crate::device::Device> {
                &mut self.devices
            }
            fn timeline(&self) -> &$crate::timeline::Timeline {
                &self.timeline
            }
            fn timeline_(&mut self) -> &mut $crate::timeline::Timeline {
                &mut self.timeline
            }
        }
    };
}

impl_exp_boilerplate!(Experiment);

impl Experiment {
    pub fn new(timebase: TimeBase, n_lanes: usize, lookbehind_mu: Mu) -> Self {
        Self {
            devices: IndexMap::new(),
            timeline: Timeline::new(timebase, n_lanes, lookbehind_mu),
        }
    }

    /// Builds an experiment with the timing and devices of `cfg`.
    pub fn from_config(cfg: &SystemConfig) -> Result<Self> {
        cfg.validate()?;
        let timebase = cfg.timebase();
        let mut exp = Self::new(
            timebase,
            cfg.rtio.lanes,
            timebase.seconds_to_mu(cfg.timing.lookbehind_s),
        );
        exp.load_config(cfg)?;
        Ok(exp)
    }
}

impl Default for Experiment {
    fn default() -> Self {
        Self {
            devices: IndexMap::new(),
            timeline: Timeline::default(),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::experiment::*;

    fn setup() -> Experiment {
        let mut exp = Experiment::default();
        exp.add_device("ttl0", DeviceKind::Ttl, 0).unwrap();
        exp.add_channel("ttl0", "ttl0", 0, ChannelState::default()).unwrap();
        // shutter with 2 us mechanical delay
        exp.add_channel("ttl0", "ttl1", 2_000, ChannelState::default()).unwrap();
        exp.add_device("urukul0", DeviceKind::Urukul, 1_500).unwrap();
        exp.add_channel("urukul0", "ch0", 0, ChannelState::default()).unwrap();
        exp.add_channel("urukul0", "ch1", 0, ChannelState::default()).unwrap();
        exp
    }

    fn n_events(exp: &Experiment) -> usize {
        exp.devices()
            .values()
            .flat_map(|d| d.channels().values())
            .map(|c| c.edit_cache().len())
            .sum()
    }

    #[test]
    fn unknown_targets() {
        let mut exp = setup();
        assert!(matches!(
            exp.ttl_on("ttl9", "ttl0"),
            Err(TimelineError::UnknownDevice { .. })
        ));
        assert!(matches!(
            exp.ttl_on("ttl0", "ttl7"),
            Err(TimelineError::UnknownChannel { .. })
        ));
        assert!(matches!(
            exp.write("ttl0", "ttl0", Action::DdsSwitch(true)),
            Err(TimelineError::IncompatibleAction { .. })
        ));
        assert_eq!(n_events(&exp), 0);
    }

    #[test]
    fn writes_do_not_move_the_cursor() {
        let mut exp = setup();
        exp.at_mu(1_000);
        exp.ttl_on("ttl0", "ttl0").unwrap();
        exp.set_frequency("urukul0", "ch0", 80e6).unwrap();
        assert_eq!(exp.now_mu(), 1_000);
        exp.at_mu(2_000);
        exp.pulse("ttl0", "ttl0", 400).unwrap();
        assert_eq!(exp.now_mu(), 2_400);
    }

    #[test]
    fn past_writes_are_bounded_by_latency() {
        let mut exp = setup();
        exp.at_mu(10_000);
        // shutter may reach 2 us back, the plain TTL not at all
        assert!(exp.write_at("ttl0", "ttl1", 8_000, Action::TtlOn).is_ok());
        assert!(matches!(
            exp.write_at("ttl0", "ttl0", 9_992, Action::TtlOn),
            Err(TimelineError::PastLimit { limit: 0, .. })
        ));
        assert!(matches!(
            exp.write_at("ttl0", "ttl1", 7_992, Action::TtlOff),
            Err(TimelineError::PastLimit { limit: 2_000, .. })
        ));
        // attenuator writes use the device-wide attenuator latency
        assert!(exp.write_at("urukul0", "ch0", 8_504, Action::Attenuation(10.)).is_ok());
        // the future is unbounded
        assert!(exp.write_at("ttl0", "ttl0", 1_000_000, Action::TtlOn).is_ok());
    }

    #[test]
    fn lookbehind_widens_the_bound() {
        let mut exp = Experiment::new(TimeBase::default(), 8, 500);
        exp.add_device("ttl0", DeviceKind::Ttl, 0).unwrap();
        exp.add_channel("ttl0", "ttl0", 0, ChannelState::default()).unwrap();
        exp.at_mu(1_000);
        assert!(exp.write_at("ttl0", "ttl0", 504, Action::TtlOn).is_ok());
        assert!(exp.write_at("ttl0", "ttl0", 496, Action::TtlOff).is_err());
    }

    #[test]
    fn excursions_reach_behind_the_bound() {
        let mut exp = setup();
        exp.at_mu(10_000);
        exp.write_excursion("ttl0", "ttl0", 4_000, Action::TtlOn).unwrap();
        assert_eq!(exp.now_mu(), 10_000);
        assert!(exp.channel_state_at("ttl0", "ttl0", 4_000).unwrap().enabled);
        assert!(exp.write_excursion("ttl0", "ttl0", -8, Action::TtlOff).is_err());
        assert_eq!(exp.now_mu(), 10_000);
    }

    #[test]
    fn negative_timestamps_are_refused() {
        let mut exp = setup();
        assert!(matches!(
            exp.write_advanced("ttl0", "ttl1", Action::TtlOn),
            Err(TimelineError::NegativeTimestamp { timestamp: -2_000, .. })
        ));
    }

    #[test]
    fn write_advanced_lands_on_cursor() {
        let mut exp = setup();
        exp.at_mu(5_000);
        assert_eq!(exp.write_advanced("ttl0", "ttl1", Action::TtlOn).unwrap(), 3_000);
        assert_eq!(
            exp.write_advanced("urukul0", "ch1", Action::Attenuation(6.)).unwrap(),
            3_500
        );
        assert!(exp.channel_state_at("ttl0", "ttl1", 3_000).unwrap().enabled);
    }

    #[test]
    fn collision_leaves_state_untouched() {
        let mut exp = setup();
        exp.at_mu(800);
        exp.ttl_on("ttl0", "ttl0").unwrap();
        let lanes_before = exp.timeline().lanes().report();
        assert!(matches!(
            exp.write_at("ttl0", "ttl0", 803, Action::TtlOff),
            Err(TimelineError::Collision { existing: 800, .. })
        ));
        assert_eq!(exp.timeline().lanes().report(), lanes_before);
        assert_eq!(exp.timeline().next_seq(), 1);
        // identical timestamp replaces
        exp.ttl_off("ttl0", "ttl0").unwrap();
        assert_eq!(n_events(&exp), 1);
        assert!(!exp.channel_state_at("ttl0", "ttl0", 800).unwrap().enabled);
    }

    #[test]
    fn simultaneous_writes_use_lanes() {
        let mut exp = setup();
        exp.at_mu(1_000);
        exp.ttl_on("ttl0", "ttl0").unwrap();
        exp.dds_switch("urukul0", "ch0", true).unwrap();
        exp.dds_switch("urukul0", "ch1", true).unwrap();
        let report = exp.timeline().lanes().report();
        assert_eq!(report.lanes_used, 3);
        assert_eq!(report.lane_switches, 2);
    }

    #[test]
    fn lane_exhaustion_is_a_hard_failure() {
        let mut exp = Experiment::new(TimeBase::default(), 2, 0);
        exp.add_device("ttl0", DeviceKind::Ttl, 0).unwrap();
        for i in 0..3 {
            exp.add_channel("ttl0", &format!("ttl{i}"), 0, ChannelState::default())
                .unwrap();
        }
        exp.ttl_on("ttl0", "ttl0").unwrap();
        exp.ttl_on("ttl0", "ttl1").unwrap();
        assert!(matches!(
            exp.ttl_on("ttl0", "ttl2"),
            Err(TimelineError::LanesExhausted { .. })
        ));
        assert_eq!(n_events(&exp), 2);
    }

    #[test]
    fn parallel_and_sequential_blocks() {
        let mut exp = setup();
        exp.at_mu(100);
        exp.parallel(&[
            &|e: &mut Experiment| e.pulse("ttl0", "ttl0", 1_000),
            &|e: &mut Experiment| -> Result<()> {
                e.delay_mu(16);
                e.set_amplitude("urukul0", "ch0", 0.5)?;
                e.delay_mu(5_000);
                Ok(())
            },
        ])
        .unwrap();
        assert_eq!(exp.now_mu(), 5_116);

        exp.sequential(&[
            &|e: &mut Experiment| e.pulse("ttl0", "ttl0", 80),
            &|e: &mut Experiment| e.pulse("ttl0", "ttl0", 80),
        ])
        .unwrap();
        assert_eq!(exp.now_mu(), 5_276);
    }

    #[test]
    fn failing_branch_rewinds_cursor() {
        let mut exp = setup();
        exp.at_mu(64);
        let res = exp.parallel(&[
            &|e: &mut Experiment| e.pulse("ttl0", "ttl0", 80),
            &|e: &mut Experiment| e.ttl_on("nodev", "ttl0"),
        ]);
        assert!(res.is_err());
        assert_eq!(exp.now_mu(), 64);
    }

    #[test]
    fn record_and_playback() {
        let mut exp = setup();
        exp.at_mu(3_000);
        let handle = exp
            .record("pulse_train", |e| {
                for _ in 0..3 {
                    e.pulse("ttl0", "ttl0", 100)?;
                    e.delay_mu(100);
                }
                e.write_advanced("ttl0", "ttl1", Action::TtlOn)?;
                Ok(())
            })
            .unwrap();
        // recording schedules nothing and restores the cursor
        assert_eq!(exp.now_mu(), 3_000);
        assert_eq!(n_events(&exp), 0);
        assert_eq!(handle.duration_mu, 600);
        assert_eq!(handle.n_events, 7);

        exp.playback_handle(&handle).unwrap();
        assert_eq!(exp.now_mu(), 3_600);
        exp.playback("pulse_train").unwrap();
        assert_eq!(exp.now_mu(), 4_200);
        assert_eq!(n_events(&exp), 14);
        // advance write of the second playback lands 2 us before its end
        assert!(exp.channel_state_at("ttl0", "ttl1", 2_200).unwrap().enabled);
    }

    #[test]
    fn stale_handles_are_refused() {
        let mut exp = setup();
        let old = exp.record("r", |e| e.ttl_on("ttl0", "ttl0")).unwrap();
        exp.record("r", |e| e.ttl_off("ttl0", "ttl0")).unwrap();
        assert!(matches!(
            exp.playback_handle(&old),
            Err(TimelineError::StaleHandle { .. })
        ));
        exp.erase("r").unwrap();
        assert!(matches!(
            exp.playback("r"),
            Err(TimelineError::UnknownRecording(_))
        ));
    }

    #[test]
    fn nested_record_fails_and_aborts() {
        let mut exp = setup();
        let res = exp.record("outer", |e| {
            e.record("inner", |e| e.ttl_on("ttl0", "ttl0"))?;
            Ok(())
        });
        assert!(matches!(res, Err(TimelineError::RecordingInProgress { .. })));
        assert!(!exp.timeline().dma().is_recording());
        assert!(exp.get_handle("outer").is_err());
    }

    #[test]
    fn failed_playback_schedules_nothing() {
        let mut exp = setup();
        let handle = exp
            .record("two", |e| {
                e.ttl_on("ttl0", "ttl0")?;
                e.delay_mu(800);
                e.ttl_off("ttl0", "ttl0")
            })
            .unwrap();
        exp.at_mu(804);
        exp.ttl_on("ttl0", "ttl0").unwrap();
        exp.at_mu(0);
        // second recorded event at 800 collides with the write at 804
        assert!(matches!(
            exp.playback_handle(&handle),
            Err(TimelineError::Collision { .. })
        ));
        assert_eq!(n_events(&exp), 1);
        assert_eq!(exp.now_mu(), 0);
    }

    #[test]
    fn unaligned_playback_collides_within_the_trace() {
        let mut exp = setup();
        let handle = exp
            .record("split", |e| {
                e.delay_mu(4);
                e.ttl_on("ttl0", "ttl0")?;
                e.delay_mu(5);
                e.ttl_off("ttl0", "ttl0")
            })
            .unwrap();
        // offsets 4 and 9 sit in different cycles, 8 and 13 do not
        exp.at_mu(4);
        assert!(matches!(
            exp.playback_handle(&handle),
            Err(TimelineError::Collision { timestamp: 13, existing: 8, .. })
        ));
        assert_eq!(n_events(&exp), 0);
        assert_eq!(exp.now_mu(), 4);
        assert_eq!(exp.timeline().lanes().report().lanes_used, 0);

        exp.at_mu(8);
        exp.playback_handle(&handle).unwrap();
        assert_eq!(n_events(&exp), 2);
    }

    #[test]
    fn playback_out_of_lanes_schedules_nothing() {
        let mut exp = Experiment::new(TimeBase::default(), 1, 0);
        exp.add_device("ttl0", DeviceKind::Ttl, 0).unwrap();
        exp.add_channel("ttl0", "ttl0", 0, ChannelState::default()).unwrap();
        exp.add_device("urukul0", DeviceKind::Urukul, 0).unwrap();
        exp.add_channel("urukul0", "ch0", 0, ChannelState::default()).unwrap();
        let handle = exp
            .record("both", |e| {
                e.ttl_on("ttl0", "ttl0")?;
                e.dds_switch("urukul0", "ch0", true)
            })
            .unwrap();

        exp.at_mu(100);
        assert!(matches!(
            exp.playback_handle(&handle),
            Err(TimelineError::LanesExhausted { .. })
        ));
        assert_eq!(n_events(&exp), 0);
        assert_eq!(exp.now_mu(), 100);
        assert_eq!(exp.timeline().lanes().report().lanes_used, 0);
    }

    #[test]
    fn compile_stop_time() {
        let mut exp = setup();
        let empty = exp.compile(None).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.duration_mu, 0);

        exp.at_mu(1_000);
        exp.pulse("ttl0", "ttl0", 1_000).unwrap();
        exp.at_mu(500);
        exp.dds_switch("urukul0", "ch0", true).unwrap();
        assert!(matches!(
            exp.compile(Some(1_999)),
            Err(TimelineError::StopBeforeLastEvent { stop: 1_999, last: 2_000 })
        ));
        assert_eq!(exp.compile(Some(2_000)).unwrap().duration_mu, 2_000);
        let seq = exp.compile(None).unwrap();
        assert_eq!(seq.duration_mu, 2_008);
        assert_eq!(seq.timestamps().to_vec(), vec![500, 1_000, 2_000]);
        let program: Vec<u64> = seq.program_order().iter().map(|e| e.seq).collect();
        assert_eq!(program, vec![0, 1, 2]);
        assert!(exp.is_fresh_compiled());

        exp.at_mu(3_000);
        exp.ttl_on("ttl0", "ttl0").unwrap();
        assert!(!exp.is_fresh_compiled());
        assert_eq!(exp.compile(Some(10_000)).unwrap().duration_mu, 10_000);
    }

    #[test]
    fn clear_edit_cache_rewinds() {
        let mut exp = setup();
        exp.at_mu(1_000);
        exp.ttl_on("ttl0", "ttl0").unwrap();
        exp.compile(None).unwrap();
        exp.clear_edit_cache();
        assert!(!exp.is_edited());
        assert_eq!(exp.now_mu(), 0);
        assert_eq!(exp.timeline().lanes().report().lanes_used, 0);
        exp.ttl_on("ttl0", "ttl1").unwrap();
        // stale compile caches do not leak into the next compile
        let seq = exp.compile(None).unwrap();
        assert_eq!(seq.len(), 1);
        assert_eq!(seq.events[0].channel, "ttl1");
        exp.clear_compile_cache();
        assert!(!exp.is_compiled());
    }

    #[test]
    fn device_ops() {
        let mut exp = setup();
        assert!(exp
            .typed_device_op("urukul0", DeviceKind::Urukul, |d| d.channels().len())
            .is_ok());
        assert!(matches!(
            exp.typed_device_op("urukul0", DeviceKind::Ttl, |_| ()),
            Err(TimelineError::WrongDeviceKind { .. })
        ));
        let latency = exp.channel_op("ttl0", "ttl1", |c| c.latency_mu()).unwrap();
        assert_eq!(latency, 2_000);
        exp.cfg_primary("urukul0").unwrap();
        assert!(exp.device_op("urukul0", |d| d.is_primary()).unwrap());
        exp.cfg_primary("ttl0").unwrap();
        assert!(!exp.dev("urukul0").unwrap().is_primary());
    }
}
