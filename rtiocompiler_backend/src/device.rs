//! Implements struct and methods corresponding to RTIO peripheral devices. See
//! [`BaseDevice`] for implementation details.
//!
//! A device is one peripheral on the RTIO bus: a TTL bank, an Urukul DDS card, a
//! SUServo or a Zotino DAC. Every [`Device`] groups the [`Channel`]s it drives and
//! carries device-wide properties: its [`DeviceKind`], the propagation latency of
//! attenuator writes, and whether it is the primary device when streaming.
//!
//! ### Channel naming
//! Channels follow the naming convention of their device kind, checked on
//! registration:
//! - `Ttl`: `ttl(number)`
//! - `Urukul`, `SuServo`: `ch(number)`
//! - `Zotino`: `dac(number)`

use indexmap::IndexMap;
use ndarray::{s, Array2};
use regex::Regex;

use crate::channel::*;
use crate::error::{Result, TimelineError};
use crate::event::*;
use crate::units::Mu;

/// The `BaseDevice` trait defines channel management, latency lookup and
/// compilation of a device through default methods over a few field accessors.
pub trait BaseDevice {
    // Immutable accessors (getters)
    fn channels(&self) -> &IndexMap<String, Channel>;
    fn name(&self) -> &str;
    fn kind(&self) -> DeviceKind;
    fn attenuator_latency_mu(&self) -> Mu;
    fn is_primary(&self) -> bool;

    // Mutable accessors
    fn channels_(&mut self) -> &mut IndexMap<String, Channel>;
    fn primary_(&mut self) -> &mut bool;

    /// Shortcut to borrow channel instance by name
    fn chan(&self, name: &str) -> Result<&Channel> {
        match self.channels().get(name) {
            Some(chan) => Ok(chan),
            None => Err(self.unknown_channel(name)),
        }
    }
    /// Shortcut to mutably borrow channel instance by name
    fn chan_(&mut self, name: &str) -> Result<&mut Channel> {
        if !self.channels().contains_key(name) {
            return Err(self.unknown_channel(name));
        }
        self.channels_()
            .get_mut(name)
            .ok_or_else(|| TimelineError::Config(format!("channel {name} vanished")))
    }

    fn unknown_channel(&self, name: &str) -> TimelineError {
        TimelineError::UnknownChannel {
            device: self.name().to_string(),
            channel: name.to_string(),
            registered: self.channels().keys().cloned().collect(),
        }
    }

    fn cfg_primary(&mut self, primary: bool) {
        *self.primary_() = primary;
    }

    /// Adds a new channel to the device.
    ///
    /// The name is validated against the naming convention of the device kind
    /// (see the module documentation) and must not be registered yet.
    ///
    /// # Arguments
    /// - `name`: channel name, e.g. `ttl4` or `ch1`.
    /// - `latency_mu`: physical latency between write and effect.
    /// - `default_state`: output state before the first event.
    fn add_channel(&mut self, name: &str, latency_mu: Mu, default_state: ChannelState) -> Result<()> {
        let (pattern, description) = match self.kind() {
            DeviceKind::Ttl => (r"^ttl\d+$", "ttl(number)"),
            DeviceKind::Urukul | DeviceKind::SuServo => (r"^ch\d+$", "ch(number)"),
            DeviceKind::Zotino => (r"^dac\d+$", "dac(number)"),
        };
        let re = Regex::new(pattern).map_err(|e| TimelineError::Config(e.to_string()))?;
        if !re.is_match(name) {
            return Err(TimelineError::InvalidChannelName {
                device: self.name().to_string(),
                channel: name.to_string(),
                expected: description.to_string(),
            });
        }
        if self.channels().contains_key(name) {
            return Err(TimelineError::DuplicateChannel {
                device: self.name().to_string(),
                channel: name.to_string(),
            });
        }
        let new_channel = Channel::new(self.kind(), name, latency_mu.max(0), default_state);
        self.channels_().insert(name.to_string(), new_channel);
        Ok(())
    }

    /// Checks that `action` is valid and executable on channel `chan_name`.
    fn check_action(&self, chan_name: &str, action: &Action) -> Result<()> {
        self.chan(chan_name)?;
        if !action.accepted_by(self.kind()) {
            return Err(TimelineError::IncompatibleAction {
                device: self.name().to_string(),
                channel: chan_name.to_string(),
                action: action.to_string(),
            });
        }
        action.validate()
    }

    /// Time between writing `action` to the channel and its physical effect.
    ///
    /// Attenuator writes propagate with the device-wide attenuator latency, every
    /// other action with the channel latency.
    fn effective_latency(&self, chan_name: &str, action: &Action) -> Result<Mu> {
        let chan = self.chan(chan_name)?;
        Ok(match action {
            Action::Attenuation(_) => self.attenuator_latency_mu(),
            _ => chan.latency_mu(),
        })
    }

    /// A device is compiled if any of its channels are compiled.
    fn is_compiled(&self) -> bool {
        self.channels().values().any(|chan| chan.is_compiled())
    }
    /// A device is marked edited if any of its channels are edited.
    fn is_edited(&self) -> bool {
        self.channels().values().any(|chan| chan.is_edited())
    }
    /// A device is marked fresh-compiled if all of its channels are freshly compiled.
    fn is_fresh_compiled(&self) -> bool {
        self.channels().values().all(|chan| chan.is_fresh_compiled())
    }
    fn clear_edit_cache(&mut self) {
        self.channels_()
            .values_mut()
            .for_each(|chan| chan.clear_edit_cache());
    }
    fn clear_compile_cache(&mut self) {
        self.channels_()
            .values_mut()
            .for_each(|chan| chan.clear_compile_cache());
    }

    /// Compiles every edited channel and drops stale compile caches of the others.
    fn compile(&mut self) {
        for chan in self.channels_().values_mut() {
            if chan.is_edited() {
                chan.compile();
            } else {
                chan.clear_compile_cache();
            }
        }
    }

    /// Returns the compiled channels in registration order.
    fn compiled_channels(&self) -> Vec<&Channel> {
        self.channels()
            .values()
            .filter(|chan| chan.is_compiled())
            .collect()
    }

    /// All compiled events of the device in timestamp order.
    fn compiled_events(&self) -> Vec<RtioEvent> {
        let mut events: Vec<RtioEvent> = self
            .compiled_channels()
            .iter()
            .flat_map(|chan| chan.compile_cache().iter().cloned())
            .collect();
        events.sort_by(|a, b| a.time_order(b));
        events
    }

    fn last_event_time(&self) -> Option<Mu> {
        self.channels()
            .values()
            .filter_map(|chan| chan.last_event_time())
            .max()
    }

    /// Samples every compiled channel; one row per channel in registration order.
    fn calc_signal_nsamps(&self, start: Mu, end: Mu, nsamps: usize) -> Array2<f64> {
        let chans = self.compiled_channels();
        let mut buffer = Array2::from_elem((chans.len(), nsamps), 0.);
        for (i, chan) in chans.iter().enumerate() {
            buffer
                .slice_mut(s![i, ..])
                .assign(&chan.calc_signal_nsamps(start, end, nsamps));
        }
        buffer
    }
}

/// Represents one RTIO peripheral.
///
/// # Fields
/// - `channels`: channels driven by this device, in registration order.
/// - `name`: device name as in the device database (e.g. `urukul0`).
/// - `kind`: which actions the device executes.
/// - `attenuator_latency_mu`: propagation delay of attenuator writes (DDS devices).
/// - `primary`: whether this device starts last when streaming, releasing the others.
pub struct Device {
    channels: IndexMap<String, Channel>,

    name: String,
    kind: DeviceKind,
    attenuator_latency_mu: Mu,
    primary: bool,
}

impl Device {
    pub fn new(name: &str, kind: DeviceKind, attenuator_latency_mu: Mu) -> Self {
        Self {
            channels: IndexMap::new(),

            name: name.to_string(),
            kind,
            attenuator_latency_mu: attenuator_latency_mu.max(0),
            primary: false,
        }
    }
}

impl BaseDevice for Device {
    fn channels(&self) -> &IndexMap<String, Channel> {
        &self.channels
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn attenuator_latency_mu(&self) -> Mu {
        self.attenuator_latency_mu
    }

    fn is_primary(&self) -> bool {
        self.primary
    }

    fn channels_(&mut self) -> &mut IndexMap<String, Channel> {
        &mut self.channels
    }

    fn primary_(&mut self) -> &mut bool {
        &mut self.primary
    }
}
