// Small helpers shared by the binaries and bindings
use std::time::Instant;

use crate::error::{Result, TimelineError};

// Utility class for time-tracking
pub struct TickTimer {
    last: Instant,
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Milliseconds since the previous tick (or construction).
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = now.duration_since(self.last).as_secs_f64() * 1e3;
        self.last = now;
        diff
    }

    pub fn tick_log(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        tracing::info!(elapsed_ms = diff, "{msg}");
        diff
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of a channel name of the form `prefix[number]` (e.g. `ttl4`, `ch1`, `dac12`).
pub fn extract_channel_number(chan: &str) -> Result<usize> {
    let digits = chan.trim_start_matches(|c: char| !c.is_ascii_digit());
    digits
        .parse::<usize>()
        .map_err(|_| TimelineError::Config(format!("channel name {chan} carries no number")))
}

/// Sorts channel names by their number, so that `ch10` comes after `ch2`.
pub fn sort_channel_names(names: &mut [String]) {
    names.sort_by_key(|name| extract_channel_number(name).unwrap_or(usize::MAX));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn channel_numbers() {
        assert_eq!(extract_channel_number("ttl4").unwrap(), 4);
        assert_eq!(extract_channel_number("dac12").unwrap(), 12);
        assert!(extract_channel_number("ch").is_err());

        let mut names = vec!["ch10".to_string(), "ch2".to_string(), "ch0".to_string()];
        sort_channel_names(&mut names);
        assert_eq!(names, vec!["ch0", "ch2", "ch10"]);
    }

    #[test]
    fn tick_timer_advances() {
        let mut timer = TickTimer::new();
        assert!(timer.tick() >= 0.);
    }
}
