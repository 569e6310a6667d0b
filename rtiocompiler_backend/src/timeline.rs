//! Cursor and scheduling state shared by every write.
//!
//! The [`Timeline`] owns the time cursor `now_mu`, the program-order sequence
//! counter, the [`LaneDistributor`] and the [`DmaStore`]. Experiments embed one
//! timeline next to their devices; the write path in
//! [`crate::experiment::BaseExperiment`] consults it for bounds, lanes and
//! recordings.
//!
//! The cursor only moves when asked to: writes never advance it. Moving it
//! backwards is allowed; how far a write may reach behind the cursor is bounded by
//! `max(effective latency, lookbehind_mu)`.

use crate::dma::DmaStore;
use crate::lanes::LaneDistributor;
use crate::units::{Mu, TimeBase};

pub const DEFAULT_LANES: usize = 8;

pub struct Timeline {
    timebase: TimeBase,
    lookbehind_mu: Mu,
    now_mu: Mu,
    next_seq: u64,
    lanes: LaneDistributor,
    dma: DmaStore,
}

impl Timeline {
    pub fn new(timebase: TimeBase, n_lanes: usize, lookbehind_mu: Mu) -> Self {
        Self {
            timebase,
            lookbehind_mu: lookbehind_mu.max(0),
            now_mu: 0,
            next_seq: 0,
            lanes: LaneDistributor::new(n_lanes, timebase),
            dma: DmaStore::new(),
        }
    }

    pub fn timebase(&self) -> TimeBase {
        self.timebase
    }

    pub fn lookbehind_mu(&self) -> Mu {
        self.lookbehind_mu
    }

    pub fn now_mu(&self) -> Mu {
        self.now_mu
    }

    pub fn at_mu(&mut self, t: Mu) {
        self.now_mu = t;
    }

    pub fn delay_mu(&mut self, dt: Mu) {
        self.now_mu += dt;
    }

    /// Earliest timestamp a write with the given latency may use.
    pub fn earliest_write(&self, latency_mu: Mu) -> Mu {
        self.now_mu - latency_mu.max(self.lookbehind_mu)
    }

    pub fn lanes(&self) -> &LaneDistributor {
        &self.lanes
    }

    pub fn lanes_(&mut self) -> &mut LaneDistributor {
        &mut self.lanes
    }

    pub fn dma(&self) -> &DmaStore {
        &self.dma
    }

    pub fn dma_(&mut self) -> &mut DmaStore {
        &mut self.dma
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Hands out the next program-order index.
    pub fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Back to `t = 0` with empty lanes. Recordings survive.
    pub fn reset(&mut self) {
        self.now_mu = 0;
        self.next_seq = 0;
        self.lanes.reset();
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new(TimeBase::default(), DEFAULT_LANES, 0)
    }
}

/// Timestamps of a group of logically simultaneous writes.
///
/// Each write lands at its requested time or one stagger after the previous write,
/// whichever is later. The resulting timestamps increase by at least one coarse cycle,
/// so the whole group stays on a single lane.
#[derive(Debug, Clone)]
pub struct StaggerChain {
    step: Mu,
    last: Option<Mu>,
}

impl StaggerChain {
    pub fn new(step: Mu) -> Self {
        Self { step, last: None }
    }

    pub fn next(&mut self, requested: Mu) -> Mu {
        let ts = match self.last {
            Some(last) => requested.max(last + self.step),
            None => requested,
        };
        self.last = Some(ts);
        ts
    }

    pub fn last(&self) -> Option<Mu> {
        self.last
    }

    /// One stagger after the last write, or `fallback` if nothing was written.
    pub fn end(&self, fallback: Mu) -> Mu {
        self.last.map_or(fallback, |last| last + self.step)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cursor_moves_both_ways() {
        let mut tl = Timeline::default();
        tl.delay_mu(1_000);
        tl.delay_mu(-300);
        assert_eq!(tl.now_mu(), 700);
        tl.at_mu(50);
        assert_eq!(tl.now_mu(), 50);
    }

    #[test]
    fn earliest_write_uses_larger_bound() {
        let mut tl = Timeline::new(TimeBase::default(), 8, 200);
        tl.at_mu(10_000);
        assert_eq!(tl.earliest_write(0), 9_800);
        assert_eq!(tl.earliest_write(5_000), 5_000);
    }

    #[test]
    fn stagger_chain_is_strictly_increasing() {
        let mut chain = StaggerChain::new(8);
        assert_eq!(chain.end(100), 100);
        assert_eq!(chain.next(100), 100);
        assert_eq!(chain.next(100), 108);
        assert_eq!(chain.next(50), 116);
        assert_eq!(chain.next(500), 500);
        assert_eq!(chain.end(0), 508);
    }

    #[test]
    fn reset_keeps_recordings() {
        let mut tl = Timeline::default();
        tl.dma_().begin("r", 0).unwrap();
        tl.dma_().finish(16).unwrap();
        tl.take_seq();
        tl.lanes_().submit(8).unwrap();
        tl.at_mu(64);
        tl.reset();
        assert_eq!(tl.now_mu(), 0);
        assert_eq!(tl.next_seq(), 0);
        assert_eq!(tl.lanes().report().lanes_used, 0);
        assert!(tl.dma().get_handle("r").is_ok());
    }
}
