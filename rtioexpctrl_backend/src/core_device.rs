//! # Core device slack analysis
//!
//! The core device CPU submits events in program order while the RTIO counter runs in
//! wall-clock time. [`CoreDevice::analyze`] replays a [`CompiledSequence`] against a model
//! of that race:
//!
//! - The counter starts `initial_slack_mu` before the earliest event of the sequence and
//!   advances by `submit_cost_mu` for every submission.
//! - Each lane is a FIFO of `fifo_depth` events. An event leaves its FIFO once the counter
//!   reaches its timestamp.
//! - Submitting into a full FIFO stalls the CPU until the head of that FIFO is emitted.
//! - An event whose timestamp lies behind the counter when it is submitted is an
//!   [`RunError::Underflow`].
//!
//! A sequence that passes the analysis never underflows on hardware with at least the
//! modelled slack, FIFO depth and submission speed.

use std::collections::VecDeque;
use std::fmt;

use ndarray::Array1;
use rtiocompiler_backend::config::RtioConfig;
use rtiocompiler_backend::{CompiledSequence, Mu, TimeBase};

use crate::error::{Result, RunError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoreDevice {
    pub n_lanes: usize,
    pub fifo_depth: usize,
    pub submit_cost_mu: Mu,
    pub initial_slack_mu: Mu,
}

/// Outcome of a successful analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub events: usize,
    /// Slack of every event at submission, in program order
    pub slack_mu: Array1<Mu>,
    pub min_slack_mu: Mu,
    /// Number of submissions that waited on a full FIFO
    pub stalls: usize,
    /// Total counter time spent stalled
    pub stall_mu: Mu,
    pub peak_fill: Vec<usize>,
    /// Counter value once the last event has been submitted
    pub end_counter_mu: Mu,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} events, min slack {} mu, {} stalls ({} mu), peak FIFO fill {:?}",
            self.events, self.min_slack_mu, self.stalls, self.stall_mu, self.peak_fill
        )
    }
}

impl CoreDevice {
    pub fn new(n_lanes: usize, fifo_depth: usize, submit_cost_mu: Mu, initial_slack_mu: Mu) -> Self {
        Self {
            n_lanes,
            fifo_depth,
            submit_cost_mu,
            initial_slack_mu,
        }
    }

    pub fn from_config(cfg: &RtioConfig, timebase: &TimeBase) -> Self {
        Self::new(
            cfg.lanes,
            cfg.fifo_depth,
            timebase.seconds_to_mu(cfg.submit_cost_s),
            timebase.seconds_to_mu(cfg.initial_slack_s),
        )
    }

    pub fn analyze(&self, seq: &CompiledSequence) -> Result<RunReport> {
        let used = seq.events.iter().map(|ev| ev.lane + 1).max().unwrap_or(0);
        let n_lanes = self.n_lanes.max(seq.lane_report.lanes).max(used);
        let mut fifos: Vec<VecDeque<Mu>> = vec![VecDeque::with_capacity(self.fifo_depth); n_lanes];
        let mut peak_fill = vec![0; n_lanes];
        let mut slack = Vec::with_capacity(seq.len());
        let mut stalls = 0;
        let mut stall_mu = 0;

        let start = seq.events.first().map_or(0, |ev| ev.timestamp);
        let mut counter = start - self.initial_slack_mu;

        for ev in seq.program_order() {
            drain(&mut fifos, counter);
            let fifo = &mut fifos[ev.lane];
            if fifo.len() >= self.fifo_depth {
                if let Some(&head) = fifo.front() {
                    if head > counter {
                        stall_mu += head - counter;
                        counter = head;
                    }
                    stalls += 1;
                    tracing::debug!(lane = ev.lane, counter, "FIFO full, CPU stalled");
                }
                drain(&mut fifos, counter);
            }

            let event_slack = ev.timestamp - counter;
            if event_slack < 0 {
                return Err(RunError::Underflow {
                    seq: ev.seq,
                    device: ev.device.clone(),
                    channel: ev.channel.clone(),
                    timestamp: ev.timestamp,
                    counter,
                });
            }
            slack.push(event_slack);

            let fifo = &mut fifos[ev.lane];
            fifo.push_back(ev.timestamp);
            peak_fill[ev.lane] = peak_fill[ev.lane].max(fifo.len());
            counter += self.submit_cost_mu;
        }

        let slack_mu = Array1::from(slack);
        let min_slack_mu = slack_mu.iter().copied().min().unwrap_or(0);
        let report = RunReport {
            events: seq.len(),
            slack_mu,
            min_slack_mu,
            stalls,
            stall_mu,
            peak_fill,
            end_counter_mu: counter,
        };
        tracing::info!(
            events = report.events,
            min_slack_mu = report.min_slack_mu,
            stalls = report.stalls,
            "core device analysis passed"
        );
        Ok(report)
    }
}

fn drain(fifos: &mut [VecDeque<Mu>], counter: Mu) {
    for fifo in fifos.iter_mut() {
        while fifo.front().is_some_and(|&ts| ts <= counter) {
            fifo.pop_front();
        }
    }
}
