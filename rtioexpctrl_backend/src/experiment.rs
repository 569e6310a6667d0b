//! # Sequence execution with the `experiment` Module
//!
//! This module extends [`rtiocompiler_backend::Experiment`] with what happens after a
//! sequence is compiled: checking it against the core device and streaming the per-device
//! event lists to output sinks.
//!
//! ## Key Features:
//!
//! - **Slack analysis:** [`Experiment::check`] compiles the timeline and replays it against
//!   the [`CoreDevice`] model built from the `[rtio]` configuration.
//!
//! - **One-shot streaming:** [`Experiment::stream_exp`] streams every compiled device in
//!   parallel on a [`rayon`] pool, the primary device starting last in every repetition.
//!
//! - **Long-lived workers:** [`Experiment::spawn_workers`] starts one thread per compiled
//!   device. [`StreamWorkers::run`] broadcasts a stream command through a [`CmdChan`] and
//!   waits until every worker has delivered its events; chunks travel to the sink over a
//!   bounded channel whose capacity is the lane FIFO depth.
//!
//! ## How to Use:
//!
//! 1. Build the experiment with [`Experiment::from_config`] and schedule writes through the
//!    [`BaseExperiment`] trait (or [`Experiment::schedule_default_cycle`]).
//! 2. Call [`Experiment::check`] to compile and verify slack.
//! 3. Stream with [`Experiment::stream_exp`] or a [`StreamWorkers`] pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use indexmap::IndexMap;
use rayon::prelude::*;

use rtiocompiler_backend::config::RtioConfig;
use rtiocompiler_backend::*;

use crate::core_device::{CoreDevice, RunReport};
use crate::device::*;
use crate::error::{Result, RunError};
use crate::utils::Semaphore;
use crate::worker_cmd_chan::{CmdChan, WorkerCmd};

/// An extended version of [`rtiocompiler_backend::Experiment`] that also knows the core
/// device it runs on.
pub struct Experiment {
    devices: IndexMap<String, Device>,
    timeline: Timeline,
    rtio: RtioConfig,
}

impl_exp_boilerplate!(Experiment);

impl Experiment {
    pub fn new(timebase: TimeBase, rtio: RtioConfig, lookbehind_mu: Mu) -> Self {
        Self {
            devices: IndexMap::new(),
            timeline: Timeline::new(timebase, rtio.lanes, lookbehind_mu),
            rtio,
        }
    }

    pub fn from_config(cfg: &SystemConfig) -> Result<Self> {
        cfg.validate()?;
        let timebase = cfg.timebase();
        let mut exp = Self::new(
            timebase,
            cfg.rtio.clone(),
            timebase.seconds_to_mu(cfg.timing.lookbehind_s),
        );
        exp.load_config(cfg)?;
        Ok(exp)
    }

    pub fn rtio(&self) -> &RtioConfig {
        &self.rtio
    }

    pub fn core_device(&self) -> CoreDevice {
        CoreDevice::from_config(&self.rtio, &self.timebase())
    }

    pub fn compiled_devices(&self) -> Vec<&Device> {
        self.devices.values().filter(|dev| dev.is_compiled()).collect()
    }

    /// Schedules one standard cycle from the controllers listed in `cfg`: beams and servos
    /// to their defaults, every ramp once, then all beams on and off again.
    ///
    /// The cycle starts at the largest latency of any channel, so that every write lands at
    /// a non-negative timestamp.
    pub fn schedule_default_cycle(&mut self, cfg: &SystemConfig) -> Result<()> {
        let beams = BeamController::new(cfg.beams.clone())?;
        let servos = SuServoController::new(cfg.servos.clone())?;
        let start = self
            .devices
            .values()
            .flat_map(|dev| {
                dev.channels()
                    .values()
                    .map(|chan| chan.latency_mu())
                    .chain([dev.attenuator_latency_mu()])
            })
            .max()
            .unwrap_or(0);
        self.at_mu(start);

        beams.set_to_defaults(self)?;
        servos.set_defaults(self)?;
        for spec in &cfg.ramps {
            RampingPhase::new(spec.clone())?.run(self)?;
        }
        let names = beams.names();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        if !names.is_empty() {
            // keep the shutters' early writes clear of the ramps
            self.delay_mu(start);
            beams.turn_on(self, &names)?;
            beams.turn_off(self, &names)?;
        }
        tracing::info!(
            beams = names.len(),
            servos = cfg.servos.len(),
            ramps = cfg.ramps.len(),
            end_mu = self.now_mu(),
            "default cycle scheduled"
        );
        Ok(())
    }

    /// Compiles the timeline and checks it against the core device model.
    pub fn check(&mut self, stop_time: Option<Mu>) -> Result<(CompiledSequence, RunReport)> {
        let seq = self.compile(stop_time)?;
        let report = self.core_device().analyze(&seq)?;
        Ok((seq, report))
    }

    /// Streams every compiled device `nreps` times, one thread per device.
    pub fn stream_exp(&self, sink: &dyn OutputSink, nreps: usize) -> Result<()> {
        let devices = self.compiled_devices();
        if devices.is_empty() {
            return Err(RunError::NothingToStream);
        }
        let num_devices = devices.len();
        let chunk_len = self.rtio.fifo_depth;
        let sem = Semaphore::new(1);
        // every device blocks on the start semaphore, so each needs a thread of its own
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_devices)
            .build()
            .map_err(|e| RunError::Worker(e.to_string()))?;
        let mut timer = TickTimer::new();
        pool.install(|| {
            devices
                .par_iter()
                .try_for_each(|dev| dev.stream_task(sink, &sem, num_devices, chunk_len, nreps))
        })?;
        tracing::info!(devices = num_devices, nreps, elapsed_ms = timer.tick(), "experiment streamed");
        Ok(())
    }

    /// Starts one long-lived stream worker per compiled device.
    pub fn spawn_workers(&self, sink: Arc<dyn OutputSink>) -> Result<StreamWorkers> {
        let devices = self.compiled_devices();
        if devices.is_empty() {
            return Err(RunError::NothingToStream);
        }
        let num_devices = devices.len();
        let chunk_len = self.rtio.fifo_depth;
        let cmd_chan = CmdChan::new();
        let sem = Arc::new(Semaphore::new(1));
        let (msg_send, msg_recv) = channel::bounded::<WorkerMsg>(self.rtio.fifo_depth);
        let (ack_send, ack_recv) = channel::unbounded();

        let mut handles = Vec::with_capacity(num_devices + 1);
        for dev in devices {
            let name = dev.name().to_string();
            let events = dev.compiled_events();
            let is_primary = dev.is_primary();
            let mut recvr = cmd_chan.new_recvr();
            let sink = ChannelSink {
                tx: msg_send.clone(),
            };
            let sem = sem.clone();
            handles.push(thread::spawn(move || loop {
                let result = match recvr.recv() {
                    Ok(WorkerCmd::Stream(nreps)) => stream_events(
                        &name, &events, is_primary, &sink, &sem, num_devices, chunk_len, nreps,
                    ),
                    Ok(WorkerCmd::Close) => break,
                    Err(e) => Err(e),
                };
                let done = WorkerMsg::Done {
                    device: name.clone(),
                    result,
                };
                if sink.tx.send(done).is_err() {
                    break;
                }
            }));
        }
        drop(msg_send);
        handles.push(thread::spawn(move || collect(msg_recv, ack_send, sink)));

        tracing::debug!(workers = num_devices, "stream workers started");
        Ok(StreamWorkers {
            cmd_chan,
            ack_recv,
            handles,
            n_workers: num_devices,
        })
    }
}

enum WorkerMsg {
    Chunk {
        device: String,
        rep: usize,
        events: Vec<RtioEvent>,
    },
    Done {
        device: String,
        result: Result<()>,
    },
}

/// Forwards the chunks of a worker to the collector thread.
struct ChannelSink {
    tx: Sender<WorkerMsg>,
}

impl OutputSink for ChannelSink {
    fn write_chunk(&self, device: &str, rep: usize, chunk: &[RtioEvent]) -> Result<()> {
        self.tx
            .send(WorkerMsg::Chunk {
                device: device.to_string(),
                rep,
                events: chunk.to_vec(),
            })
            .map_err(|_| RunError::Worker("collector disconnected".into()))
    }
}

/// Writes chunks to the sink; acknowledges a worker once all its chunks are written.
fn collect(msg_recv: Receiver<WorkerMsg>, ack_send: Sender<(String, Result<()>)>, sink: Arc<dyn OutputSink>) {
    let mut failures: HashMap<String, RunError> = HashMap::new();
    for msg in msg_recv.iter() {
        match msg {
            WorkerMsg::Chunk {
                device,
                rep,
                events,
            } => {
                if failures.contains_key(&device) {
                    continue;
                }
                if let Err(e) = sink.write_chunk(&device, rep, &events) {
                    failures.insert(device, e);
                }
            }
            WorkerMsg::Done { device, result } => {
                let result = match failures.remove(&device) {
                    Some(e) => Err(e),
                    None => result,
                };
                if ack_send.send((device, result)).is_err() {
                    break;
                }
            }
        }
    }
}

/// Handle to the threads started by [`Experiment::spawn_workers`].
pub struct StreamWorkers {
    cmd_chan: CmdChan,
    ack_recv: Receiver<(String, Result<()>)>,
    handles: Vec<JoinHandle<()>>,
    n_workers: usize,
}

impl StreamWorkers {
    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    /// Streams every device `nreps` times and waits until the sink has received everything.
    pub fn run(&mut self, nreps: usize) -> Result<()> {
        self.cmd_chan.send(WorkerCmd::Stream(nreps));
        let mut first_err = None;
        for _ in 0..self.n_workers {
            let (device, result) = self
                .ack_recv
                .recv()
                .map_err(|_| RunError::Worker("stream workers exited".into()))?;
            if let Err(e) = result {
                tracing::warn!(device = %device, error = %e, "stream worker failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.handles.is_empty() {
            return Ok(());
        }
        self.cmd_chan.send(WorkerCmd::Close);
        let mut panicked = 0;
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        tracing::debug!(workers = self.n_workers, "stream workers closed");
        if panicked > 0 {
            return Err(RunError::Worker(format!("{panicked} stream threads panicked")));
        }
        Ok(())
    }
}

impl Drop for StreamWorkers {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "stream workers did not shut down cleanly");
        }
    }
}
