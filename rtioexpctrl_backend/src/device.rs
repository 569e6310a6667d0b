//! Streaming of compiled device events to output sinks.

use parking_lot::Mutex;

use rtiocompiler_backend::*;

use crate::error::{Result, RunError};
use crate::utils::{Semaphore, StreamCounter};

/// Receives the compiled events of a device, chunk by chunk.
pub trait OutputSink: Send + Sync {
    fn write_chunk(&self, device: &str, rep: usize, chunk: &[RtioEvent]) -> Result<()>;
}

/// Logs every chunk; used by the command-line binary.
#[derive(Debug, Default)]
pub struct LogSink;

impl OutputSink for LogSink {
    fn write_chunk(&self, device: &str, rep: usize, chunk: &[RtioEvent]) -> Result<()> {
        if let (Some(first), Some(last)) = (chunk.first(), chunk.last()) {
            tracing::info!(
                device,
                rep,
                events = chunk.len(),
                first_mu = first.timestamp,
                last_mu = last.timestamp,
                "chunk streamed"
            );
        }
        for ev in chunk {
            tracing::trace!(event = %ev, "event");
        }
        Ok(())
    }
}

/// Keeps every streamed event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    written: Mutex<Vec<(String, usize, RtioEvent)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far as `(device, rep, event)`, in arrival order.
    pub fn written(&self) -> Vec<(String, usize, RtioEvent)> {
        self.written.lock().clone()
    }

    /// Events of one device and repetition, in arrival order.
    pub fn events(&self, device: &str, rep: usize) -> Vec<RtioEvent> {
        self.written
            .lock()
            .iter()
            .filter(|(d, r, _)| d == device && *r == rep)
            .map(|(_, _, ev)| ev.clone())
            .collect()
    }
}

impl OutputSink for MemorySink {
    fn write_chunk(&self, device: &str, rep: usize, chunk: &[RtioEvent]) -> Result<()> {
        let mut written = self.written.lock();
        written.extend(chunk.iter().map(|ev| (device.to_string(), rep, ev.clone())));
        Ok(())
    }
}

/// Start synchronisation for one repetition: the primary device starts only after every
/// other device has released the semaphore.
pub fn sync_start(sem: &Semaphore, is_primary: bool, num_devices: usize) {
    if is_primary {
        (0..num_devices).for_each(|_| sem.acquire());
        sem.release(); // restore the count to 1 for the next repetition
    } else {
        sem.release();
    }
}

/// Streams `events` to `sink` in chunks of at most `chunk_len`, `nreps` times.
pub fn stream_events(
    name: &str,
    events: &[RtioEvent],
    is_primary: bool,
    sink: &dyn OutputSink,
    sem: &Semaphore,
    num_devices: usize,
    chunk_len: usize,
    nreps: usize,
) -> Result<()> {
    let mut timer = TickTimer::new();
    let mut counter = StreamCounter::new(events.len(), chunk_len);
    for rep in 0..nreps {
        sync_start(sem, is_primary, num_devices);
        loop {
            let (start_pos, end_pos) = counter.tick_next();
            if let Err(e) = sink.write_chunk(name, rep, &events[start_pos..end_pos]) {
                // the primary still waits on the repetitions this device will not start
                if !is_primary {
                    (rep + 1..nreps).for_each(|_| sem.release());
                }
                return Err(e);
            }
            if end_pos == counter.end_pos() {
                break;
            }
        }
        tracing::debug!(device = name, rep, elapsed_ms = timer.tick(), "repetition streamed");
    }
    Ok(())
}

pub trait StreamableDevice: BaseDevice + Sync + Send {
    fn stream_task(
        &self,
        sink: &dyn OutputSink,
        sem: &Semaphore,
        num_devices: usize,
        chunk_len: usize,
        nreps: usize,
    ) -> Result<()> {
        if !self.is_compiled() {
            return Err(RunError::NotCompiled(self.name().to_string()));
        }
        let events = self.compiled_events();
        stream_events(
            self.name(),
            &events,
            self.is_primary(),
            sink,
            sem,
            num_devices,
            chunk_len,
            nreps,
        )
    }
}

impl StreamableDevice for Device {}

#[cfg(test)]
mod test {
    use super::*;

    fn compiled_device() -> Device {
        let mut dev = Device::new("ttl0", DeviceKind::Ttl, 0);
        dev.add_channel("ttl0", 0, ChannelState::default()).unwrap();
        for (i, t) in [8, 16, 24, 32, 40].into_iter().enumerate() {
            dev.chan_("ttl0").unwrap().add_event(RtioEvent {
                timestamp: t,
                device: "ttl0".to_string(),
                channel: "ttl0".to_string(),
                action: Action::TtlOn,
                seq: i as u64,
                lane: 0,
            });
        }
        dev.compile();
        dev
    }

    #[test]
    fn stream_in_chunks_and_repeat() {
        let dev = compiled_device();
        let sink = MemorySink::new();
        let sem = Semaphore::new(1);
        dev.stream_task(&sink, &sem, 1, 2, 3).unwrap();

        assert_eq!(sink.written().len(), 15);
        for rep in 0..3 {
            let ts: Vec<Mu> = sink.events("ttl0", rep).iter().map(|e| e.timestamp).collect();
            assert_eq!(ts, vec![8, 16, 24, 32, 40]);
        }
    }

    #[test]
    fn uncompiled_device_is_refused() {
        let dev = Device::new("ttl0", DeviceKind::Ttl, 0);
        let sink = MemorySink::new();
        let sem = Semaphore::new(1);
        assert!(matches!(
            dev.stream_task(&sink, &sem, 1, 2, 1),
            Err(RunError::NotCompiled(_))
        ));
    }
}
