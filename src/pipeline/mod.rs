//! Shared state of one running component and the four stage loops.
//!
//! Buffers only ever move through queues, so each stage owns whatever it is
//! currently working on. Stages are written as `run_once` functions that do
//! at most one unit of work and never block without a bound; the thread body
//! just calls them until the exit flag is raised.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::buffer::{Buffer, BufferFlags, BufferOrigin, EntryState};
use crate::codec::CodecCapability;
use crate::convert::PixelConverter;
use crate::device::CodecDevice;
use crate::error::Error;
use crate::host::{Host, HostEvent};
use crate::Config;

pub mod ledger;
pub mod port;
pub mod queue;
pub mod sink;
pub mod source;

use ledger::{OutputTagTracker, TimestampLedger};
use port::{Port, PortDirection, PortMode};

/// Outcome of one stage iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Worked,
    Idle,
    Exit,
}

/// One-shot flag stages can wait on.
#[derive(Default)]
pub struct Signal {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn set(&self) {
        *self.set.lock() = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.set.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Wait up to `timeout` for the flag; returns its value.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut set = self.set.lock();
        if !*set {
            self.cond.wait_for(&mut set, timeout);
        }
        *set
    }

    /// Wake waiters without setting the flag.
    pub fn kick(&self) {
        self.cond.notify_all();
    }
}

/// End of stream that never went through the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BypassRecord {
    pub flags: BufferFlags,
    pub timestamp: i64,
}

#[derive(Default)]
pub struct Bypass {
    records: Mutex<VecDeque<BypassRecord>>,
    drained: Condvar,
}

impl Bypass {
    pub fn push(&self, record: BypassRecord) {
        self.records.lock().push_back(record);
    }

    pub fn peek(&self) -> Option<BypassRecord> {
        self.records.lock().front().copied()
    }

    pub fn take(&self) -> Option<BypassRecord> {
        let mut records = self.records.lock();
        let record = records.pop_front();
        if records.is_empty() {
            self.drained.notify_all();
        }
        record
    }

    pub fn is_pending(&self) -> bool {
        !self.records.lock().is_empty()
    }

    /// Wait up to `timeout` for every record to be emitted.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let mut records = self.records.lock();
        if !records.is_empty() {
            self.drained.wait_for(&mut records, timeout);
        }
        records.is_empty()
    }

    pub fn clear(&self) -> usize {
        let mut records = self.records.lock();
        let cleared = records.len();
        records.clear();
        self.drained.notify_all();
        cleared
    }
}

#[derive(Default)]
pub struct StageStats {
    pub units_submitted: AtomicU64,
    pub units_dropped: AtomicU64,
    pub frames_emitted: AtomicU64,
    pub bypass_emitted: AtomicU64,
    pub device_errors: AtomicU64,
    pub tag_misses: AtomicU64,
}

impl StageStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Unit being assembled by SourceInput across iterations.
pub struct PendingUnit {
    pub unit: Buffer,
    /// Earlier client data already sits in `unit`.
    pub accumulating: bool,
}

/// Source-side work carried between SourceInput iterations.
#[derive(Default)]
pub struct SourceCursor {
    pub pending: Option<PendingUnit>,
    /// Client buffer with data still to be split into units.
    pub client: Option<Buffer>,
}

pub struct Pipeline {
    pub name: String,
    pub config: Config,
    pub source: Port,
    pub sink: Port,
    pub device: Arc<dyn CodecDevice>,
    pub host: Arc<dyn Host>,
    pub codec: Mutex<Box<dyn CodecCapability>>,
    pub converter: Option<Arc<dyn PixelConverter>>,
    pub ledger: TimestampLedger,
    pub tracker: Mutex<OutputTagTracker>,
    pub bypass: Bypass,
    pub cursor: Mutex<SourceCursor>,
    /// First unit reached the device.
    pub source_started: Signal,
    /// Sink buffers are queued on the device.
    pub sink_started: Signal,
    /// An end-of-stream unit with payload was submitted; its output must keep a frame's length.
    pub behavior_eos: AtomicBool,
    pub geometry_probed: AtomicBool,
    /// Sink setup failed; not retried until the sink port is re-enabled.
    pub sink_setup_failed: AtomicBool,
    pub exit: AtomicBool,
    pub stats: CachePadded<StageStats>,
}

impl Pipeline {
    pub fn port(&self, direction: PortDirection) -> &Port {
        match direction {
            PortDirection::Source => &self.source,
            PortDirection::Sink => &self.sink,
        }
    }

    pub fn exiting(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    pub fn queue_wait(&self) -> Duration {
        self.config.pipeline.queue_wait()
    }

    pub fn device_timeout(&self) -> Duration {
        self.config.pipeline.device_timeout()
    }

    /// Raise a steady-state error without stopping the stage.
    pub fn report(&self, error: Error) {
        let recoverable = error.is_recoverable();
        if recoverable {
            warn!(component = %self.name, "{}", error);
        } else {
            error!(component = %self.name, "{}", error);
        }
        self.host.on_event(HostEvent::Error { error, recoverable });
    }

    pub fn report_device_error(&self, error: Error) {
        StageStats::bump(&self.stats.device_errors);
        metrics::counter!("device_errors").increment(1);
        self.report(error);
    }

    /// Wake both sink stages so they re-check the bypass queue.
    pub fn wake_sink(&self) {
        self.sink.client.kick();
        self.sink.work.kick();
        self.sink.notify();
        self.sink_started.kick();
    }

    /// Put a buffer back where it belongs: pool buffers into the port's work
    /// queue, client buffers to the host.
    pub fn recycle(&self, direction: PortDirection, mut buffer: Buffer) {
        let port = self.port(direction);
        match buffer.origin {
            BufferOrigin::Pool(_) => match port.pool.find_by_identity(&buffer) {
                Some(slot) => {
                    buffer.reset();
                    port.pool.mark(slot, EntryState::Queued);
                    if let Err(buffer) = port.work.enqueue(buffer) {
                        port.work.requeue_front(buffer);
                    }
                }
                None => {
                    warn!(port = %direction, ?buffer, "buffer not in pool, dropped");
                }
            },
            BufferOrigin::Client(_) => self.return_to_host(direction, buffer),
        }
    }

    /// Hand a client buffer back with nothing left to consume.
    pub fn return_to_host(&self, direction: PortDirection, mut buffer: Buffer) {
        if direction == PortDirection::Source {
            buffer.offset = 0;
            buffer.remaining = 0;
        }
        self.host.return_buffer(direction, buffer);
    }

    /// Give a client buffer back to the sink side for reuse.
    pub(crate) fn recycle_sink_client(&self, buffer: Buffer) {
        match self.sink.mode {
            PortMode::Share => self.sink.client.requeue_front(buffer),
            PortMode::Copy => self.return_to_host(PortDirection::Sink, buffer),
        }
    }
}

/// Run a stage until exit is requested.
pub fn drive(pipeline: &Pipeline, stage: fn(&Pipeline) -> Step, name: &str) {
    debug!(component = %pipeline.name, stage = name, "stage started");
    while !pipeline.exiting() {
        if stage(pipeline) == Step::Exit {
            break;
        }
    }
    debug!(component = %pipeline.name, stage = name, "stage stopped");
}
