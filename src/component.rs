//! Host-facing component: port commands, stage threads and teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::buffer::{Buffer, BufferOrigin, MmapAllocator, PoolCensus};
use crate::codec::CodecFamily;
use crate::convert::PixelConverter;
use crate::device::{CodecDevice, Coding};
use crate::error::{Error, Result};
use crate::host::{Host, HostEvent};
use crate::pipeline::ledger::{OutputTagTracker, TimestampLedger};
use crate::pipeline::port::{Geometry, Port, PortDirection, PortMode, PortState};
use crate::pipeline::{
    self, sink, source, Bypass, Pipeline, Signal, SourceCursor, StageStats, Step,
};
use crate::{Config, CONFIG};

/// What kind of component to build.
#[derive(Clone)]
pub struct ComponentSpec {
    pub family: CodecFamily,
    pub coding: Coding,
    pub source_mode: PortMode,
    pub sink_mode: PortMode,
    /// Sink geometry announced to the host before the stream is parsed.
    pub advertised: Geometry,
    /// Set for encoders; replaces frame splitting on the source side.
    pub converter: Option<Arc<dyn PixelConverter>>,
}

impl ComponentSpec {
    pub fn decoder(family: CodecFamily, coding: Coding, advertised: Geometry) -> Self {
        Self {
            family,
            coding,
            source_mode: PortMode::Copy,
            sink_mode: PortMode::Copy,
            advertised,
            converter: None,
        }
    }

    pub fn encoder(converter: Arc<dyn PixelConverter>, advertised: Geometry) -> Self {
        Self {
            family: CodecFamily::Generic,
            coding: Coding::Nv12,
            source_mode: PortMode::Copy,
            sink_mode: PortMode::Copy,
            advertised,
            converter: Some(converter),
        }
    }
}

/// Snapshot of the stage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub units_submitted: u64,
    pub units_dropped: u64,
    pub frames_emitted: u64,
    pub bypass_emitted: u64,
    pub device_errors: u64,
    pub tag_misses: u64,
    pub tags_aliased: u64,
}

const STAGES: [(&str, fn(&Pipeline) -> Step); 4] = [
    ("src-in", source::source_input),
    ("src-out", source::source_output),
    ("sink-in", sink::sink_input),
    ("sink-out", sink::sink_output),
];

pub struct Component {
    pipeline: Arc<Pipeline>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Component {
    #[instrument(skip_all, fields(name = %name))]
    pub fn new(
        name: &str,
        spec: ComponentSpec,
        device: Arc<dyn CodecDevice>,
        host: Arc<dyn Host>,
        config: Config,
    ) -> Result<Self> {
        let ledger_size = config.pipeline.ledger_size;
        if ledger_size < 2 {
            return Err(Error::Config(format!(
                "ledger size {ledger_size} leaves no room for reordering"
            )));
        }
        if ledger_size <= spec.advertised.min_buffers + 1 {
            warn!(
                ledger_size,
                reorder_depth = spec.advertised.min_buffers,
                "ledger may alias tags still in flight"
            );
        }

        let allocator = Arc::new(MmapAllocator);
        let source = Port::new(
            PortDirection::Source,
            spec.source_mode,
            allocator.clone(),
            spec.advertised.clone(),
            config.buffers.input_buffer_count,
        );
        let sink_count = spec.advertised.min_buffers + config.buffers.extra_dpb_buffers;
        let sink = Port::new(
            PortDirection::Sink,
            spec.sink_mode,
            allocator,
            spec.advertised.clone(),
            sink_count,
        );

        let pipeline = Pipeline {
            name: name.to_string(),
            source,
            sink,
            device,
            host,
            codec: Mutex::new(spec.family.capability(spec.coding)),
            converter: spec.converter,
            ledger: TimestampLedger::new(ledger_size),
            tracker: Mutex::new(OutputTagTracker::new(
                ledger_size,
                config.pipeline.dts_mode,
                config.pipeline.max_consecutive_tag_misses,
            )),
            bypass: Bypass::default(),
            cursor: Mutex::new(SourceCursor::default()),
            source_started: Signal::default(),
            sink_started: Signal::default(),
            behavior_eos: AtomicBool::new(false),
            geometry_probed: AtomicBool::new(false),
            sink_setup_failed: AtomicBool::new(false),
            exit: AtomicBool::new(false),
            stats: CachePadded::new(StageStats::default()),
            config,
        };
        info!(family = ?spec.family, coding = ?spec.coding, "component created");

        Ok(Self {
            pipeline: Arc::new(pipeline),
            threads: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Build against the process-wide configuration.
    pub fn from_global(
        name: &str,
        spec: ComponentSpec,
        device: Arc<dyn CodecDevice>,
        host: Arc<dyn Host>,
    ) -> Result<Self> {
        let config = Config::clone(&CONFIG.load());
        Self::new(name, spec, device, host, config)
    }

    pub fn name(&self) -> &str {
        &self.pipeline.name
    }

    /// Shared state, for callers that drive stages by hand.
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Spawn the four stage threads. Calling it again while running is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return Ok(());
        }
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::ProtocolViolation("component already stopped".into()));
        }

        let cores = if self.pipeline.config.pipeline.pin_threads {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        for (index, (stage_name, stage)) in STAGES.into_iter().enumerate() {
            let shared = self.pipeline.clone();
            let core = (!cores.is_empty()).then(|| cores[index % cores.len()]);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", shared.name, stage_name))
                .spawn(move || {
                    if let Some(core) = core {
                        if !core_affinity::set_for_current(core) {
                            warn!(stage = stage_name, core = core.id, "pinning failed");
                        }
                    }
                    pipeline::drive(&shared, stage, stage_name);
                })?;
            threads.push(handle);
        }
        info!(component = %self.pipeline.name, "stages running");
        Ok(())
    }

    pub fn port_state(&self, direction: PortDirection) -> PortState {
        self.pipeline.port(direction).state()
    }

    pub fn enable_port(&self, direction: PortDirection) -> Result<()> {
        let p = &self.pipeline;
        let port = p.port(direction);
        if port.state() != PortState::Disabled {
            return Ok(());
        }
        port.enable()?;
        if direction == PortDirection::Sink {
            p.sink_setup_failed.store(false, Ordering::Release);
        }
        p.host.on_event(HostEvent::PortEnabled { port: direction });
        Ok(())
    }

    /// Record `count` host buffers for a port; the port is Populated once
    /// its buffer count is reached. A copy-mode source provisions its pool then.
    #[instrument(skip(self), fields(component = %self.pipeline.name))]
    pub fn populate(&self, direction: PortDirection, count: usize) -> Result<PortState> {
        let p = &self.pipeline;
        let port = p.port(direction);
        let state = port.register_buffers(count)?;
        let provision = state == PortState::Populated
            && direction == PortDirection::Source
            && port.mode == PortMode::Copy
            && !port.pool.is_allocated();
        if provision {
            let buffers = &p.config.buffers;
            // Encoders take raw pictures; decoders take one flat compressed plane.
            let plane_sizes = match p.converter {
                Some(_) => port.geometry().plane_sizes,
                None => vec![buffers.input_buffer_size],
            };
            for buffer in port
                .pool
                .allocate(buffers.input_buffer_count, &plane_sizes)?
            {
                p.recycle(PortDirection::Source, buffer);
            }
        }
        if state == PortState::Populated {
            p.sink_started.kick();
        }
        Ok(state)
    }

    /// Hand a filled input buffer to the component.
    pub fn empty_buffer(&self, buffer: Buffer) -> Result<()> {
        self.submit_client(PortDirection::Source, buffer)
    }

    /// Hand an empty output buffer to the component.
    pub fn fill_buffer(&self, buffer: Buffer) -> Result<()> {
        self.submit_client(PortDirection::Sink, buffer)
    }

    fn submit_client(&self, direction: PortDirection, buffer: Buffer) -> Result<()> {
        let p = &self.pipeline;
        if !matches!(buffer.origin, BufferOrigin::Client(_)) {
            return Err(Error::ProtocolViolation(format!(
                "{direction} port got a buffer it does not own: {buffer:?}"
            )));
        }
        let port = p.port(direction);
        if port.state() == PortState::Disabled {
            p.return_to_host(direction, buffer);
            return Err(Error::InvalidState {
                port: direction,
                op: "queue buffer",
            });
        }
        if let Err(buffer) = port.client.enqueue(buffer) {
            p.return_to_host(direction, buffer);
            return Err(Error::ResourceExhausted(format!(
                "{direction} client queue refused buffer"
            )));
        }
        Ok(())
    }

    /// Return every buffer queued on `direction` and resume. Safe to repeat.
    #[instrument(skip(self), fields(component = %self.pipeline.name))]
    pub fn flush(&self, direction: PortDirection) -> Result<()> {
        let p = &self.pipeline;
        let port = p.port(direction);
        if port.state() == PortState::Disabled {
            return Err(Error::InvalidState {
                port: direction,
                op: "flush",
            });
        }
        if !port.begin_flush() {
            debug!(port = %direction, state = ?port.state(), "nothing to flush");
            p.host.on_event(HostEvent::FlushComplete { port: direction });
            return Ok(());
        }

        let mut returned = port.client.begin_flush();
        returned.extend(port.work.begin_flush());
        if direction == PortDirection::Sink {
            let dropped = p.bypass.clear();
            if dropped > 0 {
                debug!(dropped, "pending end of stream discarded");
            }
        }
        self.wake(direction);

        let cycle = port.lock_exclusive();
        returned.extend(p.device.flush(direction));
        returned.extend(port.client.reset());
        returned.extend(port.work.reset());
        if direction == PortDirection::Source {
            returned.extend(self.discard_cursor());
            p.ledger.reset();
            p.tracker.lock().reset(p.ledger.size());
            p.behavior_eos.store(false, Ordering::Release);
        }
        port.client.end_flush();
        port.work.end_flush();

        let count = returned.len();
        for buffer in returned {
            self.settle(direction, buffer);
        }
        port.end_flush();
        drop(cycle);

        info!(port = %direction, returned = count, "flush complete");
        p.host.on_event(HostEvent::FlushComplete { port: direction });
        Ok(())
    }

    /// Return all buffers, release the pool and move the port to Disabled.
    #[instrument(skip(self), fields(component = %self.pipeline.name))]
    pub fn disable_port(&self, direction: PortDirection) -> Result<()> {
        let p = &self.pipeline;
        let port = p.port(direction);
        let previous = port.mark_disabled();

        let mut stranded = port.client.begin_flush();
        stranded.extend(port.work.begin_flush());
        self.wake(direction);

        let cycle = port.lock_exclusive();
        stranded.extend(p.device.flush(direction));
        stranded.extend(port.client.reset());
        stranded.extend(port.work.reset());
        match direction {
            PortDirection::Source => {
                stranded.extend(self.discard_cursor());
                p.ledger.reset();
                p.tracker.lock().reset(p.ledger.size());
                p.source_started.reset();
                p.geometry_probed.store(false, Ordering::Release);
                p.behavior_eos.store(false, Ordering::Release);
            }
            PortDirection::Sink => {
                port.set_reconfigure_pending(false);
                p.sink_started.reset();
                p.sink_setup_failed.store(false, Ordering::Release);
            }
        }
        for buffer in stranded {
            if let BufferOrigin::Client(_) = buffer.origin {
                p.return_to_host(direction, buffer);
            }
        }
        port.pool.release_all();
        port.client.end_flush();
        port.work.end_flush();
        drop(cycle);

        info!(port = %direction, ?previous, "port disabled");
        p.host.on_event(HostEvent::PortDisabled { port: direction });
        Ok(())
    }

    pub fn stats(&self) -> Stats {
        let s = &self.pipeline.stats;
        Stats {
            units_submitted: s.units_submitted.load(Ordering::Relaxed),
            units_dropped: s.units_dropped.load(Ordering::Relaxed),
            frames_emitted: s.frames_emitted.load(Ordering::Relaxed),
            bypass_emitted: s.bypass_emitted.load(Ordering::Relaxed),
            device_errors: s.device_errors.load(Ordering::Relaxed),
            tag_misses: s.tag_misses.load(Ordering::Relaxed),
            tags_aliased: self.pipeline.ledger.aliased(),
        }
    }

    pub fn census(&self, direction: PortDirection) -> PoolCensus {
        self.pipeline.port(direction).pool.census()
    }

    /// Stop the stage threads and give every client buffer back. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let p = &self.pipeline;
        p.exit.store(true, Ordering::Release);
        for port in [&p.source, &p.sink] {
            port.client.close();
            port.work.close();
            port.notify();
        }
        p.bypass.clear();
        p.source_started.set();
        p.sink_started.set();
        p.device.stop();

        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                warn!(component = %p.name, "stage thread panicked");
            }
        }

        for direction in [PortDirection::Source, PortDirection::Sink] {
            let port = p.port(direction);
            let mut stranded = p.device.flush(direction);
            stranded.extend(port.client.reset());
            stranded.extend(port.work.reset());
            if direction == PortDirection::Source {
                stranded.extend(self.discard_cursor());
            }
            for buffer in stranded {
                if let BufferOrigin::Client(_) = buffer.origin {
                    p.return_to_host(direction, buffer);
                }
            }
            port.pool.release_all();
        }
        info!(component = %p.name, stats = ?self.stats(), "component stopped");
    }

    fn wake(&self, direction: PortDirection) {
        let p = &self.pipeline;
        p.port(direction).notify();
        match direction {
            PortDirection::Source => p.source_started.kick(),
            PortDirection::Sink => p.wake_sink(),
        }
    }

    /// Half-assembled unit and partially consumed client buffer.
    fn discard_cursor(&self) -> Vec<Buffer> {
        let mut cursor = self.pipeline.cursor.lock();
        let mut held = Vec::new();
        if let Some(pending) = cursor.pending.take() {
            held.push(pending.unit);
        }
        held.extend(cursor.client.take());
        held
    }

    /// After a flush: pool buffers go back to work, client buffers to the host.
    fn settle(&self, direction: PortDirection, buffer: Buffer) {
        let p = &self.pipeline;
        match buffer.origin {
            BufferOrigin::Pool(_) => p.recycle(direction, buffer),
            BufferOrigin::Client(_) => p.return_to_host(direction, buffer),
        }
    }
}

impl Drop for Component {
    fn drop(&mut self) {
        self.stop();
    }
}
