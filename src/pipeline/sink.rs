//! SinkInput and SinkOutput: empty buffers to the device, pictures to the host.

use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, info, instrument, trace};

use crate::buffer::{Buffer, BufferFlags, EntryState};
use crate::device::{DisplayStatus, OutputCompletion};
use crate::error::{Error, Result};
use crate::host::HostEvent;
use crate::pipeline::port::{PortDirection, PortMode};
use crate::pipeline::queue::Dequeue;
use crate::pipeline::{Pipeline, StageStats, Step};

/// Keep the device supplied with empty output buffers.
pub fn sink_input(p: &Pipeline) -> Step {
    if p.exiting() {
        return Step::Exit;
    }
    let wait = p.queue_wait();
    if p.bypass.is_pending() {
        p.wake_sink();
        p.bypass.wait_drained(wait);
        return Step::Idle;
    }

    let sink = &p.sink;
    if !sink.wait_active(wait) {
        return Step::Idle;
    }
    let Some(_cycle) = sink.enter_cycle(wait) else {
        return Step::Idle;
    };
    if !sink.is_active() {
        return Step::Idle;
    }

    if !sink.is_configured() {
        if !setup_allowed(p) {
            // Parked until the source side configures or the host re-enables the port.
            p.sink_started.wait(wait);
            return Step::Idle;
        }
        return match setup_sink(p) {
            Ok(()) => Step::Worked,
            Err(e) => {
                p.sink_setup_failed.store(true, Ordering::Release);
                p.report(e);
                Step::Idle
            }
        };
    }

    let queue = match sink.mode {
        PortMode::Copy => &sink.work,
        PortMode::Share => &sink.client,
    };
    let buffer = match queue.dequeue_blocking(wait) {
        Dequeue::Item(buffer) => buffer,
        Dequeue::Closed => return Step::Exit,
        _ => return Step::Idle,
    };
    if p.bypass.is_pending() {
        queue.requeue_front(buffer);
        return Step::Idle;
    }

    if let Some(slot) = sink.pool.find_by_identity(&buffer) {
        sink.pool.mark(slot, EntryState::InFlight);
    }
    match p.device.submit_output(buffer) {
        Ok(()) => Step::Worked,
        Err(rejected) => {
            p.report_device_error(rejected.error);
            match sink.mode {
                PortMode::Copy => p.recycle(PortDirection::Sink, rejected.buffer),
                PortMode::Share => sink.client.requeue_front(rejected.buffer),
            }
            Step::Idle
        }
    }
}

fn setup_allowed(p: &Pipeline) -> bool {
    p.source.is_configured()
        && p.sink.is_active()
        && !p.sink.reconfigure_pending()
        && !p.sink_setup_failed.load(Ordering::Acquire)
}

/// Configure the device output side and, in copy mode, provision the pool.
#[instrument(skip_all, fields(component = %p.name))]
fn setup_sink(p: &Pipeline) -> Result<()> {
    let sink = &p.sink;
    let geometry = p.device.negotiate_output_geometry()?;
    let count = match sink.mode {
        PortMode::Copy => geometry.min_buffers + p.config.buffers.extra_dpb_buffers,
        PortMode::Share => sink.buffer_count().max(geometry.min_buffers),
    };
    p.device.configure_output(&geometry, count)?;

    if sink.mode == PortMode::Copy {
        for buffer in sink.pool.allocate(count, &geometry.plane_sizes)? {
            p.recycle(PortDirection::Sink, buffer);
        }
    }

    info!(
        width = geometry.width,
        height = geometry.height,
        count,
        "sink configured"
    );
    sink.set_geometry(geometry);
    sink.set_configured(true);
    p.sink_started.set();
    Ok(())
}

/// Turn device output into host buffers.
pub fn sink_output(p: &Pipeline) -> Step {
    if p.exiting() {
        return Step::Exit;
    }
    let sink = &p.sink;
    let wait = p.queue_wait();
    if !sink.wait_active(wait) {
        return Step::Idle;
    }
    let Some(_cycle) = sink.enter_cycle(wait) else {
        return Step::Idle;
    };

    if p.bypass.is_pending() {
        return emit_bypass(p, None);
    }
    if !p.sink_started.is_set() {
        p.sink_started.wait(wait);
        return Step::Idle;
    }

    let client = match sink.mode {
        PortMode::Copy => match sink.client.dequeue_blocking(wait) {
            Dequeue::Item(client) => Some(client),
            Dequeue::Closed => return Step::Exit,
            _ => return Step::Idle,
        },
        PortMode::Share => None,
    };
    if p.bypass.is_pending() {
        return emit_bypass(p, client);
    }

    match p.device.dequeue_output_completion(p.device_timeout()) {
        Ok(completion) => handle_completion(p, completion, client),
        Err(e) => {
            if let Some(client) = client {
                sink.client.requeue_front(client);
            }
            if !e.is_transient() {
                p.report_device_error(e);
            }
            Step::Idle
        }
    }
}

fn emit_bypass(p: &Pipeline, client: Option<Buffer>) -> Step {
    let sink = &p.sink;
    let mut client = match client {
        Some(client) => client,
        None => match sink.client.dequeue_blocking(p.queue_wait()) {
            Dequeue::Item(client) => client,
            Dequeue::Closed => return Step::Exit,
            _ => return Step::Idle,
        },
    };
    let Some(record) = p.bypass.take() else {
        sink.client.requeue_front(client);
        return Step::Idle;
    };

    client.reset();
    client.timestamp = record.timestamp;
    client.flags = record.flags;
    StageStats::bump(&p.stats.bypass_emitted);
    metrics::counter!("bypass_emitted").increment(1);
    debug!(timestamp = record.timestamp, flags = ?record.flags, "bypass emitted");
    emit(p, client);
    Step::Worked
}

fn handle_completion(p: &Pipeline, completion: OutputCompletion, client: Option<Buffer>) -> Step {
    let started = Instant::now();
    let sink = &p.sink;
    let OutputCompletion {
        buffer,
        status,
        tag,
        frame_type,
        corrupt,
    } = completion;

    match status {
        DisplayStatus::DecodeOnly => {
            trace!(?tag, "decode only");
            recycle_output(p, buffer, client);
            return Step::Worked;
        }
        DisplayStatus::ChangeResolution => resolution_changed(p),
        DisplayStatus::Display | DisplayStatus::DecodingFinished => {}
    }

    let resolved = p.tracker.lock().resolve(&p.ledger, tag, frame_type);
    if resolved.missing {
        StageStats::bump(&p.stats.tag_misses);
    }
    if resolved.miss_limit_hit {
        p.report_device_error(Error::Device(format!(
            "more than {} consecutive pictures without a valid tag",
            p.config.pipeline.max_consecutive_tag_misses
        )));
    }

    let mut flags = resolved.flags;
    flags.remove(BufferFlags::CODEC_CONFIG);
    if corrupt {
        flags |= BufferFlags::CORRUPT;
    }
    let eos = flags.contains(BufferFlags::END_OF_STREAM);
    let frame_size = sink.geometry().frame_size();
    let terminal = matches!(
        status,
        DisplayStatus::ChangeResolution | DisplayStatus::DecodingFinished
    );
    let remaining = if terminal || eos {
        if eos && p.behavior_eos.swap(false, Ordering::AcqRel) {
            frame_size
        } else {
            0
        }
    } else {
        frame_size
    };

    let mut out = match (sink.mode, client) {
        (PortMode::Copy, Some(mut client)) => {
            client.reset();
            if remaining > 0 {
                client.copy_planes_from(&buffer);
            }
            p.recycle(PortDirection::Sink, buffer);
            client
        }
        (_, client) => {
            if let Some(client) = client {
                sink.client.requeue_front(client);
            }
            let mut own = buffer;
            if remaining == 0 {
                for plane in &mut own.planes {
                    plane.filled = 0;
                }
            }
            own
        }
    };
    out.offset = 0;
    out.remaining = remaining;
    out.timestamp = resolved.timestamp;
    out.flags = flags;
    trace!(
        timestamp = out.timestamp,
        remaining,
        flags = ?out.flags,
        ?frame_type,
        "picture out"
    );
    emit(p, out);
    metrics::histogram!("sink_output_latency_us").record(started.elapsed().as_micros() as f64);
    Step::Worked
}

/// Give a completion buffer that produced no output back to the sink side.
fn recycle_output(p: &Pipeline, buffer: Buffer, client: Option<Buffer>) {
    if let Some(client) = client {
        p.sink.client.requeue_front(client);
    }
    match p.sink.mode {
        PortMode::Copy => p.recycle(PortDirection::Sink, buffer),
        PortMode::Share => p.recycle_sink_client(buffer),
    }
}

fn resolution_changed(p: &Pipeline) {
    let sink = &p.sink;
    match p.device.negotiate_output_geometry() {
        Ok(geometry) => {
            info!(
                width = geometry.width,
                height = geometry.height,
                "resolution changed mid-stream"
            );
            if sink.mode == PortMode::Share {
                sink.set_buffer_count(geometry.min_buffers + p.config.buffers.extra_dpb_buffers);
            }
            sink.set_geometry(geometry);
        }
        Err(e) => p.report_device_error(e),
    }
    sink.set_reconfigure_pending(true);
    p.host.on_event(HostEvent::PortSettingsChanged {
        port: PortDirection::Sink,
    });
}

fn emit(p: &Pipeline, buffer: Buffer) {
    let eos = buffer.flags.contains(BufferFlags::END_OF_STREAM);
    StageStats::bump(&p.stats.frames_emitted);
    metrics::counter!("frames_emitted").increment(1);
    p.host.return_buffer(PortDirection::Sink, buffer);
    if eos {
        info!(component = %p.name, "end of stream reached the sink");
        p.host.on_event(HostEvent::EndOfStream);
    }
}
