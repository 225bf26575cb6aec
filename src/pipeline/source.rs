//! SourceInput and SourceOutput: client data in, consumed units back out.

use std::sync::atomic::Ordering;

use tracing::{debug, info, instrument, trace, warn};

use crate::buffer::{Buffer, BufferFlags, BufferOrigin, EntryState};
use crate::device::DeviceMode;
use crate::error::{Error, Result};
use crate::host::HostEvent;
use crate::pipeline::port::{PortDirection, PortMode};
use crate::pipeline::queue::Dequeue;
use crate::pipeline::{BypassRecord, PendingUnit, Pipeline, SourceCursor, StageStats, Step};

/// Split client data into units and submit them to the device.
pub fn source_input(p: &Pipeline) -> Step {
    if p.exiting() {
        return Step::Exit;
    }
    let port = &p.source;
    let wait = p.queue_wait();
    if !port.wait_active(wait) {
        return Step::Idle;
    }
    let Some(_cycle) = port.enter_cycle(wait) else {
        return Step::Idle;
    };
    if !port.is_active() {
        return Step::Idle;
    }

    let mut cursor = p.cursor.lock();
    match port.mode {
        PortMode::Copy => fill_pool_unit(p, &mut cursor),
        PortMode::Share => match port.client.dequeue_blocking(wait) {
            Dequeue::Item(mut unit) => {
                unit.offset = 0;
                unit.remaining = unit.filled_len();
                submit_unit(p, unit);
                Step::Worked
            }
            Dequeue::Closed => Step::Exit,
            _ => Step::Idle,
        },
    }
}

fn fill_pool_unit(p: &Pipeline, cursor: &mut SourceCursor) -> Step {
    let port = &p.source;
    let wait = p.queue_wait();

    if cursor.pending.is_none() {
        match port.work.dequeue_blocking(wait) {
            Dequeue::Item(unit) => {
                if let Some(slot) = port.pool.find_by_identity(&unit) {
                    port.pool.mark(slot, EntryState::Held);
                }
                cursor.pending = Some(PendingUnit {
                    unit,
                    accumulating: false,
                });
            }
            Dequeue::Closed => return Step::Exit,
            _ => return Step::Idle,
        }
    }
    if cursor.client.is_none() {
        match port.client.dequeue_blocking(wait) {
            Dequeue::Item(client) => cursor.client = Some(client),
            Dequeue::Closed => return Step::Exit,
            _ => return Step::Idle,
        }
    }
    let (Some(pending), Some(client)) = (cursor.pending.as_mut(), cursor.client.as_mut()) else {
        return Step::Idle;
    };

    let fresh = !pending.accumulating && pending.unit.is_empty();
    if fresh {
        let mut flags = client.flags;
        flags.remove(BufferFlags::END_OF_STREAM);
        flags.remove(BufferFlags::END_OF_FRAME);
        pending.unit.timestamp = client.timestamp;
        pending.unit.flags = flags;
    }

    let complete = match &p.converter {
        Some(converter) => {
            let converted = converter.convert(client, &mut pending.unit);
            let len = client.unconsumed().len();
            client.consume(len);
            if let Err(e) = converted {
                drop_unit_contents(p, pending, e);
            }
            true
        }
        None => {
            let data = client.unconsumed();
            let detection = p
                .codec
                .lock()
                .detect(data, client.flags, pending.accumulating);
            let consumed = detection.consumed.min(data.len());
            let appended = pending.unit.append(&data[..consumed]);
            client.consume(consumed);
            if let Err(e) = appended {
                drop_unit_contents(p, pending, Error::MalformedUnit(e.to_string()));
            }
            detection.complete
        }
    };

    let client_done = client.is_consumed();
    if complete && client_done && client.flags.contains(BufferFlags::END_OF_STREAM) {
        pending.unit.flags |= BufferFlags::END_OF_STREAM;
    }
    if client_done {
        if let Some(client) = cursor.client.take() {
            p.return_to_host(PortDirection::Source, client);
        }
    }

    if !complete {
        if let Some(pending) = cursor.pending.as_mut() {
            pending.accumulating = !pending.unit.is_empty();
        }
        return Step::Worked;
    }
    if let Some(PendingUnit { unit, .. }) = cursor.pending.take() {
        submit_unit(p, unit);
    }
    Step::Worked
}

/// Forget what was accumulated so far and report why.
fn drop_unit_contents(p: &Pipeline, pending: &mut PendingUnit, error: Error) {
    StageStats::bump(&p.stats.units_dropped);
    metrics::counter!("units_dropped").increment(1);
    pending.unit.reset();
    pending.accumulating = false;
    p.report(error);
}

fn drop_unit(p: &Pipeline, unit: Buffer, error: Error) {
    StageStats::bump(&p.stats.units_dropped);
    metrics::counter!("units_dropped").increment(1);
    p.report(error);
    p.recycle(PortDirection::Source, unit);
}

/// Route a complete unit: bypass, drop, or tag and submit.
pub(crate) fn submit_unit(p: &Pipeline, mut unit: Buffer) {
    let port = &p.source;

    let eos = unit.flags.contains(BufferFlags::END_OF_STREAM);
    // A configured device may hold reference pictures; an empty end of stream
    // has to reach it so they are drained.
    if unit.is_empty() && !(eos && port.is_configured()) {
        if eos {
            debug!(timestamp = unit.timestamp, "empty end of stream bypasses the device");
            push_bypass(p, &unit);
        }
        p.recycle(PortDirection::Source, unit);
        return;
    }

    unit.offset = 0;
    unit.remaining = unit.filled_len();
    if let Err(e) = p.codec.lock().prepare_unit(&mut unit) {
        drop_unit(p, unit, e);
        return;
    }

    if !port.is_configured() {
        if let Err(e) = configure_source(p, &unit) {
            p.report(e);
            p.recycle(PortDirection::Source, unit);
            return;
        }
        // Sink setup keys off `configured`, so the probe has to land first.
        if !p.geometry_probed.swap(true, Ordering::AcqRel) {
            negotiate_geometry(p, &unit);
        }
        port.set_configured(true);
    }

    if eos && !unit.is_empty() {
        p.behavior_eos.store(true, Ordering::Release);
    }

    let tag = p.ledger.assign_tag(unit.timestamp, unit.flags);
    let slot = match unit.origin {
        BufferOrigin::Pool(_) => port.pool.find_by_identity(&unit),
        BufferOrigin::Client(_) => None,
    };
    if let Some(slot) = slot {
        port.pool.mark(slot, EntryState::InFlight);
    }
    trace!(tag = tag.0, timestamp = unit.timestamp, len = unit.remaining, "submit unit");

    match p.device.submit_input(unit, tag) {
        Ok(()) => {
            StageStats::bump(&p.stats.units_submitted);
            metrics::counter!("units_submitted").increment(1);
            if !p.source_started.is_set() {
                info!(component = %p.name, "first unit submitted");
                p.source_started.set();
            }
        }
        Err(rejected) if eos && rejected.buffer.is_empty() => {
            p.ledger.complete(tag);
            debug!(error = %rejected.error, "device refused empty end of stream, bypassing");
            push_bypass(p, &rejected.buffer);
            p.recycle(PortDirection::Source, rejected.buffer);
        }
        Err(rejected) => {
            p.ledger.complete(tag);
            p.report_device_error(rejected.error);
            p.recycle(PortDirection::Source, rejected.buffer);
        }
    }
}

fn push_bypass(p: &Pipeline, unit: &Buffer) {
    p.bypass.push(BypassRecord {
        flags: unit.flags,
        timestamp: unit.timestamp,
    });
    p.wake_sink();
}

#[instrument(skip_all, fields(component = %p.name))]
fn configure_source(p: &Pipeline, unit: &Buffer) -> Result<()> {
    let port = &p.source;
    let cfg = &p.config;
    p.device.set_mode(DeviceMode {
        dts: cfg.pipeline.dts_mode,
        i_frame_only: cfg.pipeline.thumbnail_mode,
    })?;
    let (size, count) = match port.mode {
        PortMode::Copy => (
            port.pool
                .plane_sizes()
                .map_or(cfg.buffers.input_buffer_size, |sizes| sizes.iter().sum()),
            port.pool.capacity(),
        ),
        PortMode::Share => (unit.capacity(), port.buffer_count()),
    };
    let coding = p.codec.lock().coding();
    p.device.configure_input(coding, size, count)?;
    info!(?coding, size, count, "source configured");
    Ok(())
}

/// One-time header parse; asks the host to reallocate the sink if the
/// stream does not match what was advertised.
fn negotiate_geometry(p: &Pipeline, unit: &Buffer) {
    let probed = match p.device.probe(unit) {
        Ok(geometry) => geometry,
        Err(e) => {
            p.report_device_error(e);
            return;
        }
    };
    let sink = &p.sink;
    let advertised = sink.geometry();
    let changed = advertised.needs_reconfigure(&probed, sink.mode);
    if changed {
        info!(
            advertised_width = advertised.width,
            advertised_height = advertised.height,
            width = probed.width,
            height = probed.height,
            "sink settings changed"
        );
        if sink.mode == PortMode::Share {
            sink.set_buffer_count(probed.min_buffers + p.config.buffers.extra_dpb_buffers);
        }
        sink.set_geometry(probed);
        sink.set_reconfigure_pending(true);
        p.host.on_event(HostEvent::PortSettingsChanged {
            port: PortDirection::Sink,
        });
    } else {
        sink.set_geometry(probed);
    }
}

/// Return consumed units to where they came from.
pub fn source_output(p: &Pipeline) -> Step {
    if p.exiting() {
        return Step::Exit;
    }
    if !p.source_started.wait(p.config.pipeline.start_wait()) {
        return Step::Idle;
    }
    let port = &p.source;
    let Some(_cycle) = port.enter_cycle(p.queue_wait()) else {
        return Step::Idle;
    };

    match p.device.dequeue_input_completion(p.device_timeout()) {
        Ok(Some(buffer)) => {
            let known = match buffer.origin {
                BufferOrigin::Pool(_) => port.pool.find_by_identity(&buffer).is_some(),
                BufferOrigin::Client(_) => port.mode == PortMode::Share,
            };
            if !known {
                let violation =
                    Error::ProtocolViolation(format!("unknown input buffer {buffer:?}"));
                warn!(component = %p.name, "{}", violation);
                return Step::Idle;
            }
            p.recycle(PortDirection::Source, buffer);
            Step::Worked
        }
        Ok(None) => Step::Idle,
        Err(e) if e.is_transient() => Step::Idle,
        Err(e) => {
            p.report_device_error(e);
            Step::Idle
        }
    }
}
