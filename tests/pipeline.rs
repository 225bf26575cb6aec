mod common;

use std::sync::Arc;

use common::{keyframe, picture, test_config, Harness, B, I, P};
use hwcodec::buffer::{Buffer, BufferFlags, ClientHandle};
use hwcodec::codec::CodecFamily;
use hwcodec::convert::PlaneCopyConverter;
use hwcodec::device::{Coding, SoftDevice};
use hwcodec::pipeline::port::{Geometry, PortDirection, PortMode};
use hwcodec::pipeline::{sink, source, Step};
use hwcodec::{ChannelHost, Component, ComponentSpec, Error, HostEvent};

fn vga() -> Geometry {
    Geometry::nv12(720, 480, 4)
}

#[test]
fn empty_end_of_stream_drains_the_held_picture() {
    let mut h = Harness::mpeg2(vga(), test_config());
    h.feed_pictures(&keyframe(720, 480), &[P, B], 33_333, BufferFlags::empty());
    h.feed(&[], 100_000, BufferFlags::END_OF_STREAM);
    h.settle();

    let stamps: Vec<i64> = h.frames().iter().map(|f| f.timestamp).collect();
    assert_eq!(stamps, vec![0, 66_666, 33_333]);

    let terminal: Vec<_> = h
        .outputs
        .iter()
        .filter(|o| o.flags.contains(BufferFlags::END_OF_STREAM))
        .collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].remaining, 0);
    assert_eq!(terminal[0].timestamp, 100_000);
    assert_eq!(h.end_of_stream_events(), 1);
    assert_eq!(h.component.stats().bypass_emitted, 0);
    assert_eq!(h.device.submitted_units(), 4);
}

#[test]
fn end_of_stream_before_configuration_bypasses_the_device() {
    let mut h = Harness::mpeg2(vga(), test_config());
    let p = h.pipeline().clone();

    h.feed(&[], 42, BufferFlags::END_OF_STREAM);
    assert_eq!(source::source_input(&p), Step::Worked);
    assert!(p.bypass.is_pending());
    assert!(!p.source.is_configured());

    assert_eq!(sink::sink_input(&p), Step::Idle);
    assert_eq!(h.device.held_outputs(), 0);

    assert_eq!(sink::sink_output(&p), Step::Worked);
    assert_eq!(h.device.output_dequeues(), 0);
    assert!(!p.bypass.is_pending());

    h.pump();
    assert_eq!(h.outputs.len(), 1);
    assert_eq!(h.outputs[0].timestamp, 42);
    assert_eq!(h.outputs[0].remaining, 0);
    assert!(h.outputs[0].flags.contains(BufferFlags::END_OF_STREAM));
    assert_eq!(h.end_of_stream_events(), 1);
    assert_eq!(h.device.submitted_units(), 0);
    assert_eq!(h.component.stats().bypass_emitted, 1);
}

#[test]
fn refused_empty_end_of_stream_falls_back_to_bypass() {
    let mut h = Harness::mpeg2(vga(), test_config());
    h.device.refuse_empty_units(true);
    h.feed_pictures(&keyframe(720, 480), &[P, B], 100, BufferFlags::empty());
    h.feed(&[], 300, BufferFlags::END_OF_STREAM);
    h.settle();

    let terminal: Vec<_> = h
        .outputs
        .iter()
        .filter(|o| o.flags.contains(BufferFlags::END_OF_STREAM))
        .collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].timestamp, 300);
    assert_eq!(terminal[0].remaining, 0);
    assert_eq!(h.component.stats().bypass_emitted, 1);
    assert_eq!(h.device.submitted_units(), 3);
    assert_eq!(h.count_events(|e| matches!(e, HostEvent::Error { .. })), 0);
    assert_eq!(h.inputs_returned, 4);
}

#[test]
fn resolution_change_mid_stream_emits_a_terminal_buffer() {
    let mut h = Harness::mpeg2(vga(), test_config());
    let p = h.pipeline().clone();
    h.feed(&keyframe(720, 480), 0, BufferFlags::END_OF_FRAME);
    h.feed(&picture(P), 100, BufferFlags::END_OF_FRAME);
    h.settle();
    assert_eq!(h.frames().len(), 1);
    let before = p.tracker.lock().output_index();

    h.feed(&keyframe(352, 288), 200, BufferFlags::END_OF_FRAME);
    h.settle();

    let changed = |e: &HostEvent| {
        matches!(e, HostEvent::PortSettingsChanged { port: PortDirection::Sink })
    };
    assert_eq!(h.count_events(changed), 1);
    assert!(p.sink.reconfigure_pending());
    assert_eq!(p.sink.geometry().width, 352);
    assert_eq!(p.tracker.lock().output_index(), (before + 1) % p.ledger.size());

    let terminal: Vec<_> = h.outputs.iter().filter(|o| o.remaining == 0).collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].timestamp, 200);
    assert!(!terminal[0].flags.contains(BufferFlags::END_OF_STREAM));
    assert_eq!(h.frames().len(), 1);

    h.component.disable_port(PortDirection::Sink).unwrap();
    h.pump();
    h.component.enable_port(PortDirection::Sink).unwrap();
    h.supply_sink();
    h.refill = true;
    h.feed(&[], 300, BufferFlags::END_OF_STREAM);
    h.settle();

    let resized: Vec<i64> = h
        .frames()
        .iter()
        .filter(|f| f.remaining == 352 * 288 * 3 / 2)
        .map(|f| f.timestamp)
        .collect();
    assert_eq!(resized, vec![100, 200]);
    assert_eq!(h.end_of_stream_events(), 1);
    assert_eq!(h.count_events(changed), 1);
}

#[test]
fn output_fault_is_reported_and_the_stream_continues() {
    let mut h = Harness::mpeg2(vga(), test_config());
    h.refill = true;
    h.device.fail_next_output(Error::Device("decode timeout".into()));
    h.feed_pictures(&keyframe(720, 480), &[P, B, P], 100, BufferFlags::END_OF_STREAM);
    h.settle();

    let faults = h.count_events(|e| {
        matches!(
            e,
            HostEvent::Error {
                error: Error::Device(_),
                recoverable: true
            }
        )
    });
    assert_eq!(faults, 1);
    assert_eq!(h.component.stats().device_errors, 1);
    let stamps: Vec<i64> = h.frames().iter().map(|f| f.timestamp).collect();
    assert_eq!(stamps, vec![0, 200, 100, 300]);
    assert_eq!(h.end_of_stream_events(), 1);
}

#[test]
fn unknown_consumed_input_is_ignored() {
    let mut h = Harness::mpeg2(vga(), test_config());
    let p = h.pipeline().clone();
    h.feed(&keyframe(720, 480), 0, BufferFlags::END_OF_FRAME);
    h.settle();
    assert_eq!(h.inputs_returned, 1);

    let foreign = Buffer::with_payload(ClientHandle(999), &[1, 2], 0, BufferFlags::empty());
    h.device.complete_foreign_input(foreign);
    assert_eq!(source::source_output(&p), Step::Idle);
    h.pump();
    assert_eq!(h.inputs_returned, 1);
    assert_eq!(h.count_events(|e| matches!(e, HostEvent::Error { .. })), 0);
    let census = h.component.census(PortDirection::Source);
    assert_eq!(census.in_flight, 0);
    assert_eq!(census.queued + census.held, census.capacity);

    h.feed(&picture(P), 100, BufferFlags::END_OF_FRAME);
    h.settle();
    assert_eq!(h.inputs_returned, 2);
    assert_eq!(h.device.submitted_units(), 2);
}

#[test]
fn re_enabled_source_probes_the_stream_again() {
    let mut h = Harness::mpeg2(vga(), test_config());
    let p = h.pipeline().clone();
    h.feed(&keyframe(720, 480), 0, BufferFlags::END_OF_FRAME);
    h.settle();

    h.component.disable_port(PortDirection::Source).unwrap();
    h.component.enable_port(PortDirection::Source).unwrap();
    let count = p.source.buffer_count();
    h.component.populate(PortDirection::Source, count).unwrap();
    h.pump();

    h.feed(&keyframe(352, 288), 10, BufferFlags::END_OF_FRAME);
    assert_eq!(source::source_input(&p), Step::Worked);
    h.pump();
    let changed = |e: &HostEvent| {
        matches!(e, HostEvent::PortSettingsChanged { port: PortDirection::Sink })
    };
    assert_eq!(h.count_events(changed), 1);
    assert_eq!(p.sink.geometry().width, 352);
    assert!(p.sink.reconfigure_pending());
}

#[test]
fn components_can_be_built_from_the_global_config() {
    let mut config = test_config();
    config.pipeline.ledger_size = 12;
    hwcodec::CONFIG.store(Arc::new(config));

    let (host, _rx) = ChannelHost::new();
    let component = Component::from_global(
        "global",
        ComponentSpec::decoder(CodecFamily::Mpeg2, Coding::Mpeg2, vga()),
        Arc::new(SoftDevice::new(vga())),
        Arc::new(host),
    )
    .unwrap();
    assert_eq!(component.pipeline().ledger.size(), 12);
}

#[test]
fn flush_returns_every_buffer_and_is_idempotent() {
    let mut h = Harness::mpeg2(vga(), test_config());
    h.feed_pictures(&keyframe(720, 480), &[P, B], 33_333, BufferFlags::empty());
    h.settle();
    assert_eq!(h.inputs_returned, 3);
    assert_eq!(h.frames().len(), 2);

    h.component.flush(PortDirection::Sink).unwrap();
    h.pump();
    assert_eq!(h.sink_returned, 7);
    let census = h.component.census(PortDirection::Sink);
    assert_eq!(census.capacity, 7);
    assert_eq!(census.queued, 7);

    h.component.flush(PortDirection::Sink).unwrap();
    h.pump();
    assert_eq!(h.sink_returned, 7);

    h.component.flush(PortDirection::Source).unwrap();
    h.component.flush(PortDirection::Source).unwrap();
    h.pump();
    assert_eq!(h.inputs_returned, 3);
    let census = h.component.census(PortDirection::Source);
    assert_eq!(census.queued, census.capacity);
    assert_eq!(census.capacity, 4);

    let completes = h.count_events(|e| matches!(e, HostEvent::FlushComplete { .. }));
    assert_eq!(completes, 4);
    assert_eq!(h.pipeline().ledger.in_flight(), 0);
}

#[test]
fn pool_entries_are_conserved_while_streaming() {
    let mut h = Harness::mpeg2(vga(), test_config());
    h.refill = true;
    h.feed(&keyframe(720, 480), 0, BufferFlags::END_OF_FRAME);
    for i in 1..12 {
        let kind = if i % 3 == 1 { P } else { B };
        h.feed(&picture(kind), i * 1000, BufferFlags::END_OF_FRAME);
        h.settle();
        for direction in [PortDirection::Source, PortDirection::Sink] {
            let c = h.component.census(direction);
            assert_eq!(c.queued + c.in_flight + c.held, c.capacity);
            assert!(c.held <= 1, "{direction}: {c:?}");
        }
    }
    assert_eq!(h.inputs_returned, 12);
}

#[test]
fn stream_geometry_mismatch_asks_for_reallocation_once() {
    let mut h = Harness::mpeg2(Geometry::nv12(176, 144, 4), test_config());
    let p = h.pipeline().clone();

    h.feed(&keyframe(720, 480), 0, BufferFlags::END_OF_FRAME);
    assert_eq!(source::source_input(&p), Step::Worked);
    h.pump();
    let changed = |e: &HostEvent| {
        matches!(e, HostEvent::PortSettingsChanged { port: PortDirection::Sink })
    };
    assert_eq!(h.count_events(changed), 1);
    assert_eq!(h.sink_returned, 0);
    assert_eq!(p.sink.geometry().width, 720);

    // The sink stays unconfigured until the host reallocates.
    assert_eq!(sink::sink_input(&p), Step::Idle);
    assert!(!p.sink.is_configured());
    assert_eq!(h.component.census(PortDirection::Sink).capacity, 0);

    h.feed(&picture(P), 1, BufferFlags::END_OF_FRAME);
    assert_eq!(source::source_input(&p), Step::Worked);
    h.pump();
    assert_eq!(h.count_events(changed), 1);

    h.component.disable_port(PortDirection::Sink).unwrap();
    h.pump();
    assert_eq!(h.sink_returned, 7);
    h.component.enable_port(PortDirection::Sink).unwrap();
    h.supply_sink();

    assert_eq!(sink::sink_input(&p), Step::Worked);
    assert!(p.sink.is_configured());
    let census = h.component.census(PortDirection::Sink);
    assert_eq!(census.capacity, 7);

    h.settle();
    let frames = h.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].remaining, 720 * 480 * 3 / 2);
    assert_eq!(h.count_events(changed), 1);
}

#[test]
fn dts_mode_emits_monotonic_timestamps() {
    let mut config = test_config();
    config.pipeline.dts_mode = true;
    let mut h = Harness::mpeg2(vga(), config);
    h.refill = true;
    h.feed_pictures(&keyframe(720, 480), &[P, B, B, P], 100, BufferFlags::END_OF_STREAM);
    h.settle();

    assert!(h.device.mode().dts);
    let stamps: Vec<i64> = h.frames().iter().map(|f| f.timestamp).collect();
    assert_eq!(stamps, vec![0, 100, 200, 300, 400]);
    let last = h.frames()[4];
    assert!(last.flags.contains(BufferFlags::END_OF_STREAM));
    assert_eq!(last.remaining, 720 * 480 * 3 / 2);
    assert_eq!(h.end_of_stream_events(), 1);
}

#[test]
fn presentation_order_follows_reported_tags() {
    let mut h = Harness::mpeg2(vga(), test_config());
    h.refill = true;
    h.feed_pictures(&keyframe(720, 480), &[P, B, B, P], 100, BufferFlags::END_OF_STREAM);
    h.settle();

    // I P B B P in decode order displays as I B B P P.
    let stamps: Vec<i64> = h.frames().iter().map(|f| f.timestamp).collect();
    assert_eq!(stamps, vec![0, 200, 300, 100, 400]);
}

#[test]
fn malformed_unit_is_dropped_and_stream_continues() {
    let mut h = Harness::mpeg2(vga(), test_config());
    h.feed(&[0x11, 0x22, 0x33, 0x44], 0, BufferFlags::END_OF_FRAME);
    h.feed(&keyframe(720, 480), 1, BufferFlags::END_OF_FRAME);
    h.settle();

    let malformed = h.count_events(|e| {
        matches!(
            e,
            HostEvent::Error {
                error: Error::MalformedUnit(_),
                recoverable: true
            }
        )
    });
    assert_eq!(malformed, 1);
    assert_eq!(h.component.stats().units_dropped, 1);
    assert_eq!(h.device.submitted_units(), 1);
    assert_eq!(h.inputs_returned, 2);
}

#[test]
fn lost_tags_fall_back_to_sequential_slots() {
    let mut h = Harness::mpeg2(vga(), test_config());
    h.refill = true;
    h.device.lose_next_tags(3);
    h.feed_pictures(&keyframe(720, 480), &[P, B, B, P], 100, BufferFlags::END_OF_STREAM);
    h.settle();

    let frames = h.frames();
    assert_eq!(frames.len(), 5);
    assert_eq!(frames[0].timestamp, 0);
    assert!(frames[4].flags.contains(BufferFlags::END_OF_STREAM));
    assert_eq!(h.component.stats().tag_misses, 3);
    assert_eq!(h.count_events(|e| matches!(e, HostEvent::Error { .. })), 0);
}

#[test]
fn long_run_of_lost_tags_is_reported_once() {
    let mut config = test_config();
    config.pipeline.max_consecutive_tag_misses = 1;
    let mut h = Harness::mpeg2(vga(), config);
    h.refill = true;
    h.device.lose_next_tags(3);
    h.feed_pictures(&keyframe(720, 480), &[P, B, B, P], 100, BufferFlags::END_OF_STREAM);
    h.settle();

    let reported = h.count_events(|e| {
        matches!(
            e,
            HostEvent::Error {
                error: Error::Device(_),
                recoverable: true
            }
        )
    });
    assert_eq!(reported, 1);
    assert_eq!(h.frames().len(), 5);
}

#[test]
fn ledger_larger_than_reorder_depth_never_aliases() {
    let mut config = test_config();
    config.pipeline.ledger_size = 6;
    let mut h = Harness::mpeg2(vga(), config);
    h.refill = true;

    h.feed(&keyframe(720, 480), 0, BufferFlags::END_OF_FRAME);
    h.settle();
    for i in 1..30 {
        let kind = match i % 3 {
            0 => I,
            1 => P,
            _ => B,
        };
        h.feed(&picture(kind), i * 10, BufferFlags::END_OF_FRAME);
        h.settle();
    }

    assert_eq!(h.component.stats().tags_aliased, 0);
    assert!(h.pipeline().ledger.in_flight() <= 2);
    assert_eq!(h.component.stats().units_submitted, 30);
}

#[test]
fn share_mode_hands_client_buffers_to_the_device() {
    let advertised = Geometry::nv12(176, 144, 2);
    let spec = ComponentSpec {
        family: CodecFamily::Generic,
        coding: Coding::H264,
        source_mode: PortMode::Share,
        sink_mode: PortMode::Share,
        advertised,
        converter: None,
    };
    let mut h = Harness::new(spec, test_config());
    h.refill = true;
    h.feed(&[0, 0, 0, 1, 0x65, 0x88], 0, BufferFlags::SYNC_FRAME);
    h.feed(&[0, 0, 0, 1, 0x65, 0x99], 10, BufferFlags::SYNC_FRAME);
    h.feed(&[0, 0, 0, 1, 0x65, 0xAA], 20, BufferFlags::END_OF_STREAM);
    h.settle();

    assert_eq!(h.component.census(PortDirection::Source).capacity, 0);
    assert_eq!(h.component.census(PortDirection::Sink).capacity, 0);
    assert_eq!(h.inputs_returned, 3);
    let stamps: Vec<i64> = h.frames().iter().map(|f| f.timestamp).collect();
    assert_eq!(stamps, vec![0, 10, 20]);
    assert_eq!(h.end_of_stream_events(), 1);
}

#[test]
fn encoder_converts_raw_pictures() {
    let geometry = Geometry::nv12(176, 144, 2);
    let spec = ComponentSpec::encoder(Arc::new(PlaneCopyConverter), geometry.clone());
    let mut h = Harness::new(spec, test_config());
    h.refill = true;

    let raw = |h: &mut Harness, ts: i64, flags: BufferFlags| {
        let mut frame = Buffer::client(
            ClientHandle(1000 + ts as u64),
            &geometry.plane_sizes,
        );
        for plane in &mut frame.planes {
            plane.filled = plane.data.capacity();
        }
        frame.remaining = frame.filled_len();
        frame.timestamp = ts;
        frame.flags = flags;
        h.component.empty_buffer(frame).unwrap();
    };
    raw(&mut h, 0, BufferFlags::empty());
    raw(&mut h, 1, BufferFlags::END_OF_STREAM);
    h.settle();

    let stamps: Vec<i64> = h.frames().iter().map(|f| f.timestamp).collect();
    assert_eq!(stamps, vec![0, 1]);
    assert_eq!(h.end_of_stream_events(), 1);
}

#[test]
fn disabled_port_rejects_buffers() {
    let h = Harness::mpeg2(vga(), test_config());
    h.component.disable_port(PortDirection::Source).unwrap();
    let err = h
        .component
        .empty_buffer(Buffer::with_payload(
            ClientHandle(77),
            &[0, 0, 1],
            0,
            BufferFlags::empty(),
        ))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { port: PortDirection::Source, .. }));
    assert!(h.component.flush(PortDirection::Source).is_err());
}
