mod common;

use std::time::Duration;

use common::{keyframe, test_config, Harness, B, P};
use hwcodec::buffer::BufferFlags;
use hwcodec::pipeline::port::{Geometry, PortDirection};
use hwcodec::HostEvent;

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn stream_runs_to_end_of_stream_on_stage_threads() {
    let mut h = Harness::mpeg2(Geometry::nv12(720, 480, 4), test_config());
    h.component.start().unwrap();
    h.feed_pictures(&keyframe(720, 480), &[P, B, B, P], 100, BufferFlags::END_OF_STREAM);

    assert!(h.wait_until(WAIT, |h| h.end_of_stream_events() == 1));
    let frames = h.frames();
    assert_eq!(frames.len(), 5);
    assert!(frames
        .iter()
        .filter(|f| f.flags.contains(BufferFlags::END_OF_STREAM))
        .all(|f| f.remaining > 0));

    h.component.stop();
    h.pump();
    assert_eq!(h.inputs_returned, 5);
    // Seven sink buffers were supplied and never refilled.
    assert_eq!(h.sink_returned, 7);
    assert_eq!(h.component.census(PortDirection::Sink).capacity, 0);
}

#[test]
fn host_reallocation_resumes_output() {
    let mut h = Harness::mpeg2(Geometry::nv12(176, 144, 4), test_config());
    h.refill = true;
    h.component.start().unwrap();
    h.feed_pictures(&keyframe(352, 288), &[P, B], 100, BufferFlags::END_OF_STREAM);

    let changed = |e: &HostEvent| matches!(e, HostEvent::PortSettingsChanged { .. });
    assert!(h.wait_until(WAIT, |h| h.count_events(changed) == 1));
    assert_eq!(h.frames().len(), 0);

    h.component.disable_port(PortDirection::Sink).unwrap();
    h.component.enable_port(PortDirection::Sink).unwrap();
    h.supply_sink();

    assert!(h.wait_until(WAIT, |h| h.end_of_stream_events() == 1));
    let frames = h.frames();
    assert_eq!(frames.len(), 3);
    assert!(frames.iter().all(|f| f.remaining == 352 * 288 * 3 / 2));
    assert_eq!(h.count_events(changed), 1);
}

#[test]
fn flush_while_running_keeps_pools_whole() {
    let mut h = Harness::mpeg2(Geometry::nv12(720, 480, 4), test_config());
    h.refill = true;
    h.component.start().unwrap();
    h.feed_pictures(&keyframe(720, 480), &[P, B, B], 100, BufferFlags::empty());
    assert!(h.wait_until(WAIT, |h| h.frames().len() >= 2));

    for _ in 0..2 {
        h.component.flush(PortDirection::Source).unwrap();
        h.component.flush(PortDirection::Sink).unwrap();
    }
    let completes = |e: &HostEvent| matches!(e, HostEvent::FlushComplete { .. });
    assert!(h.wait_until(WAIT, |h| h.count_events(completes) == 4));

    for direction in [PortDirection::Source, PortDirection::Sink] {
        let census = h.component.census(direction);
        assert_eq!(census.queued + census.in_flight + census.held, census.capacity);
    }
    assert_eq!(h.component.census(PortDirection::Source).in_flight, 0);

    // The stream picks up again after a flush.
    h.feed(&keyframe(720, 480), 1_000, BufferFlags::END_OF_FRAME | BufferFlags::END_OF_STREAM);
    assert!(h.wait_until(WAIT, |h| h.end_of_stream_events() == 1));
}
