#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::Receiver;

use hwcodec::buffer::{Buffer, BufferFlags, ClientHandle};
use hwcodec::device::SoftDevice;
use hwcodec::pipeline::port::{Geometry, PortDirection};
use hwcodec::pipeline::{sink, source, Pipeline, Step};
use hwcodec::{ChannelHost, Component, ComponentSpec, Config, HostEvent, HostMessage};

pub const I: u8 = 1;
pub const P: u8 = 2;
pub const B: u8 = 3;

pub fn sequence_header(width: u32, height: u32) -> Vec<u8> {
    vec![
        0x00,
        0x00,
        0x01,
        0xB3,
        (width >> 4) as u8,
        (((width & 0x0F) << 4) | (height >> 8)) as u8,
        (height & 0xFF) as u8,
        0x24,
    ]
}

pub fn picture(coding_type: u8) -> Vec<u8> {
    vec![0x00, 0x00, 0x01, 0x00, 0x00, coding_type << 3, 0xFF, 0xF8]
}

pub fn keyframe(width: u32, height: u32) -> Vec<u8> {
    let mut data = sequence_header(width, height);
    data.extend(picture(I));
    data
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.pipeline.queue_wait_ms = 5;
    config.pipeline.device_timeout_ms = 5;
    config.pipeline.start_wait_ms = 5;
    config.buffers.input_buffer_size = 64 * 1024;
    config
}

/// What the host saw on one returned sink buffer.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub timestamp: i64,
    pub flags: BufferFlags,
    pub remaining: usize,
}

pub struct Harness {
    pub component: Component,
    pub device: Arc<SoftDevice>,
    rx: Receiver<HostMessage>,
    pub events: Vec<HostEvent>,
    pub outputs: Vec<Output>,
    pub inputs_returned: usize,
    pub sink_returned: usize,
    /// Hand returned sink buffers straight back to the component.
    pub refill: bool,
    next_handle: u64,
}

impl Harness {
    /// Both ports enabled and populated; stages are not running.
    pub fn new(spec: ComponentSpec, config: Config) -> Self {
        let device = Arc::new(SoftDevice::new(spec.advertised.clone()));
        let (host, rx) = ChannelHost::new();
        let component =
            Component::new("test", spec, device.clone(), Arc::new(host), config).unwrap();
        component.enable_port(PortDirection::Source).unwrap();
        component.enable_port(PortDirection::Sink).unwrap();

        let mut harness = Self {
            component,
            device,
            rx,
            events: Vec::new(),
            outputs: Vec::new(),
            inputs_returned: 0,
            sink_returned: 0,
            refill: false,
            next_handle: 0,
        };
        let count = harness.pipeline().source.buffer_count();
        harness
            .component
            .populate(PortDirection::Source, count)
            .unwrap();
        harness.supply_sink();
        harness
    }

    pub fn mpeg2(advertised: Geometry, config: Config) -> Self {
        use hwcodec::codec::CodecFamily;
        use hwcodec::device::Coding;
        Self::new(
            ComponentSpec::decoder(CodecFamily::Mpeg2, Coding::Mpeg2, advertised),
            config,
        )
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        self.component.pipeline()
    }

    /// Give the sink port its full complement of buffers at the current geometry.
    pub fn supply_sink(&mut self) -> usize {
        let sink = &self.component.pipeline().sink;
        let plane_sizes = sink.geometry().plane_sizes;
        let count = sink.buffer_count();
        for _ in 0..count {
            self.next_handle += 1;
            self.component
                .fill_buffer(Buffer::client(ClientHandle(self.next_handle), &plane_sizes))
                .unwrap();
        }
        self.component.populate(PortDirection::Sink, count).unwrap();
        count
    }

    pub fn feed(&mut self, data: &[u8], timestamp: i64, flags: BufferFlags) {
        self.next_handle += 1;
        self.component
            .empty_buffer(Buffer::with_payload(
                ClientHandle(self.next_handle),
                data,
                timestamp,
                flags,
            ))
            .unwrap();
    }

    /// One unit per client buffer, timestamps `step` apart.
    pub fn feed_pictures(&mut self, first: &[u8], rest: &[u8], step: i64, last_flags: BufferFlags) {
        let total = 1 + rest.len();
        let flags_for = |index: usize| {
            if index + 1 == total {
                BufferFlags::END_OF_FRAME | last_flags
            } else {
                BufferFlags::END_OF_FRAME
            }
        };
        self.feed(first, 0, flags_for(0));
        for (i, &kind) in rest.iter().enumerate() {
            self.feed(&picture(kind), (i as i64 + 1) * step, flags_for(i + 1));
        }
    }

    pub fn pump(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            self.absorb(message);
        }
    }

    fn absorb(&mut self, message: HostMessage) {
        match message {
            HostMessage::Event(event) => self.events.push(event),
            HostMessage::Buffer(PortDirection::Source, _) => self.inputs_returned += 1,
            HostMessage::Buffer(PortDirection::Sink, buffer) => {
                self.sink_returned += 1;
                self.outputs.push(Output {
                    timestamp: buffer.timestamp,
                    flags: buffer.flags,
                    remaining: buffer.remaining,
                });
                let sink = &self.component.pipeline().sink;
                let fits = sink
                    .geometry()
                    .plane_sizes
                    .iter()
                    .zip(&buffer.planes)
                    .all(|(&size, plane)| plane.data.capacity() >= size);
                if self.refill && fits && sink.state().is_populated() {
                    self.component.fill_buffer(buffer).unwrap();
                }
            }
        }
    }

    /// Run every stage once per round until a whole round does no work.
    pub fn settle(&mut self) {
        let stages: [fn(&Pipeline) -> Step; 4] = [
            source::source_input,
            source::source_output,
            sink::sink_input,
            sink::sink_output,
        ];
        for _ in 0..500 {
            let mut worked = false;
            for stage in stages {
                if stage(self.component.pipeline()) == Step::Worked {
                    worked = true;
                }
            }
            self.pump();
            if !worked {
                return;
            }
        }
        panic!("pipeline never went idle");
    }

    /// Collect host messages until `done` holds, for threaded runs.
    pub fn wait_until(&mut self, timeout: Duration, done: impl Fn(&Harness) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while !done(self) {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            if let Ok(message) = self.rx.recv_timeout(left.min(Duration::from_millis(20))) {
                self.absorb(message);
            }
        }
        true
    }

    /// Emitted pictures, without zero-length terminal buffers.
    pub fn frames(&self) -> Vec<Output> {
        self.outputs.iter().copied().filter(|o| o.remaining > 0).collect()
    }

    pub fn count_events(&self, matches: impl Fn(&HostEvent) -> bool) -> usize {
        self.events.iter().filter(|e| matches(e)).count()
    }

    pub fn end_of_stream_events(&self) -> usize {
        self.count_events(|e| matches!(e, HostEvent::EndOfStream))
    }
}
