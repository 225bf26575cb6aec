//! Drives a decoder component over a short synthetic MPEG-2 stream.

use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, error, info, warn};

use hwcodec::buffer::{Buffer, BufferFlags, ClientHandle};
use hwcodec::codec::CodecFamily;
use hwcodec::device::{Coding, SoftDevice};
use hwcodec::pipeline::port::{Geometry, PortDirection};
use hwcodec::{utils, ChannelHost, Component, ComponentSpec, HostEvent, HostMessage};

const FRAME_INTERVAL_US: i64 = 33_333;

/// Sequence header for 720x480 followed by an I picture, then P B B P.
fn synthetic_stream() -> Vec<(Vec<u8>, BufferFlags)> {
    fn picture(coding_type: u8) -> Vec<u8> {
        vec![0x00, 0x00, 0x01, 0x00, 0x00, coding_type << 3, 0xFF, 0xF8]
    }
    let mut first = vec![0x00, 0x00, 0x01, 0xB3, 0x2D, 0x01, 0xE0, 0x24];
    first.extend(picture(1));

    let frame = BufferFlags::END_OF_FRAME;
    vec![
        (first, frame | BufferFlags::SYNC_FRAME),
        (picture(2), frame),
        (picture(3), frame),
        (picture(3), frame),
        (picture(2), frame | BufferFlags::END_OF_STREAM),
    ]
}

fn supply_sink(component: &Component, next_handle: &mut u64) -> Result<()> {
    let sink = &component.pipeline().sink;
    let geometry = sink.geometry();
    let count = sink.buffer_count();
    for _ in 0..count {
        *next_handle += 1;
        component.fill_buffer(Buffer::client(ClientHandle(*next_handle), &geometry.plane_sizes))?;
    }
    component.populate(PortDirection::Sink, count)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    utils::init_tracing();

    info!("hwcodec demo starting");

    let config = utils::load_config("hwcodec.toml")?;
    hwcodec::CONFIG.store(Arc::new(config));

    let advertised = Geometry::nv12(176, 144, 4);
    let device = Arc::new(SoftDevice::new(advertised.clone()));
    let (host, rx) = ChannelHost::new();
    let component = Component::from_global(
        "mpeg2dec",
        ComponentSpec::decoder(CodecFamily::Mpeg2, Coding::Mpeg2, advertised),
        device,
        Arc::new(host),
    )?;

    component.enable_port(PortDirection::Source)?;
    component.enable_port(PortDirection::Sink)?;
    component.start()?;

    let stream = synthetic_stream();
    component.populate(PortDirection::Source, component.pipeline().source.buffer_count())?;
    let mut next_handle = 0;
    supply_sink(&component, &mut next_handle)?;

    for (index, (data, flags)) in stream.into_iter().enumerate() {
        next_handle += 1;
        let timestamp = index as i64 * FRAME_INTERVAL_US;
        component.empty_buffer(Buffer::with_payload(
            ClientHandle(next_handle),
            &data,
            timestamp,
            flags,
        ))?;
    }

    let mut frames = 0usize;
    loop {
        let message = tokio::select! {
            message = rx.recv_async() => message.map_err(|e| eyre!("host channel closed: {e}"))?,
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted");
                break;
            }
        };

        match message {
            HostMessage::Buffer(PortDirection::Source, buffer) => {
                debug!(handle = ?buffer.client_handle(), "input buffer returned");
            }
            HostMessage::Buffer(PortDirection::Sink, buffer) => {
                if buffer.remaining > 0 {
                    frames += 1;
                    info!(
                        timestamp = buffer.timestamp,
                        bytes = buffer.remaining,
                        flags = ?buffer.flags,
                        "frame"
                    );
                }
                // Buffers from before a reallocation are too small; let them go.
                let fits = component
                    .pipeline()
                    .sink
                    .geometry()
                    .plane_sizes
                    .iter()
                    .zip(&buffer.planes)
                    .all(|(&size, plane)| plane.data.capacity() >= size);
                if fits && component.port_state(PortDirection::Sink).is_populated() {
                    if let Err(e) = component.fill_buffer(buffer) {
                        debug!("sink buffer not requeued: {}", e);
                    }
                }
            }
            HostMessage::Event(HostEvent::PortSettingsChanged { port }) => {
                info!(%port, "reallocating");
                component.disable_port(port)?;
                component.enable_port(port)?;
                supply_sink(&component, &mut next_handle)?;
            }
            HostMessage::Event(HostEvent::EndOfStream) => {
                info!(frames, "end of stream");
                break;
            }
            HostMessage::Event(HostEvent::Error { error, recoverable }) => {
                if recoverable {
                    warn!("component error: {}", error);
                } else {
                    error!("component error: {}", error);
                    return Err(eyre!(error));
                }
            }
            HostMessage::Event(event) => debug!(?event, "event"),
        }
    }

    let stats = component.stats();
    component.stop();
    info!(?stats, "hwcodec demo finished");
    Ok(())
}
