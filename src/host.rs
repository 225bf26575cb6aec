//! Callbacks into the media framework that owns the component.

use flume::{Receiver, Sender};
use tracing::warn;

use crate::buffer::Buffer;
use crate::error::Error;
use crate::pipeline::port::PortDirection;

#[derive(Debug, Clone)]
pub enum HostEvent {
    /// Sink geometry changed; the host must disable, reallocate and re-enable the port.
    PortSettingsChanged { port: PortDirection },
    Error { error: Error, recoverable: bool },
    FlushComplete { port: PortDirection },
    PortDisabled { port: PortDirection },
    PortEnabled { port: PortDirection },
    /// An end-of-stream buffer left the sink port.
    EndOfStream,
}

pub trait Host: Send + Sync {
    fn on_event(&self, event: HostEvent);

    /// Give a client buffer back. Sink buffers carry output, source buffers are empty.
    fn return_buffer(&self, port: PortDirection, buffer: Buffer);
}

#[derive(Debug)]
pub enum HostMessage {
    Event(HostEvent),
    Buffer(PortDirection, Buffer),
}

/// Delivers everything into a channel for an async consumer.
#[derive(Clone)]
pub struct ChannelHost {
    tx: Sender<HostMessage>,
}

impl ChannelHost {
    pub fn new() -> (Self, Receiver<HostMessage>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }

    fn send(&self, message: HostMessage) {
        if let Err(e) = self.tx.send(message) {
            warn!("host receiver dropped: {:?}", e.into_inner());
        }
    }
}

impl Host for ChannelHost {
    fn on_event(&self, event: HostEvent) {
        self.send(HostMessage::Event(event));
    }

    fn return_buffer(&self, port: PortDirection, buffer: Buffer) {
        self.send(HostMessage::Buffer(port, buffer));
    }
}
