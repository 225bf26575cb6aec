//! Interface to the fixed-function codec.
//!
//! The device has two independent queues. Compressed (or raw, for encoders)
//! units go in on the input side together with a tag; pictures come out of
//! the output side in display order, carrying the tag of the unit they were
//! decoded from. Methods take `&self`: implementations synchronise
//! internally so the four pipeline stages can block on different queues at
//! the same time.

use std::time::Duration;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::pipeline::ledger::Tag;
use crate::pipeline::port::{Geometry, PortDirection};

pub mod soft;

pub use soft::SoftDevice;

/// Bitstream type announced to the device when the input side is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coding {
    Mpeg2,
    /// VC-1 advanced profile (start-code delimited).
    Vc1,
    /// VC-1 simple/main profile in the RCV container.
    Wmv3,
    H264,
    Mpeg4,
    H263,
    /// Raw NV12 input, encoder shape.
    Nv12,
}

/// Decoding options applied before the first unit is submitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceMode {
    /// Timestamps are decode timestamps and must be reassigned in output order.
    pub dts: bool,
    /// Decode intra pictures only; used for thumbnails.
    pub i_frame_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    I,
    P,
    B,
    /// Skipped or otherwise not classified by the hardware.
    Others,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayStatus {
    /// A picture is ready for display.
    Display,
    /// Decoded into a reference buffer; nothing to show.
    DecodeOnly,
    /// The stream changed resolution; output buffers must be reallocated.
    ChangeResolution,
    /// Every queued unit has been decoded.
    DecodingFinished,
}

/// Tag as reported by the hardware alongside an output picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportedTag {
    /// May be outside the ledger range when the hardware lost it.
    Index(i32),
    /// Output produced after end of stream was signalled.
    AfterEos,
}

impl From<Tag> for ReportedTag {
    fn from(tag: Tag) -> Self {
        ReportedTag::Index(tag.0 as i32)
    }
}

#[derive(Debug)]
pub struct OutputCompletion {
    pub buffer: Buffer,
    pub status: DisplayStatus,
    pub tag: ReportedTag,
    pub frame_type: FrameType,
    pub corrupt: bool,
}

/// A buffer the device refused, handed back with the reason.
#[derive(Debug)]
pub struct Rejected {
    pub error: Error,
    pub buffer: Buffer,
}

pub trait CodecDevice: Send + Sync {
    fn set_mode(&self, mode: DeviceMode) -> Result<()>;

    /// Configure the input queue for `count` buffers of `buffer_size` bytes.
    fn configure_input(&self, coding: Coding, buffer_size: usize, count: usize) -> Result<()>;

    /// Parse the stream headers carried by `unit` and report the picture
    /// layout. Does not consume the unit.
    fn probe(&self, unit: &Buffer) -> Result<Geometry>;

    /// Geometry the device currently decodes to.
    fn negotiate_output_geometry(&self) -> Result<Geometry>;

    fn configure_output(&self, geometry: &Geometry, count: usize) -> Result<()>;

    fn submit_input(&self, unit: Buffer, tag: Tag) -> Result<(), Rejected>;

    /// A consumed input buffer, or `None` if none completed within `timeout`.
    fn dequeue_input_completion(&self, timeout: Duration) -> Result<Option<Buffer>>;

    fn submit_output(&self, buffer: Buffer) -> Result<(), Rejected>;

    /// Next output picture. `Error::NotReady` when nothing completed within `timeout`.
    fn dequeue_output_completion(&self, timeout: Duration) -> Result<OutputCompletion>;

    /// Drop pending work on one side and hand back every buffer still held.
    fn flush(&self, direction: PortDirection) -> Vec<Buffer>;

    fn stop(&self);
}
