//! In-memory codec used by the demo binary and the test suite.
//!
//! Decodes nothing; it parses just enough MPEG-2 syntax (sequence and picture
//! headers) to report geometry and frame types, then reorders anchor frames
//! the way a real decoder with a one-picture reorder delay does. Output
//! pictures are painted with their tag so tests can tell them apart.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, instrument, trace, warn};

use crate::buffer::{Buffer, BufferFlags};
use crate::device::{
    CodecDevice, Coding, DeviceMode, DisplayStatus, FrameType, OutputCompletion, Rejected,
    ReportedTag,
};
use crate::error::{Error, Result};
use crate::pipeline::ledger::Tag;
use crate::pipeline::port::{Geometry, PortDirection};

const SEQUENCE_HEADER: [u8; 4] = [0x00, 0x00, 0x01, 0xB3];
const PICTURE_HEADER: [u8; 4] = [0x00, 0x00, 0x01, 0x00];

#[derive(Debug, Clone, Copy)]
struct Picture {
    tag: ReportedTag,
    frame_type: FrameType,
    status: DisplayStatus,
    corrupt: bool,
}

struct Inner {
    mode: DeviceMode,
    coding: Option<Coding>,
    stream: Geometry,
    output: Option<Geometry>,
    awaiting_reconfigure: bool,
    held_anchor: Option<Picture>,
    ready: VecDeque<Picture>,
    consumed: VecDeque<Buffer>,
    free_outputs: VecDeque<Buffer>,
    lose_tags: usize,
    output_fault: Option<Error>,
    refuse_empty: bool,
    stopped: bool,
}

pub struct SoftDevice {
    inner: Mutex<Inner>,
    input_done: Condvar,
    output_ready: Condvar,
    dpb: usize,
    submitted: AtomicU64,
    output_dequeues: AtomicU64,
}

impl SoftDevice {
    /// `fallback` is reported by `probe` for streams without an MPEG-2 sequence header.
    pub fn new(fallback: Geometry) -> Self {
        let dpb = fallback.min_buffers;
        Self {
            inner: Mutex::new(Inner {
                mode: DeviceMode::default(),
                coding: None,
                stream: fallback,
                output: None,
                awaiting_reconfigure: false,
                held_anchor: None,
                ready: VecDeque::new(),
                consumed: VecDeque::new(),
                free_outputs: VecDeque::new(),
                lose_tags: 0,
                output_fault: None,
                refuse_empty: false,
                stopped: false,
            }),
            input_done: Condvar::new(),
            output_ready: Condvar::new(),
            dpb,
            submitted: AtomicU64::new(0),
            output_dequeues: AtomicU64::new(0),
        }
    }

    /// Report the next `count` pictures with an out-of-range tag.
    pub fn lose_next_tags(&self, count: usize) {
        self.inner.lock().lose_tags = count;
    }

    /// Queue an arbitrary output event, delivered in order with decoded pictures.
    pub fn inject(&self, tag: ReportedTag, frame_type: FrameType, status: DisplayStatus) {
        self.inner.lock().ready.push_back(Picture {
            tag,
            frame_type,
            status,
            corrupt: false,
        });
        self.output_ready.notify_all();
    }

    /// Fail the next output dequeue with `error`.
    pub fn fail_next_output(&self, error: Error) {
        self.inner.lock().output_fault = Some(error);
        self.output_ready.notify_all();
    }

    /// Report `buffer` as a consumed input, whether or not it was submitted.
    pub fn complete_foreign_input(&self, buffer: Buffer) {
        self.inner.lock().consumed.push_back(buffer);
        self.input_done.notify_all();
    }

    /// Behave like hardware that rejects zero-length input.
    pub fn refuse_empty_units(&self, refuse: bool) {
        self.inner.lock().refuse_empty = refuse;
    }

    pub fn submitted_units(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Completed calls to `dequeue_output_completion`.
    pub fn output_dequeues(&self) -> u64 {
        self.output_dequeues.load(Ordering::Relaxed)
    }

    pub fn held_outputs(&self) -> usize {
        self.inner.lock().free_outputs.len()
    }

    pub fn mode(&self) -> DeviceMode {
        self.inner.lock().mode
    }

    fn next_tag(inner: &mut Inner, tag: Tag) -> ReportedTag {
        if inner.lose_tags > 0 {
            inner.lose_tags -= 1;
            ReportedTag::Index(-1)
        } else {
            tag.into()
        }
    }

    fn paint(buffer: &mut Buffer, picture: &Picture, geometry: Option<&Geometry>) {
        let shows = picture.status == DisplayStatus::Display;
        let sizes = geometry.map(|g| g.plane_sizes.as_slice()).unwrap_or(&[]);
        let shade = match picture.tag {
            ReportedTag::Index(i) => i as u8,
            ReportedTag::AfterEos => 0xFF,
        };
        for (i, plane) in buffer.planes.iter_mut().enumerate() {
            let len = if shows {
                sizes.get(i).copied().unwrap_or(0).min(plane.data.capacity())
            } else {
                0
            };
            plane.data.as_mut_slice()[..len].fill(shade);
            plane.filled = len;
        }
        buffer.offset = 0;
        buffer.remaining = buffer.filled_len();
        buffer.flags = if picture.corrupt {
            BufferFlags::CORRUPT
        } else {
            BufferFlags::empty()
        };
    }
}

/// Width and height from the first MPEG-2 sequence header in `data`.
pub fn parse_sequence_header(data: &[u8]) -> Option<(u32, u32)> {
    let at = find(data, &SEQUENCE_HEADER)?;
    let b = data.get(at + 4..at + 7)?;
    let width = (u32::from(b[0]) << 4) | (u32::from(b[1]) >> 4);
    let height = ((u32::from(b[1]) & 0x0F) << 8) | u32::from(b[2]);
    Some((width, height))
}

/// Picture coding type from the first MPEG-2 picture header in `data`.
pub fn parse_picture_type(data: &[u8]) -> Option<FrameType> {
    let at = find(data, &PICTURE_HEADER)?;
    let byte = *data.get(at + 5)?;
    Some(match (byte >> 3) & 0x07 {
        1 => FrameType::I,
        2 => FrameType::P,
        3 => FrameType::B,
        _ => FrameType::Others,
    })
}

fn find(data: &[u8], pattern: &[u8]) -> Option<usize> {
    data.windows(pattern.len()).position(|w| w == pattern)
}

impl CodecDevice for SoftDevice {
    fn set_mode(&self, mode: DeviceMode) -> Result<()> {
        debug!(?mode, "device mode");
        self.inner.lock().mode = mode;
        Ok(())
    }

    #[instrument(skip(self))]
    fn configure_input(&self, coding: Coding, buffer_size: usize, count: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.coding = Some(coding);
        inner.stopped = false;
        Ok(())
    }

    fn probe(&self, unit: &Buffer) -> Result<Geometry> {
        let mut inner = self.inner.lock();
        if inner.coding.is_none() {
            return Err(Error::Device("probe before input was configured".into()));
        }
        if inner.coding == Some(Coding::Mpeg2) {
            if let Some((width, height)) = parse_sequence_header(unit.unconsumed()) {
                inner.stream = Geometry::nv12(width, height, self.dpb);
            }
        }
        info!(
            width = inner.stream.width,
            height = inner.stream.height,
            "stream geometry"
        );
        Ok(inner.stream.clone())
    }

    fn negotiate_output_geometry(&self) -> Result<Geometry> {
        Ok(self.inner.lock().stream.clone())
    }

    #[instrument(skip(self, geometry), fields(width = geometry.width, height = geometry.height))]
    fn configure_output(&self, geometry: &Geometry, count: usize) -> Result<()> {
        if count < geometry.min_buffers {
            return Err(Error::ResourceExhausted(format!(
                "{count} output buffers, device needs {}",
                geometry.min_buffers
            )));
        }
        let mut inner = self.inner.lock();
        inner.output = Some(geometry.clone());
        inner.awaiting_reconfigure = false;
        drop(inner);
        self.output_ready.notify_all();
        Ok(())
    }

    fn submit_input(&self, unit: Buffer, tag: Tag) -> Result<(), Rejected> {
        let mut inner = self.inner.lock();
        if inner.stopped {
            return Err(Rejected {
                error: Error::Device("device stopped".into()),
                buffer: unit,
            });
        }
        let Some(coding) = inner.coding else {
            return Err(Rejected {
                error: Error::Device("input not configured".into()),
                buffer: unit,
            });
        };
        if inner.refuse_empty && unit.is_empty() {
            return Err(Rejected {
                error: Error::Device("zero-length input".into()),
                buffer: unit,
            });
        }
        self.submitted.fetch_add(1, Ordering::Relaxed);

        let payload = unit.unconsumed();
        if !payload.is_empty() && !unit.flags.contains(BufferFlags::CODEC_CONFIG) {
            if coding == Coding::Mpeg2 {
                if let Some((width, height)) = parse_sequence_header(payload) {
                    let resized = inner
                        .output
                        .as_ref()
                        .is_some_and(|g| g.width != width || g.height != height);
                    if resized {
                        info!(width, height, "resolution change");
                        inner.stream = Geometry::nv12(width, height, self.dpb);
                        inner.awaiting_reconfigure = true;
                        inner.ready.push_back(Picture {
                            tag: tag.into(),
                            frame_type: FrameType::Unknown,
                            status: DisplayStatus::ChangeResolution,
                            corrupt: false,
                        });
                    }
                }
            }

            let frame_type = match coding {
                Coding::Mpeg2 => parse_picture_type(payload).unwrap_or(FrameType::Others),
                _ => FrameType::I,
            };
            let picture = Picture {
                tag: Self::next_tag(&mut inner, tag),
                frame_type,
                status: DisplayStatus::Display,
                corrupt: unit.flags.contains(BufferFlags::CORRUPT),
            };
            trace!(tag = tag.0, ?frame_type, "decoded");

            if inner.mode.i_frame_only && frame_type != FrameType::I {
                trace!(tag = tag.0, "skipped in intra-only mode");
            } else {
                match frame_type {
                    FrameType::I | FrameType::P => match inner.held_anchor.replace(picture) {
                        Some(previous) => inner.ready.push_back(previous),
                        None => inner.ready.push_back(Picture {
                            status: DisplayStatus::DecodeOnly,
                            ..picture
                        }),
                    },
                    _ => inner.ready.push_back(picture),
                }
            }
        }

        if unit.flags.contains(BufferFlags::END_OF_STREAM) {
            if let Some(anchor) = inner.held_anchor.take() {
                inner.ready.push_back(anchor);
            }
            if payload.is_empty() {
                inner.ready.push_back(Picture {
                    tag: tag.into(),
                    frame_type: FrameType::Others,
                    status: DisplayStatus::DecodingFinished,
                    corrupt: false,
                });
            }
        }

        inner.consumed.push_back(unit);
        drop(inner);
        self.input_done.notify_all();
        self.output_ready.notify_all();
        Ok(())
    }

    fn dequeue_input_completion(&self, timeout: Duration) -> Result<Option<Buffer>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(buffer) = inner.consumed.pop_front() {
                return Ok(Some(buffer));
            }
            if inner.stopped || self.input_done.wait_until(&mut inner, deadline).timed_out() {
                return Ok(inner.consumed.pop_front());
            }
        }
    }

    fn submit_output(&self, buffer: Buffer) -> Result<(), Rejected> {
        let mut inner = self.inner.lock();
        if inner.stopped {
            return Err(Rejected {
                error: Error::Device("device stopped".into()),
                buffer,
            });
        }
        inner.free_outputs.push_back(buffer);
        drop(inner);
        self.output_ready.notify_all();
        Ok(())
    }

    fn dequeue_output_completion(&self, timeout: Duration) -> Result<OutputCompletion> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(error) = inner.output_fault.take() {
                return Err(error);
            }
            let deliverable = match inner.ready.front() {
                Some(p)
                    if inner.awaiting_reconfigure
                        && p.status != DisplayStatus::ChangeResolution =>
                {
                    false
                }
                Some(_) => !inner.free_outputs.is_empty(),
                None => false,
            };
            if deliverable {
                if let (Some(picture), Some(mut buffer)) =
                    (inner.ready.pop_front(), inner.free_outputs.pop_front())
                {
                    Self::paint(&mut buffer, &picture, inner.output.as_ref());
                    self.output_dequeues.fetch_add(1, Ordering::Relaxed);
                    return Ok(OutputCompletion {
                        buffer,
                        status: picture.status,
                        tag: picture.tag,
                        frame_type: picture.frame_type,
                        corrupt: picture.corrupt,
                    });
                }
            }
            if inner.stopped || self.output_ready.wait_until(&mut inner, deadline).timed_out() {
                return Err(Error::NotReady);
            }
        }
    }

    fn flush(&self, direction: PortDirection) -> Vec<Buffer> {
        let mut inner = self.inner.lock();
        let returned: Vec<Buffer> = match direction {
            PortDirection::Source => {
                inner.held_anchor = None;
                inner.ready.clear();
                inner.consumed.drain(..).collect()
            }
            PortDirection::Sink => inner.free_outputs.drain(..).collect(),
        };
        if !returned.is_empty() {
            debug!(port = %direction, returned = returned.len(), "device flushed");
        }
        drop(inner);
        self.input_done.notify_all();
        self.output_ready.notify_all();
        returned
    }

    fn stop(&self) {
        let mut inner = self.inner.lock();
        if !inner.stopped {
            inner.stopped = true;
            let stranded = inner.free_outputs.len() + inner.consumed.len();
            if stranded > 0 {
                warn!(stranded, "device stopped while holding buffers");
            }
        }
        drop(inner);
        self.input_done.notify_all();
        self.output_ready.notify_all();
    }
}
