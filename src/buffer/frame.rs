use std::fmt;

use bitflags::bitflags;
use bytes::BytesMut;
use memmap2::MmapMut;
use serde::{Deserialize, Serialize};

use crate::buffer::pool::SlotId;
use crate::error::{Error, Result};

bitflags! {
    /// Flag set carried by every buffer.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct BufferFlags: u32 {
        const END_OF_STREAM = 1 << 0;
        const CODEC_CONFIG = 1 << 1;
        const CORRUPT = 1 << 2;
        /// Unit starts with a key frame.
        const SYNC_FRAME = 1 << 3;
        /// Decoded but not meant for display.
        const DECODE_ONLY = 1 << 4;
        /// The buffer ends a coded frame; lets a splitter complete a unit early.
        const END_OF_FRAME = 1 << 5;
    }
}

/// Opaque handle the host associates with a buffer it supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientHandle(pub u64);

/// Who the memory behind a buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOrigin {
    Client(ClientHandle),
    Pool(SlotId),
}

/// Backing memory of one plane.
pub enum PlaneData {
    /// Host memory.
    Heap(BytesMut),
    /// Hardware-visible memory owned by a pool entry.
    Mapped(MmapMut),
}

impl PlaneData {
    pub fn capacity(&self) -> usize {
        match self {
            PlaneData::Heap(b) => b.len(),
            PlaneData::Mapped(m) => m.len(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            PlaneData::Heap(b) => &b[..],
            PlaneData::Mapped(m) => &m[..],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            PlaneData::Heap(b) => &mut b[..],
            PlaneData::Mapped(m) => &mut m[..],
        }
    }

    /// Start address, used as the identity of hardware buffers.
    pub fn addr(&self) -> usize {
        self.as_slice().as_ptr() as usize
    }
}

pub struct Plane {
    pub data: PlaneData,
    /// Bytes of valid payload at the start of the plane.
    pub filled: usize,
}

impl Plane {
    pub fn heap(size: usize) -> Self {
        Self {
            data: PlaneData::Heap(BytesMut::zeroed(size)),
            filled: 0,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data.as_slice()[..self.filled]
    }
}

/// A described region of memory moving through the pipeline.
///
/// Buffers are moved by value between stages, so a buffer is only ever owned
/// by the stage (or queue) currently holding it.
pub struct Buffer {
    pub planes: Vec<Plane>,
    /// Consumed offset into plane 0.
    pub offset: usize,
    /// Bytes the consumer still has to process.
    pub remaining: usize,
    /// Presentation (or decode, in DTS mode) timestamp in microseconds.
    pub timestamp: i64,
    pub flags: BufferFlags,
    pub origin: BufferOrigin,
}

impl Buffer {
    pub fn from_planes(planes: Vec<Plane>, origin: BufferOrigin) -> Self {
        Self {
            planes,
            offset: 0,
            remaining: 0,
            timestamp: 0,
            flags: BufferFlags::empty(),
            origin,
        }
    }

    /// Host-side buffer with one heap plane per entry of `plane_sizes`.
    pub fn client(handle: ClientHandle, plane_sizes: &[usize]) -> Self {
        let planes = plane_sizes.iter().map(|&size| Plane::heap(size)).collect();
        Self::from_planes(planes, BufferOrigin::Client(handle))
    }

    /// Single-plane host buffer pre-filled with `data`.
    pub fn with_payload(
        handle: ClientHandle,
        data: &[u8],
        timestamp: i64,
        flags: BufferFlags,
    ) -> Self {
        let mut buffer = Self::client(handle, &[data.len()]);
        buffer.planes[0].data.as_mut_slice().copy_from_slice(data);
        buffer.planes[0].filled = data.len();
        buffer.remaining = data.len();
        buffer.timestamp = timestamp;
        buffer.flags = flags;
        buffer
    }

    pub fn client_handle(&self) -> Option<ClientHandle> {
        match self.origin {
            BufferOrigin::Client(handle) => Some(handle),
            BufferOrigin::Pool(_) => None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.planes.iter().map(|p| p.data.capacity()).sum()
    }

    pub fn filled_len(&self) -> usize {
        self.planes.iter().map(|p| p.filled).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.filled_len() == 0
    }

    pub fn identity(&self) -> Option<usize> {
        self.planes.first().map(|p| p.data.addr())
    }

    /// Plane-0 bytes not yet consumed.
    pub fn unconsumed(&self) -> &[u8] {
        match self.planes.first() {
            Some(plane) => &plane.payload()[self.offset.min(plane.filled)..],
            None => &[],
        }
    }

    pub fn consume(&mut self, len: usize) {
        self.offset += len;
        self.remaining = self.remaining.saturating_sub(len);
    }

    pub fn is_consumed(&self) -> bool {
        self.unconsumed().is_empty()
    }

    /// Append `data` to plane 0.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        let plane = self.plane0_mut()?;
        let end = plane.filled + data.len();
        if end > plane.data.capacity() {
            return Err(Error::ResourceExhausted(format!(
                "unit of {} bytes does not fit a {} byte buffer",
                end,
                plane.data.capacity()
            )));
        }
        plane.data.as_mut_slice()[plane.filled..end].copy_from_slice(data);
        plane.filled = end;
        Ok(())
    }

    /// Shift the plane-0 payload right and write `prefix` in front of it.
    pub fn prepend(&mut self, prefix: &[u8]) -> Result<()> {
        let plane = self.plane0_mut()?;
        let len = plane.filled;
        if len + prefix.len() > plane.data.capacity() {
            return Err(Error::ResourceExhausted(
                "no room to attach start code".into(),
            ));
        }
        let slice = plane.data.as_mut_slice();
        slice.copy_within(0..len, prefix.len());
        slice[..prefix.len()].copy_from_slice(prefix);
        plane.filled = len + prefix.len();
        Ok(())
    }

    /// Replace the plane-0 payload with `data`.
    pub fn set_payload(&mut self, data: &[u8]) -> Result<()> {
        self.plane0_mut()?.filled = 0;
        self.append(data)
    }

    /// Copy every plane's payload from `src`, truncating to this buffer's planes.
    pub fn copy_planes_from(&mut self, src: &Buffer) {
        for (dst, src) in self.planes.iter_mut().zip(&src.planes) {
            let len = src.filled.min(dst.data.capacity());
            dst.data.as_mut_slice()[..len].copy_from_slice(&src.payload()[..len]);
            dst.filled = len;
        }
    }

    /// Forget payload and metadata, keep the memory.
    pub fn reset(&mut self) {
        for plane in &mut self.planes {
            plane.filled = 0;
        }
        self.offset = 0;
        self.remaining = 0;
        self.timestamp = 0;
        self.flags = BufferFlags::empty();
    }

    fn plane0_mut(&mut self) -> Result<&mut Plane> {
        self.planes
            .first_mut()
            .ok_or_else(|| Error::ProtocolViolation("buffer has no planes".into()))
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("origin", &self.origin)
            .field("planes", &self.planes.len())
            .field("filled", &self.filled_len())
            .field("offset", &self.offset)
            .field("remaining", &self.remaining)
            .field("timestamp", &self.timestamp)
            .field("flags", &self.flags)
            .finish()
    }
}
