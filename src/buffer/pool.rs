//! Fixed set of hardware-visible buffers per port.

use std::sync::Arc;

use memmap2::MmapMut;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::buffer::frame::{Buffer, BufferOrigin, Plane, PlaneData};
use crate::error::{Error, Result};
use crate::pipeline::port::PortDirection;

/// Upper bound on entries per pool; identity lookup is a linear scan.
pub const MAX_POOL_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub usize);

/// Hardware buffer allocator (ION/gralloc equivalent).
pub trait Allocator: Send + Sync {
    fn allocate(&self, size: usize) -> Result<PlaneData>;
}

/// Page-aligned anonymous mappings.
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapAllocator;

impl Allocator for MmapAllocator {
    fn allocate(&self, size: usize) -> Result<PlaneData> {
        let page = page_size::get();
        let len = size.max(1).div_ceil(page) * page;
        let map = MmapMut::map_anon(len)
            .map_err(|e| Error::ResourceExhausted(format!("map {len} bytes: {e}")))?;
        Ok(PlaneData::Mapped(map))
    }
}

/// Where a pool entry currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Waiting in the port's work queue.
    Queued,
    /// Submitted to the device, not yet returned.
    InFlight,
    /// Owned by a stage between queue boundaries.
    Held,
}

#[derive(Debug)]
pub struct PoolEntry {
    addr: usize,
    plane_sizes: Vec<usize>,
    state: EntryState,
}

/// Snapshot of entry states; the three counts always sum to `capacity`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCensus {
    pub queued: usize,
    pub in_flight: usize,
    pub held: usize,
    pub capacity: usize,
}

pub struct BufferPool {
    direction: PortDirection,
    allocator: Arc<dyn Allocator>,
    entries: Mutex<Vec<PoolEntry>>,
}

impl BufferPool {
    pub fn new(direction: PortDirection, allocator: Arc<dyn Allocator>) -> Self {
        Self {
            direction,
            allocator,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Provision `count` buffers, one allocation per plane.
    ///
    /// The returned buffers are in the `Held` state. On failure every entry
    /// allocated so far is released and the pool is left empty.
    #[instrument(skip(self), fields(port = %self.direction))]
    pub fn allocate(&self, count: usize, plane_sizes: &[usize]) -> Result<Vec<Buffer>> {
        if count > MAX_POOL_SIZE {
            return Err(Error::ResourceExhausted(format!(
                "{count} buffers requested, pool limit is {MAX_POOL_SIZE}"
            )));
        }

        let mut entries = self.entries.lock();
        if !entries.is_empty() {
            return Err(Error::ProtocolViolation(format!(
                "{} pool already holds {} entries",
                self.direction,
                entries.len()
            )));
        }

        let mut buffers = Vec::with_capacity(count);
        for index in 0..count {
            let mut planes = Vec::with_capacity(plane_sizes.len());
            for &size in plane_sizes {
                match self.allocator.allocate(size) {
                    Ok(data) => planes.push(Plane { data, filled: 0 }),
                    Err(e) => {
                        warn!(index, size, "plane allocation failed: {}", e);
                        entries.clear();
                        return Err(e);
                    }
                }
            }
            let buffer = Buffer::from_planes(planes, BufferOrigin::Pool(SlotId(index)));
            entries.push(PoolEntry {
                addr: buffer.identity().unwrap_or_default(),
                plane_sizes: plane_sizes.to_vec(),
                state: EntryState::Held,
            });
            buffers.push(buffer);
        }

        info!(count, ?plane_sizes, "pool allocated");
        Ok(buffers)
    }

    /// Forget every entry. Safe to call repeatedly.
    pub fn release_all(&self) -> usize {
        let mut entries = self.entries.lock();
        let released = entries.len();
        entries.clear();
        if released > 0 {
            debug!(port = %self.direction, released, "pool released");
        }
        released
    }

    /// Map a buffer back to its slot by comparing plane-0 addresses.
    pub fn find_by_identity(&self, buffer: &Buffer) -> Option<SlotId> {
        let addr = buffer.identity()?;
        self.entries
            .lock()
            .iter()
            .position(|entry| entry.addr == addr)
            .map(SlotId)
    }

    pub fn mark(&self, slot: SlotId, state: EntryState) {
        if let Some(entry) = self.entries.lock().get_mut(slot.0) {
            entry.state = state;
        }
    }

    pub fn state(&self, slot: SlotId) -> Option<EntryState> {
        self.entries.lock().get(slot.0).map(|entry| entry.state)
    }

    pub fn census(&self) -> PoolCensus {
        let entries = self.entries.lock();
        let mut census = PoolCensus {
            capacity: entries.len(),
            ..Default::default()
        };
        for entry in entries.iter() {
            match entry.state {
                EntryState::Queued => census.queued += 1,
                EntryState::InFlight => census.in_flight += 1,
                EntryState::Held => census.held += 1,
            }
        }
        census
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_allocated(&self) -> bool {
        !self.entries.lock().is_empty()
    }

    pub fn plane_sizes(&self) -> Option<Vec<usize>> {
        self.entries.lock().first().map(|e| e.plane_sizes.clone())
    }
}
