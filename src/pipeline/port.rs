//! Port state machine and per-port resources.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::buffer::{Allocator, Buffer, BufferPool};
use crate::error::{Error, Result};
use crate::pipeline::queue::WorkQueue;

/// Hardware stride and slice height alignment.
pub const ALIGNMENT: u32 = 16;

pub fn align(value: u32, to: u32) -> u32 {
    value.div_ceil(to) * to
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortDirection {
    /// Compressed input for decoders, raw input for encoders.
    Source,
    Sink,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortDirection::Source => f.write_str("source"),
            PortDirection::Sink => f.write_str("sink"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Disabled,
    /// Enabled, waiting for the host to supply its buffers.
    Unpopulated,
    Populated,
    Flushing,
}

impl PortState {
    /// Host buffers are registered; Flushing counts.
    pub fn is_populated(self) -> bool {
        matches!(self, PortState::Populated | PortState::Flushing)
    }
}

/// How client buffers reach the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortMode {
    /// Data is copied between client buffers and pool buffers.
    Copy,
    /// Client buffers are handed to the device directly.
    Share,
}

/// Picture layout negotiated with the device (NV12, two planes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub slice_height: u32,
    pub plane_sizes: Vec<usize>,
    /// Buffers the device needs for its reference pictures.
    pub min_buffers: usize,
}

impl Geometry {
    pub fn nv12(width: u32, height: u32, min_buffers: usize) -> Self {
        let stride = align(width, ALIGNMENT);
        let slice_height = align(height, ALIGNMENT);
        let luma = stride as usize * slice_height as usize;
        Self {
            width,
            height,
            stride,
            slice_height,
            plane_sizes: vec![luma, luma / 2],
            min_buffers,
        }
    }

    /// Payload of one displayable picture.
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 3 / 2
    }

    /// Whether switching from `self` to `next` needs the host to reallocate.
    pub fn needs_reconfigure(&self, next: &Geometry, mode: PortMode) -> bool {
        let resized = self.width != next.width || self.height != next.height;
        match mode {
            PortMode::Copy => resized,
            PortMode::Share => resized || self.min_buffers != next.min_buffers,
        }
    }
}

pub struct Port {
    pub direction: PortDirection,
    pub mode: PortMode,
    state: Mutex<PortState>,
    state_changed: Condvar,
    /// Hardware buffers owned by this port.
    pub pool: BufferPool,
    /// Pool buffers ready to be filled or submitted.
    pub work: WorkQueue<Buffer>,
    /// Buffers the host handed in.
    pub client: WorkQueue<Buffer>,
    /// Held shared by a stage for one iteration, exclusively by flush and disable.
    cycle: RwLock<()>,
    geometry: Mutex<Geometry>,
    buffer_count: AtomicUsize,
    registered: AtomicUsize,
    configured: AtomicBool,
    reconfigure_pending: AtomicBool,
}

impl Port {
    pub fn new(
        direction: PortDirection,
        mode: PortMode,
        allocator: Arc<dyn Allocator>,
        geometry: Geometry,
        buffer_count: usize,
    ) -> Self {
        let capacity = crate::buffer::pool::MAX_POOL_SIZE;
        Self {
            direction,
            mode,
            state: Mutex::new(PortState::Disabled),
            state_changed: Condvar::new(),
            pool: BufferPool::new(direction, allocator),
            work: WorkQueue::new(capacity),
            client: WorkQueue::new(capacity),
            cycle: RwLock::new(()),
            geometry: Mutex::new(geometry),
            buffer_count: AtomicUsize::new(buffer_count),
            registered: AtomicUsize::new(0),
            configured: AtomicBool::new(false),
            reconfigure_pending: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> PortState {
        *self.state.lock()
    }

    /// Populated and not flushing.
    pub fn is_active(&self) -> bool {
        self.state() == PortState::Populated
    }

    pub fn is_flushing(&self) -> bool {
        self.state() == PortState::Flushing
    }

    /// Block until the port is Populated, up to `timeout`.
    pub fn wait_active(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if *state != PortState::Populated {
            self.state_changed.wait_for(&mut state, timeout);
        }
        *state == PortState::Populated
    }

    /// Wake stages parked in `wait_active`.
    pub(crate) fn notify(&self) {
        self.state_changed.notify_all();
    }

    /// Shared cycle guard, `None` while a flush or disable holds the port.
    pub fn enter_cycle(&self, wait: Duration) -> Option<RwLockReadGuard<'_, ()>> {
        self.cycle.try_read_for(wait)
    }

    pub(crate) fn lock_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.cycle.write()
    }

    /// `Disabled → Unpopulated`. Enabling an enabled port is a no-op.
    pub fn enable(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state == PortState::Disabled {
            self.registered.store(0, Ordering::Release);
            self.client.reopen();
            self.work.reopen();
            *state = PortState::Unpopulated;
            self.state_changed.notify_all();
            info!(port = %self.direction, "port enabled");
        }
        Ok(())
    }

    /// Count host buffers; the port becomes Populated once all are known.
    pub fn register_buffers(&self, count: usize) -> Result<PortState> {
        let mut state = self.state.lock();
        match *state {
            PortState::Unpopulated => {
                let registered = self.registered.fetch_add(count, Ordering::AcqRel) + count;
                if registered >= self.buffer_count() {
                    *state = PortState::Populated;
                    self.state_changed.notify_all();
                    info!(port = %self.direction, registered, "port populated");
                }
                Ok(*state)
            }
            PortState::Disabled => Err(Error::InvalidState {
                port: self.direction,
                op: "register buffers",
            }),
            other => Ok(other),
        }
    }

    /// Enter Flushing; returns false if a flush is already running.
    pub(crate) fn begin_flush(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            PortState::Populated => {
                *state = PortState::Flushing;
                self.state_changed.notify_all();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn end_flush(&self) {
        let mut state = self.state.lock();
        if *state == PortState::Flushing {
            *state = PortState::Populated;
            self.state_changed.notify_all();
        }
    }

    /// Any state → Disabled. Returns the previous state.
    pub(crate) fn mark_disabled(&self) -> PortState {
        let mut state = self.state.lock();
        let previous = *state;
        *state = PortState::Disabled;
        self.state_changed.notify_all();
        self.configured.store(false, Ordering::Release);
        self.registered.store(0, Ordering::Release);
        debug!(port = %self.direction, ?previous, "port disabled");
        previous
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry.lock().clone()
    }

    pub fn set_geometry(&self, geometry: Geometry) {
        *self.geometry.lock() = geometry;
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count.load(Ordering::Acquire)
    }

    pub fn set_buffer_count(&self, count: usize) {
        self.buffer_count.store(count, Ordering::Release);
    }

    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Acquire)
    }

    pub fn set_configured(&self, configured: bool) {
        self.configured.store(configured, Ordering::Release);
    }

    pub fn reconfigure_pending(&self) -> bool {
        self.reconfigure_pending.load(Ordering::Acquire)
    }

    pub fn set_reconfigure_pending(&self, pending: bool) {
        self.reconfigure_pending.store(pending, Ordering::Release);
    }
}
