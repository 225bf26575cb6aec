//! Tag → (timestamp, flags) ring used to recover ordering lost by the hardware.
//!
//! Every compressed unit submitted to the device carries a tag. The device
//! reports the tag back with the decoded picture, possibly out of order and
//! occasionally not at all. Slots are locked independently so the source-side
//! write and the sink-side read never serialize on one lock.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::buffer::BufferFlags;
use crate::device::{FrameType, ReportedTag};

/// Slot count used by the hardware components, comfortably above any DPB depth.
pub const DEFAULT_LEDGER_SIZE: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(pub u32);

impl Tag {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerEntry {
    pub timestamp: i64,
    pub flags: BufferFlags,
}

#[derive(Default)]
struct Slot {
    entry: LedgerEntry,
    in_flight: bool,
}

pub struct TimestampLedger {
    slots: Vec<Mutex<Slot>>,
    cursor: AtomicUsize,
    aliased: AtomicU64,
}

impl TimestampLedger {
    pub fn new(size: usize) -> Self {
        let size = size.max(2);
        Self {
            slots: (0..size).map(|_| Mutex::new(Slot::default())).collect(),
            cursor: AtomicUsize::new(0),
            aliased: AtomicU64::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Record a unit in the next slot and return its tag.
    pub fn assign_tag(&self, timestamp: i64, flags: BufferFlags) -> Tag {
        let size = self.size();
        let index = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % size))
            .unwrap_or_default();
        let tag = Tag(index as u32);
        self.record(tag, timestamp, flags);
        tag
    }

    /// Overwrite a slot.
    pub fn record(&self, tag: Tag, timestamp: i64, flags: BufferFlags) {
        let Some(slot) = self.slots.get(tag.index()) else {
            return;
        };
        let mut slot = slot.lock();
        if slot.in_flight {
            self.aliased.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("ledger_tag_aliased").increment(1);
            warn!(
                tag = tag.0,
                "tag reused before its unit completed; ledger is smaller than the reorder depth"
            );
        }
        slot.entry = LedgerEntry { timestamp, flags };
        slot.in_flight = true;
        trace!(tag = tag.0, timestamp, ?flags, "ledger record");
    }

    /// Entry for a raw tag as reported by hardware; `None` when out of range.
    pub fn lookup(&self, raw: i64) -> Option<LedgerEntry> {
        let index = usize::try_from(raw).ok().filter(|&i| i < self.size())?;
        Some(self.slots[index].lock().entry)
    }

    /// Read a slot, clear its flags and mark its unit as completed.
    pub fn take(&self, tag: Tag) -> LedgerEntry {
        match self.slots.get(tag.index()) {
            Some(slot) => {
                let mut slot = slot.lock();
                let entry = slot.entry;
                slot.entry.flags = BufferFlags::empty();
                slot.in_flight = false;
                entry
            }
            None => LedgerEntry::default(),
        }
    }

    /// Read a slot and clear its flags; the unit stays in flight.
    pub fn take_fallback(&self, tag: Tag) -> LedgerEntry {
        match self.slots.get(tag.index()) {
            Some(slot) => {
                let mut slot = slot.lock();
                let entry = slot.entry;
                slot.entry.flags = BufferFlags::empty();
                entry
            }
            None => LedgerEntry::default(),
        }
    }

    pub fn complete(&self, tag: Tag) {
        if let Some(slot) = self.slots.get(tag.index()) {
            slot.lock().in_flight = false;
        }
    }

    pub fn reset(&self) {
        for slot in &self.slots {
            *slot.lock() = Slot::default();
        }
        self.cursor.store(0, Ordering::Release);
    }

    /// Number of times a tag was reassigned while still in flight.
    pub fn aliased(&self) -> u64 {
        self.aliased.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.lock().in_flight).count()
    }
}

/// Timestamp and flags recovered for one decoded picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub timestamp: i64,
    pub flags: BufferFlags,
    /// The device did not report a usable tag.
    pub missing: bool,
    /// Set once when a run of missing tags crosses the configured limit.
    pub miss_limit_hit: bool,
}

/// Sink-side reordering state.
///
/// Keeps the sequential fallback slot (advanced once per output, valid tag or
/// not) and applies the decode-order correction: outside key frames the
/// previous output's slot is reused so timestamps follow decode order.
#[derive(Debug)]
pub struct OutputTagTracker {
    output_index: usize,
    dts_mode: bool,
    start_check_pending: bool,
    consecutive_misses: u32,
    miss_limit: u32,
}

impl OutputTagTracker {
    pub fn new(ledger_size: usize, dts_mode: bool, miss_limit: u32) -> Self {
        Self {
            // First advance lands on slot 0.
            output_index: ledger_size.max(2) - 1,
            dts_mode,
            start_check_pending: false,
            consecutive_misses: 0,
            miss_limit,
        }
    }

    /// Forget history after a flush; the next valid tag re-anchors the sequence.
    pub fn reset(&mut self, ledger_size: usize) {
        self.output_index = ledger_size.max(2) - 1;
        self.start_check_pending = true;
        self.consecutive_misses = 0;
    }

    pub fn output_index(&self) -> usize {
        self.output_index
    }

    pub fn resolve(
        &mut self,
        ledger: &TimestampLedger,
        reported: ReportedTag,
        frame_type: FrameType,
    ) -> Resolved {
        let size = ledger.size();
        self.output_index = (self.output_index + 1) % size;

        let raw = match reported {
            ReportedTag::AfterEos => {
                return Resolved {
                    timestamp: 0,
                    flags: BufferFlags::empty(),
                    missing: false,
                    miss_limit_hit: false,
                };
            }
            ReportedTag::Index(raw) => raw,
        };

        let Some(reported_entry) = ledger.lookup(i64::from(raw)) else {
            self.consecutive_misses += 1;
            let miss_limit_hit = self.consecutive_misses == self.miss_limit + 1;
            metrics::counter!("ledger_tag_missing").increment(1);
            warn!(
                raw,
                fallback = self.output_index,
                run = self.consecutive_misses,
                "tag out of range, using sequential slot"
            );
            if self.start_check_pending {
                return Resolved {
                    timestamp: 0,
                    flags: BufferFlags::empty(),
                    missing: true,
                    miss_limit_hit,
                };
            }
            let entry = ledger.take_fallback(Tag(self.output_index as u32));
            return Resolved {
                timestamp: entry.timestamp,
                flags: entry.flags,
                missing: true,
                miss_limit_hit,
            };
        };

        self.consecutive_misses = 0;
        let reported_tag = Tag(raw as u32);
        let anchor = frame_type == FrameType::I
            || (frame_type == FrameType::Others
                && reported_entry.flags.contains(BufferFlags::END_OF_STREAM))
            || self.start_check_pending;

        let tag = if anchor {
            self.output_index = reported_tag.index();
            reported_tag
        } else if self.dts_mode {
            ledger.complete(reported_tag);
            Tag(self.output_index as u32)
        } else {
            reported_tag
        };
        self.start_check_pending = false;

        let entry = ledger.take(tag);
        trace!(
            reported = raw,
            used = tag.0,
            timestamp = entry.timestamp,
            ?frame_type,
            "output tag resolved"
        );
        Resolved {
            timestamp: entry.timestamp,
            flags: entry.flags,
            missing: false,
            miss_limit_hit: false,
        }
    }
}
