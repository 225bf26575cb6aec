//! Per-family bitstream handling: unit boundaries, prefix checks and the
//! header synthesis some hardware needs before it accepts a unit.

use serde::{Deserialize, Serialize};

use crate::buffer::{Buffer, BufferFlags};
use crate::device::Coding;
use crate::error::Result;

pub mod generic;
pub mod mpeg2;
pub mod vc1;

pub use generic::Generic;
pub use mpeg2::Mpeg2;
pub use vc1::{Vc1, WmvFormat};

/// `00 00 01`, shared by every start-code delimited format.
pub const START_CODE_PREFIX: [u8; 3] = [0x00, 0x00, 0x01];

/// Result of scanning client data for the end of the current unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    /// Bytes of the scanned data belonging to the current unit.
    pub consumed: usize,
    /// The unit ends at `consumed`.
    pub complete: bool,
}

impl Detection {
    pub fn whole(data: &[u8]) -> Self {
        Self {
            consumed: data.len(),
            complete: true,
        }
    }
}

pub trait CodecCapability: Send {
    fn family(&self) -> CodecFamily;

    /// Coding announced to the device. May depend on codec config seen so far.
    fn coding(&self) -> Coding;

    /// Find where the current unit ends in `data`.
    ///
    /// `prior_incomplete` is set when earlier data is already accumulated
    /// for this unit.
    fn detect(&mut self, data: &[u8], flags: BufferFlags, prior_incomplete: bool) -> Detection;

    /// Whether `data` starts the way the device expects a unit to start.
    fn check_prefix(&self, data: &[u8]) -> bool;

    /// Rewrite a complete unit in place before submission.
    fn prepare_unit(&mut self, unit: &mut Buffer) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecFamily {
    Mpeg2,
    /// VC-1 and WMV9; the exact format is learned from codec config.
    Vc1,
    /// Pre-framed units passed through unchanged (other decoders, raw encoder input).
    Generic,
}

impl CodecFamily {
    pub fn capability(self, coding: Coding) -> Box<dyn CodecCapability> {
        match self {
            CodecFamily::Mpeg2 => Box::new(Mpeg2::default()),
            CodecFamily::Vc1 => Box::new(Vc1::default()),
            CodecFamily::Generic => Box::new(Generic::new(coding)),
        }
    }
}

pub(crate) fn starts_with_prefix(data: &[u8]) -> bool {
    data.starts_with(&START_CODE_PREFIX)
}

pub(crate) fn find_prefix(data: &[u8]) -> Option<usize> {
    data.windows(START_CODE_PREFIX.len())
        .position(|w| w == START_CODE_PREFIX)
}
