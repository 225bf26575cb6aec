//! MPEG-2 video: picture-boundary splitting and start-code checks.

use tracing::{trace, warn};

use super::{find_prefix, starts_with_prefix, CodecCapability, CodecFamily, Detection};
use crate::buffer::{Buffer, BufferFlags};
use crate::device::Coding;
use crate::error::{Error, Result};

const PICTURE: u8 = 0x00;
const SEQUENCE: u8 = 0xB3;
const GROUP: u8 = 0xB8;

#[derive(Debug, Default)]
pub struct Mpeg2 {
    /// A picture header has been seen in the unit being accumulated.
    seen_picture: bool,
}

impl CodecCapability for Mpeg2 {
    fn family(&self) -> CodecFamily {
        CodecFamily::Mpeg2
    }

    fn coding(&self) -> Coding {
        Coding::Mpeg2
    }

    /// A unit runs from its first header to the next picture, sequence or
    /// GOP header that follows a picture header. Without a following header
    /// the unit ends at end of frame or end of stream.
    fn detect(&mut self, data: &[u8], flags: BufferFlags, prior_incomplete: bool) -> Detection {
        if !prior_incomplete {
            self.seen_picture = false;
        }

        let mut from = 0;
        while let Some(found) = find_prefix(&data[from..]) {
            let at = from + found;
            let Some(&code) = data.get(at + 3) else {
                break;
            };
            let boundary = self.seen_picture && matches!(code, PICTURE | SEQUENCE | GROUP);
            if boundary && (at > 0 || prior_incomplete) {
                self.seen_picture = false;
                trace!(at, code, "unit boundary");
                return Detection {
                    consumed: at,
                    complete: true,
                };
            }
            if code == PICTURE {
                self.seen_picture = true;
            }
            from = at + 3;
        }

        let complete =
            flags.contains(BufferFlags::END_OF_STREAM) || flags.contains(BufferFlags::END_OF_FRAME);
        if complete {
            self.seen_picture = false;
        }
        Detection {
            consumed: data.len(),
            complete,
        }
    }

    fn check_prefix(&self, data: &[u8]) -> bool {
        starts_with_prefix(data)
    }

    fn prepare_unit(&mut self, unit: &mut Buffer) -> Result<()> {
        if unit.flags.contains(BufferFlags::END_OF_STREAM) || self.check_prefix(unit.unconsumed()) {
            return Ok(());
        }
        warn!(len = unit.unconsumed().len(), "start code not found");
        Err(Error::MalformedUnit("MPEG-2 unit without start code".into()))
    }
}
