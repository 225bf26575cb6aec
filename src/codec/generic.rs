use super::{CodecCapability, CodecFamily, Detection};
use crate::buffer::Buffer;
use crate::buffer::BufferFlags;
use crate::device::Coding;
use crate::error::Result;

/// One client buffer is one unit, submitted as is.
#[derive(Debug)]
pub struct Generic {
    coding: Coding,
}

impl Generic {
    pub fn new(coding: Coding) -> Self {
        Self { coding }
    }
}

impl CodecCapability for Generic {
    fn family(&self) -> CodecFamily {
        CodecFamily::Generic
    }

    fn coding(&self) -> Coding {
        self.coding
    }

    fn detect(&mut self, data: &[u8], _flags: BufferFlags, _prior_incomplete: bool) -> Detection {
        Detection::whole(data)
    }

    fn check_prefix(&self, _data: &[u8]) -> bool {
        true
    }

    fn prepare_unit(&mut self, _unit: &mut Buffer) -> Result<()> {
        Ok(())
    }
}
