use crate::buffer::Buffer;
use crate::error::{Error, Result};

/// Turns a client picture into the layout the encoder reads.
pub trait PixelConverter: Send + Sync {
    fn convert(&self, src: &Buffer, dst: &mut Buffer) -> Result<()>;
}

/// Plane-by-plane copy for clients that already produce the device layout.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaneCopyConverter;

impl PixelConverter for PlaneCopyConverter {
    fn convert(&self, src: &Buffer, dst: &mut Buffer) -> Result<()> {
        if src.planes.len() > dst.planes.len() {
            return Err(Error::Conversion(format!(
                "{} source planes, destination has {}",
                src.planes.len(),
                dst.planes.len()
            )));
        }
        for (i, (from, to)) in src.planes.iter().zip(&dst.planes).enumerate() {
            if from.filled > to.data.capacity() {
                return Err(Error::Conversion(format!(
                    "plane {i}: {} bytes into {}",
                    from.filled,
                    to.data.capacity()
                )));
            }
        }
        dst.copy_planes_from(src);
        dst.offset = 0;
        dst.remaining = dst.filled_len();
        dst.timestamp = src.timestamp;
        dst.flags = src.flags;
        Ok(())
    }
}
