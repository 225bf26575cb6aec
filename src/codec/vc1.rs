//! VC-1 / WMV9.
//!
//! The container hands over a BITMAPINFOHEADER as codec config. Its
//! compression fourcc selects between WMV3 (simple/main profile, needs an
//! RCV sequence layer and per-frame prefix) and VC-1 advanced profile (needs
//! the ASF binding stripped and a frame start code).

use tracing::{debug, info, warn};

use super::{starts_with_prefix, CodecCapability, CodecFamily, Detection};
use crate::buffer::{Buffer, BufferFlags};
use crate::device::Coding;
use crate::error::{Error, Result};

pub const BITMAPINFOHEADER_SIZE: usize = 40;
pub const BITMAPINFOHEADER_ASFBINDING_SIZE: usize = 41;

const FOURCC_WMV3: u32 = 0x3356_4d57;
const FOURCC_WVC1: u32 = 0x3143_5657;
const FOURCC_WMVA: u32 = 0x4156_4d57;

const FRAME_START_CODE: [u8; 4] = [0x00, 0x00, 0x01, 0x0D];
/// Frame size and presentation time placeholders expected in front of WMV3 frames.
const WMV3_FRAME_PREFIX: [u8; 8] = [0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
const DEFAULT_STRUCT_C: [u8; 4] = [0x30, 0x00, 0x00, 0x00];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WmvFormat {
    #[default]
    Unknown,
    Wmv3,
    Vc1,
}

#[derive(Debug, Default)]
pub struct Vc1 {
    format: WmvFormat,
}

impl Vc1 {
    pub fn format(&self) -> WmvFormat {
        self.format
    }

    fn read_u32(data: &[u8], at: usize) -> Option<u32> {
        let bytes: [u8; 4] = data.get(at..at + 4)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    /// 36-byte RCV sequence layer built from the BITMAPINFOHEADER.
    fn wmv3_sequence_layer(header: &[u8]) -> Result<Vec<u8>> {
        if header.len() < BITMAPINFOHEADER_SIZE {
            return Err(Error::MalformedUnit(format!(
                "{} byte codec config cannot hold a BITMAPINFOHEADER",
                header.len()
            )));
        }
        let width = Self::read_u32(header, 4).unwrap_or_default();
        let height = Self::read_u32(header, 8).unwrap_or_default();
        let struct_c: [u8; 4] = header
            .get(BITMAPINFOHEADER_SIZE..BITMAPINFOHEADER_SIZE + 4)
            .and_then(|s| s.try_into().ok())
            .unwrap_or(DEFAULT_STRUCT_C);

        let mut layer = Vec::with_capacity(36);
        layer.extend_from_slice(&[0x00, 0x00, 0x00, 0xC5]);
        layer.extend_from_slice(&[0x04, 0x00, 0x00, 0x00]);
        layer.extend_from_slice(&struct_c);
        layer.extend_from_slice(&height.to_le_bytes());
        layer.extend_from_slice(&width.to_le_bytes());
        layer.extend_from_slice(&[0x0C, 0x00, 0x00, 0x00]);
        layer.extend_from_slice(&[0xB3, 0x19, 0x00, 0x00]);
        layer.extend_from_slice(&[0x44, 0x62, 0x05, 0x00]);
        layer.extend_from_slice(&[0x0F, 0x00, 0x00, 0x00]);
        debug!(width, height, "WMV3 sequence layer");
        Ok(layer)
    }

    fn prepare_config(&self, unit: &mut Buffer) -> Result<()> {
        let header = unit.unconsumed().to_vec();
        let payload = match self.format {
            WmvFormat::Wmv3 => Self::wmv3_sequence_layer(&header)?,
            WmvFormat::Vc1 => match header.get(BITMAPINFOHEADER_ASFBINDING_SIZE..) {
                Some(rest) => rest.to_vec(),
                None => {
                    return Err(Error::MalformedUnit(format!(
                        "{} byte codec config is shorter than its ASF binding",
                        header.len()
                    )))
                }
            },
            WmvFormat::Unknown => {
                return Err(Error::MalformedUnit("codec config with unknown fourcc".into()))
            }
        };
        unit.offset = 0;
        unit.set_payload(&payload)?;
        unit.remaining = payload.len();
        Ok(())
    }
}

impl CodecCapability for Vc1 {
    fn family(&self) -> CodecFamily {
        CodecFamily::Vc1
    }

    fn coding(&self) -> Coding {
        match self.format {
            WmvFormat::Wmv3 => Coding::Wmv3,
            _ => Coding::Vc1,
        }
    }

    /// Units arrive pre-framed; codec config also pins down the format.
    fn detect(&mut self, data: &[u8], flags: BufferFlags, _prior_incomplete: bool) -> Detection {
        if flags.contains(BufferFlags::CODEC_CONFIG) {
            match Self::read_u32(data, 16) {
                Some(FOURCC_WMV3) => self.format = WmvFormat::Wmv3,
                Some(FOURCC_WVC1) | Some(FOURCC_WMVA) => self.format = WmvFormat::Vc1,
                other => warn!(fourcc = ?other, "unrecognised compression id"),
            }
            info!(format = ?self.format, "WMV format");
        }
        Detection::whole(data)
    }

    /// WMV3 frames never carry a prefix of their own.
    fn check_prefix(&self, data: &[u8]) -> bool {
        match self.format {
            WmvFormat::Vc1 => starts_with_prefix(data),
            _ => false,
        }
    }

    fn prepare_unit(&mut self, unit: &mut Buffer) -> Result<()> {
        if unit.flags.contains(BufferFlags::CODEC_CONFIG) {
            return self.prepare_config(unit);
        }
        if unit.flags.contains(BufferFlags::END_OF_STREAM) || self.check_prefix(unit.unconsumed()) {
            return Ok(());
        }
        let prefix: &[u8] = match self.format {
            WmvFormat::Wmv3 => &WMV3_FRAME_PREFIX,
            WmvFormat::Vc1 => &FRAME_START_CODE,
            WmvFormat::Unknown => {
                return Err(Error::MalformedUnit("frame before codec config".into()))
            }
        };
        unit.prepend(prefix)
            .map_err(|_| Error::MalformedUnit("no room to attach start code".into()))?;
        unit.remaining += prefix.len();
        Ok(())
    }
}
