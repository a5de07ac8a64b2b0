//! DFU functional descriptor (DFU 1.1, section 4.1.3).

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{FwupError, Result};

pub const FUNCTIONAL_DESCRIPTOR_TYPE: u8 = 0x21;
pub const FUNCTIONAL_DESCRIPTOR_LENGTH: usize = 9;

/// Device can download (`bitCanDnload`).
pub const ATTR_CAN_DOWNLOAD: u8 = 1 << 0;
/// Device can upload (`bitCanUpload`).
pub const ATTR_CAN_UPLOAD: u8 = 1 << 1;
/// Device stays responsive after manifestation (`bitManifestationTolerant`).
pub const ATTR_MANIFESTATION_TOLERANT: u8 = 1 << 2;
/// Device detaches itself on DFU_DETACH (`bitWillDetach`).
pub const ATTR_WILL_DETACH: u8 = 1 << 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionalDescriptor {
    pub attributes: u8,
    pub detach_timeout_ms: u16,
    pub transfer_size: u16,
}

impl FunctionalDescriptor {
    /// Find and parse the functional descriptor among an interface's extra descriptors.
    pub fn find(extra_descriptors: &[Vec<u8>]) -> Result<Self> {
        let raw = extra_descriptors
            .iter()
            .find(|d| d.get(1) == Some(&FUNCTIONAL_DESCRIPTOR_TYPE))
            .ok_or_else(|| {
                FwupError::InvalidResponse("DFU interface has no functional descriptor".into())
            })?;
        Self::from_bytes(raw)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < FUNCTIONAL_DESCRIPTOR_LENGTH
            || data[0] as usize != FUNCTIONAL_DESCRIPTOR_LENGTH
            || data[1] != FUNCTIONAL_DESCRIPTOR_TYPE
        {
            return Err(FwupError::InvalidResponse(
                "Error parsing DFU functional descriptor".into(),
            ));
        }
        let mut cursor = Cursor::new(&data[2..]);
        let attributes = cursor.read_u8().map_err(malformed)?;
        let detach_timeout_ms = cursor.read_u16::<LittleEndian>().map_err(malformed)?;
        let transfer_size = cursor.read_u16::<LittleEndian>().map_err(malformed)?;
        if transfer_size == 0 {
            return Err(FwupError::InvalidResponse(
                "DFU functional descriptor reports a zero transfer size".into(),
            ));
        }
        Ok(Self {
            attributes,
            detach_timeout_ms,
            transfer_size,
        })
    }

    pub fn will_detach(&self) -> bool {
        self.attributes & ATTR_WILL_DETACH != 0
    }

    /// Attribute flags as a short human-readable list.
    pub fn attribute_names(&self) -> Vec<&'static str> {
        [
            (ATTR_CAN_DOWNLOAD, "download"),
            (ATTR_CAN_UPLOAD, "upload"),
            (ATTR_MANIFESTATION_TOLERANT, "manifestation-tolerant"),
            (ATTR_WILL_DETACH, "will-detach"),
        ]
        .into_iter()
        .filter(|(bit, _)| self.attributes & bit != 0)
        .map(|(_, name)| name)
        .collect()
    }
}

fn malformed(e: std::io::Error) -> FwupError {
    FwupError::InvalidResponse(format!("DFU functional descriptor: {e}"))
}
