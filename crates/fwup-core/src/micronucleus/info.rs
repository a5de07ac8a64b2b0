//! Bootloader parameters reported by GET_INFO and the timing derived from them.

use std::io::Cursor;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::{FwupError, Result};

/// Extra delay per page write the bootloader asks for unless fast mode is on.
const WRITE_MARGIN_MS: u32 = 2;
/// Encoded duration flag: erasing all pages takes a quarter of writing them.
const FAST_ERASE_FLAG: u8 = 0x80;

/// AVR device signatures (bytes 2 and 3 of the signature row).
const AVR_NAMES: &[(u16, &str)] = &[
    (0x9206, "ATtiny45"),
    (0x930B, "ATtiny85"),
    (0x930C, "ATtiny84"),
    (0x930D, "ATtiny861"),
    (0x9311, "ATtiny88"),
    (0x9315, "ATtiny841"),
    (0x9487, "ATtiny167"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MicronucleusInfo {
    pub protocol_version: u8,
    pub flash_size: u32,
    pub page_size: u32,
    pub page_count: u32,
    pub write_duration_ms: u32,
    pub erase_duration_ms: u32,
    pub signature: u16,
    /// First byte address past the user program area.
    pub bootloader_start: u32,
}

impl MicronucleusInfo {
    /// Length of the GET_INFO response for a protocol version.
    pub fn info_length(protocol_version: u8) -> Result<u16> {
        match protocol_version {
            1 => Ok(4),
            2 => Ok(6),
            other => Err(FwupError::UnsupportedProtocol(other)),
        }
    }

    pub fn parse(protocol_version: u8, data: &[u8], fast_mode: bool) -> Result<Self> {
        let expected = Self::info_length(protocol_version)? as usize;
        if data.len() < expected {
            return Err(FwupError::InvalidResponse(format!(
                "GET_INFO returned {} bytes, expected {expected}",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        let flash_size = cursor.read_u16::<BigEndian>().map_err(malformed)? as u32;
        let page_size = cursor.read_u8().map_err(malformed)? as u32;
        let encoded_duration = cursor.read_u8().map_err(malformed)?;
        let signature = if protocol_version == 2 {
            cursor.read_u16::<BigEndian>().map_err(malformed)?
        } else {
            0
        };

        // Pages are written as whole 4-byte words; v2 sends them one word per request.
        if page_size < 4 || (protocol_version == 2 && page_size % 4 != 0) {
            return Err(FwupError::InvalidResponse(format!(
                "bootloader reports an unusable page size of {page_size} bytes"
            )));
        }

        let page_count = flash_size.div_ceil(page_size);

        let mut write_duration_ms = (encoded_duration & 0x7F) as u32;
        if !fast_mode {
            write_duration_ms += WRITE_MARGIN_MS;
        }

        // Erasing is assumed to cost one page write per page.
        let mut erase_duration_ms = write_duration_ms * page_count;
        if encoded_duration & FAST_ERASE_FLAG != 0 {
            erase_duration_ms /= 4;
        }

        Ok(Self {
            protocol_version,
            flash_size,
            page_size,
            page_count,
            write_duration_ms,
            erase_duration_ms,
            signature,
            bootloader_start: page_count * page_size,
        })
    }

    pub fn write_duration(&self) -> Duration {
        Duration::from_millis(self.write_duration_ms as u64)
    }

    pub fn erase_duration(&self) -> Duration {
        Duration::from_millis(self.erase_duration_ms as u64)
    }

    /// Short description of the target's processor.
    pub fn cpu_name(&self) -> String {
        if self.protocol_version == 1 {
            return "cannot be detected (using the v1 protocol)".to_string();
        }
        AVR_NAMES
            .iter()
            .find(|(signature, _)| *signature == self.signature)
            .map(|(_, name)| name.to_string())
            .unwrap_or_else(|| format!("unknown (signature: 0x{:04x})", self.signature))
    }
}

fn malformed(e: std::io::Error) -> FwupError {
    FwupError::InvalidResponse(format!("GET_INFO: {e}"))
}
