//! DFU device states and the GET_STATUS response.

use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{FwupError, Result};

/// Length of a GET_STATUS response.
pub const STATUS_LENGTH: u16 = 6;

/// DFU device state (DFU 1.1, section 6.1.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuState {
    AppIdle,
    AppDetach,
    DfuIdle,
    DownloadSync,
    DownloadBusy,
    DownloadIdle,
    ManifestSync,
    Manifest,
    ManifestWaitReset,
    UploadIdle,
    Error,
}

impl DfuState {
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0x00 => DfuState::AppIdle,
            0x01 => DfuState::AppDetach,
            0x02 => DfuState::DfuIdle,
            0x03 => DfuState::DownloadSync,
            0x04 => DfuState::DownloadBusy,
            0x05 => DfuState::DownloadIdle,
            0x06 => DfuState::ManifestSync,
            0x07 => DfuState::Manifest,
            0x08 => DfuState::ManifestWaitReset,
            0x09 => DfuState::UploadIdle,
            0x0A => DfuState::Error,
            other => {
                return Err(FwupError::InvalidResponse(format!(
                    "unknown DFU state 0x{other:02X}"
                )));
            }
        })
    }

    /// Whether a block write has finished, successfully or not.
    pub fn is_download_settled(&self) -> bool {
        matches!(self, DfuState::DownloadIdle | DfuState::Error)
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DfuState::AppIdle => "appIDLE",
            DfuState::AppDetach => "appDETACH",
            DfuState::DfuIdle => "dfuIDLE",
            DfuState::DownloadSync => "dfuDNLOAD-SYNC",
            DfuState::DownloadBusy => "dfuDNBUSY",
            DfuState::DownloadIdle => "dfuDNLOAD-IDLE",
            DfuState::ManifestSync => "dfuMANIFEST-SYNC",
            DfuState::Manifest => "dfuMANIFEST",
            DfuState::ManifestWaitReset => "dfuMANIFEST-WAIT-RESET",
            DfuState::UploadIdle => "dfuUPLOAD-IDLE",
            DfuState::Error => "dfuERROR",
        };
        f.write_str(name)
    }
}

/// Parsed GET_STATUS response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuStatus {
    pub status: u8,
    pub poll_timeout_ms: u32,
    pub state: DfuState,
}

impl DfuStatus {
    /// Parse `bStatus`, the 24-bit `bwPollTimeout`, and `bState`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < (STATUS_LENGTH - 1) as usize {
            return Err(FwupError::InvalidResponse(format!(
                "GET_STATUS returned {} bytes, expected {}",
                data.len(),
                STATUS_LENGTH
            )));
        }
        let mut cursor = Cursor::new(data);
        let status = cursor.read_u8().map_err(truncated)?;
        let poll_timeout_ms = cursor.read_u24::<LittleEndian>().map_err(truncated)?;
        let state = DfuState::from_u8(cursor.read_u8().map_err(truncated)?)?;
        Ok(Self {
            status,
            poll_timeout_ms,
            state,
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

fn truncated(e: std::io::Error) -> FwupError {
    FwupError::InvalidResponse(format!("GET_STATUS: {e}"))
}

/// Name of a DFU `bStatus` code, as used in the DFU 1.1 specification.
pub fn status_name(code: u8) -> &'static str {
    match code {
        0x00 => "OK",
        0x01 => "errTARGET",
        0x02 => "errFILE",
        0x03 => "errWRITE",
        0x04 => "errERASE",
        0x05 => "errCHECK_ERASED",
        0x06 => "errPROG",
        0x07 => "errVERIFY",
        0x08 => "errADDRESS",
        0x09 => "errNOTDONE",
        0x0A => "errFIRMWARE",
        0x0B => "errVENDOR",
        0x0C => "errUSBR",
        0x0D => "errPOR",
        0x0E => "errUNKNOWN",
        0x0F => "errSTALLEDPKT",
        _ => "reserved",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        let status = DfuStatus::from_bytes(&[0x00, 0x10, 0x27, 0x00, 0x05, 0x00]).unwrap();
        assert!(status.is_ok());
        assert_eq!(status.poll_timeout_ms, 10_000);
        assert_eq!(status.state, DfuState::DownloadIdle);
        assert!(status.state.is_download_settled());
    }

    #[test]
    fn test_parse_24bit_poll_timeout() {
        let status = DfuStatus::from_bytes(&[0x03, 0x01, 0x00, 0x01, 0x0A, 0x00]).unwrap();
        assert_eq!(status.status, 3);
        assert_eq!(status.poll_timeout_ms, 0x01_0001);
        assert_eq!(status.state, DfuState::Error);
    }

    #[test]
    fn test_short_status_rejected() {
        assert!(matches!(
            DfuStatus::from_bytes(&[0, 0, 0]),
            Err(FwupError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_unknown_state_rejected() {
        assert!(DfuState::from_u8(0x0B).is_err());
        assert_eq!(DfuState::from_u8(0x02).unwrap(), DfuState::DfuIdle);
        assert_eq!(DfuState::DfuIdle.to_string(), "dfuIDLE");
    }
}
