//! Cypress FX3 boot image container ("CY" images).
//!
//! Layout: `"CY"`, image control byte, image type byte, then records of
//! `size_in_words: u32 LE`, `address: u32 LE` and `size_in_words * 4` data
//! bytes. A zero-length record carries the entry point and is followed by a
//! 32-bit checksum over every data word.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use tracing::{debug, warn};

use crate::error::{FwupError, Result};

pub const IMAGE_MAGIC: &[u8; 2] = b"CY";
const IMAGE_HEADER_SIZE: usize = 4;
const RECORD_HEADER_SIZE: usize = 8;
const CHECKSUM_SIZE: usize = 4;

/// Address-ordered chunk list in declaration order.
///
/// Inserting an address that is already present replaces its data but keeps
/// the position of the first declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkMap {
    chunks: Vec<(u32, Vec<u8>)>,
}

impl ChunkMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a chunk, returning the data it replaced.
    pub fn insert(&mut self, address: u32, data: Vec<u8>) -> Option<Vec<u8>> {
        match self.chunks.iter_mut().find(|(a, _)| *a == address) {
            Some((_, existing)) => Some(std::mem::replace(existing, data)),
            None => {
                self.chunks.push((address, data));
                None
            }
        }
    }

    pub fn get(&self, address: u32) -> Option<&[u8]> {
        self.chunks
            .iter()
            .find(|(a, _)| *a == address)
            .map(|(_, data)| data.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.chunks.iter().map(|(a, data)| (*a, data.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Sum of all chunk lengths in bytes.
    pub fn total_size(&self) -> usize {
        self.chunks.iter().map(|(_, data)| data.len()).sum()
    }

    /// Wrapping sum of every little-endian data word, as the boot ROM computes it.
    pub fn checksum(&self) -> u32 {
        self.chunks
            .iter()
            .flat_map(|(_, data)| data.chunks_exact(4))
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .fold(0u32, u32::wrapping_add)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fx3Image {
    pub image_control: u8,
    pub image_type: u8,
    pub chunks: ChunkMap,
    /// Address of the terminating zero-length record.
    pub entry_point: Option<u32>,
    /// Bytes left over after the last complete record.
    pub trailer: Vec<u8>,
}

impl Fx3Image {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < IMAGE_HEADER_SIZE || &data[..2] != IMAGE_MAGIC {
            return Err(FwupError::Format(
                "the provided file does not appear to be a Cypress image file".into(),
            ));
        }
        let image_control = data[2];
        let image_type = data[3];

        let mut chunks = ChunkMap::new();
        let mut rest = &data[IMAGE_HEADER_SIZE..];
        let mut entry_point = None;

        while rest.len() >= RECORD_HEADER_SIZE {
            let mut cursor = Cursor::new(&rest[..RECORD_HEADER_SIZE]);
            let size_words = cursor.read_u32::<LittleEndian>().map_err(malformed)?;
            let address = cursor.read_u32::<LittleEndian>().map_err(malformed)?;
            rest = &rest[RECORD_HEADER_SIZE..];

            let size = size_words as usize * 4;
            if rest.len() < size {
                return Err(FwupError::Format(format!(
                    "a chunk header declares {size} bytes at 0x{address:08X}, but only {} remain",
                    rest.len()
                )));
            }

            debug!(address = %format!("0x{address:08X}"), size, "FX3 chunk");
            if chunks.insert(address, rest[..size].to_vec()).is_some() {
                debug!(address = %format!("0x{address:08X}"), "Duplicate chunk address replaced");
            }
            rest = &rest[size..];
            entry_point = (size == 0).then_some(address);
        }

        let image = Self {
            image_control,
            image_type,
            chunks,
            entry_point,
            trailer: rest.to_vec(),
        };

        if let Some(declared) = image.declared_checksum() {
            let computed = image.chunks.checksum();
            if declared != computed {
                warn!(
                    declared = %format!("0x{declared:08X}"),
                    computed = %format!("0x{computed:08X}"),
                    "FX3 image checksum mismatch"
                );
            }
        }

        Ok(image)
    }

    /// The checksum word following the entry-point record, if present.
    pub fn declared_checksum(&self) -> Option<u32> {
        self.entry_point?;
        let word: [u8; CHECKSUM_SIZE] = self.trailer.as_slice().try_into().ok()?;
        Some(u32::from_le_bytes(word))
    }

    pub fn checksum_matches(&self) -> Option<bool> {
        self.declared_checksum()
            .map(|declared| declared == self.chunks.checksum())
    }

    pub fn total_size(&self) -> usize {
        self.chunks.total_size()
    }
}

fn malformed(e: std::io::Error) -> FwupError {
    FwupError::Format(format!("FX3 chunk header: {e}"))
}
