//! AVR jump instructions: decoding the user reset vector and patching jumps.

use crate::error::{FwupError, Result};

pub const LONG_JUMP_OPCODE: u16 = 0x940C;
pub const RJMP_OPCODE: u16 = 0xC000;
pub const RJMP_OPCODE_MASK: u16 = 0xF000;
pub const RJMP_OFFSET_MASK: u16 = 0x0FFF;
/// Furthest byte address a relative jump is used for.
pub const RJMP_REACH_BYTES: u32 = 0x2000;

/// Read the user program's reset address from its first instruction.
pub fn reset_address(image: &[u8]) -> Result<u32> {
    let [a, b, c, d] = match image.get(..4) {
        Some(&[a, b, c, d]) => [a, b, c, d],
        _ => {
            return Err(FwupError::Format(
                "image is too short to contain a reset vector".into(),
            ));
        }
    };
    let first = u16::from_le_bytes([a, b]);
    let second = u16::from_le_bytes([c, d]);

    if first == LONG_JUMP_OPCODE {
        return Ok(second as u32);
    }

    if first & RJMP_OPCODE_MASK == RJMP_OPCODE {
        // Sign-extend the 12-bit word offset.
        let offset = (((first & RJMP_OFFSET_MASK) << 4) as i16 >> 4) as i32;
        let address = (offset + 1) * 2;
        return u32::try_from(address).map_err(|_| {
            FwupError::Format(format!(
                "reset vector jumps {} bytes before the start of flash",
                -address
            ))
        });
    }

    Err(FwupError::Format(format!(
        "first instruction 0x{first:04X} is not a jump; this does not look like AVR code"
    )))
}

/// Write a jump to `target` located at flash address `instruction_address` into `page`.
pub fn patch_jump(page: &mut [u8], page_size: usize, instruction_address: u32, target: u32) {
    let offset = instruction_address as usize % page_size;

    if target <= RJMP_REACH_BYTES {
        let delta_words = (target as i64 - instruction_address as i64) / 2 - 1;
        let instruction = RJMP_OPCODE | (delta_words as u16 & RJMP_OFFSET_MASK);
        page[offset..offset + 2].copy_from_slice(&instruction.to_le_bytes());
    } else {
        page[offset..offset + 2].copy_from_slice(&LONG_JUMP_OPCODE.to_le_bytes());
        page[offset + 2..offset + 4].copy_from_slice(&(target as u16).to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_jump_patch() {
        let mut page = [0xFFu8; 64];
        patch_jump(&mut page, 64, 0x0000, 0x0010);
        assert_eq!(u16::from_le_bytes([page[0], page[1]]), 0xC007);
        assert_eq!(page[2], 0xFF);
    }

    #[test]
    fn test_long_jump_patch() {
        let mut page = [0xFFu8; 64];
        patch_jump(&mut page, 64, 0x0000, 0x3000);
        assert_eq!(&page[..4], &[0x0C, 0x94, 0x00, 0x30]);
    }

    #[test]
    fn test_backward_jump_from_end_of_flash() {
        // Jump placed just below a bootloader at 0x1800 back to address 0x0034.
        let mut page = [0xFFu8; 64];
        patch_jump(&mut page, 64, 0x17FC, 0x0034);
        let instruction = u16::from_le_bytes([page[60], page[61]]);
        assert_eq!(instruction & RJMP_OPCODE_MASK, RJMP_OPCODE);
        // (0x34 - 0x17FC) / 2 - 1 = -3045 words, masked to 12 bits.
        assert_eq!(instruction & RJMP_OFFSET_MASK, (-3045i32 as u16) & RJMP_OFFSET_MASK);
    }

    #[test]
    fn test_reset_address_from_long_jump() {
        assert_eq!(reset_address(&[0x0C, 0x94, 0x34, 0x12]).unwrap(), 0x1234);
    }

    #[test]
    fn test_reset_address_from_relative_jump() {
        // rjmp .+14 -> offset 7 words, lands at (7 + 1) * 2.
        assert_eq!(reset_address(&[0x07, 0xC0, 0x00, 0x00]).unwrap(), 16);
        // rjmp to self encodes offset -1.
        assert_eq!(reset_address(&[0xFF, 0xCF, 0x00, 0x00]).unwrap(), 0);
    }

    #[test]
    fn test_reset_address_rejects_other_code() {
        assert!(matches!(
            reset_address(&[0x00, 0x00, 0x00, 0x00]),
            Err(FwupError::Format(_))
        ));
        assert!(matches!(reset_address(&[0x0C]), Err(FwupError::Format(_))));
        // rjmp -3 words lands before address 0.
        assert!(reset_address(&[0xFD, 0xCF, 0x00, 0x00]).is_err());
    }
}
