//! NXP LPC43xx ROM DFU bootloader.
//!
//! The ROM speaks plain DFU but expects the image to be prefixed with a
//! small header telling it how many 512-byte blocks to load into RAM.

use tracing::debug;

use crate::config::TargetOptions;
use crate::dfu::DfuTarget;
use crate::error::{FwupError, Result};
use crate::target::{Progress, Sink, Target};
use crate::transport::UsbBus;

pub const LPC_VENDOR_ID: u16 = 0x1fc9;
pub const LPC_PRODUCT_ID: u16 = 0x000c;

pub const HEADER_SIZE: usize = 16;
pub const BLOCK_SIZE: usize = 512;

/// Build the 16-byte load header for an image of `image_len` bytes.
pub fn header(image_len: usize) -> Result<[u8; HEADER_SIZE]> {
    let blocks = (image_len + HEADER_SIZE).div_ceil(BLOCK_SIZE);
    let blocks = u16::try_from(blocks).map_err(|_| {
        FwupError::Format(format!(
            "{image_len} bytes do not fit the LPC43xx load header"
        ))
    })?;

    let mut header = [0xFF; HEADER_SIZE];
    header[0] = 0xDA;
    header[1] = 0xFF;
    header[2..4].copy_from_slice(&blocks.to_le_bytes());
    Ok(header)
}

/// LPC43xx in DFU mode.
pub struct Lpc43xxTarget<B: UsbBus> {
    dfu: DfuTarget<B>,
}

impl<B: UsbBus> Lpc43xxTarget<B> {
    pub const TARGET_NAME: &'static str = "lpc43xx";
    pub const UTILITY_NAME: &'static str = "lpc-upload";

    pub fn connect(bus: B, options: &TargetOptions) -> Result<Self> {
        let selector = options.selector.or_ids(LPC_VENDOR_ID, LPC_PRODUCT_ID);
        // The ROM claims to be in run-time mode; detaching it would only lose it.
        let dfu = DfuTarget::connect_with(bus, &selector, false, options.detach_timeout())?;
        Ok(Self { dfu })
    }
}

impl<B: UsbBus + 'static> Target for Lpc43xxTarget<B> {
    fn name(&self) -> &'static str {
        Self::TARGET_NAME
    }

    fn size_to_program(&self, image: &[u8]) -> Result<usize> {
        Ok(image.len() + HEADER_SIZE)
    }

    fn program(&mut self, image: &[u8], progress: Progress<'_>) -> Result<()> {
        let header = header(image.len())?;
        debug!(blocks = u16::from_le_bytes([header[2], header[3]]), "LPC43xx header");

        let mut framed = Vec::with_capacity(HEADER_SIZE + image.len());
        framed.extend_from_slice(&header);
        framed.extend_from_slice(image);
        self.dfu.program(&framed, progress)
    }

    fn erase(&mut self) -> Result<()> {
        self.dfu.erase()
    }

    fn run_user_program(&mut self) -> Result<()> {
        self.dfu.run_user_program()
    }

    fn print_target_info(&self, sink: Sink<'_>) {
        self.dfu.print_target_info(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfu::tests::{DNLOAD, dfu_device, queue_idle};
    use crate::dfu::RUNTIME_PROTOCOL;
    use crate::target::no_progress;
    use crate::transport::MockBus;

    #[test]
    fn test_header_block_count() {
        let header = header(1000).unwrap();
        assert_eq!(&header[..4], &[0xDA, 0xFF, 0x02, 0x00]);
        assert!(header[4..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_header_counts_its_own_size() {
        // 496 + 16 fills exactly one block; one more byte spills into a second.
        assert_eq!(header(496).unwrap()[2], 1);
        assert_eq!(header(497).unwrap()[2], 2);
    }

    #[test]
    fn test_header_overflow_rejected() {
        assert!(header(BLOCK_SIZE * 0x1_0000).is_err());
    }

    #[test]
    fn test_program_prepends_header_without_detach() {
        let bus = MockBus::new();
        // The ROM reports run-time mode; it must not be detached.
        let device = dfu_device(LPC_VENDOR_ID, LPC_PRODUCT_ID, RUNTIME_PROTOCOL, 2048);
        bus.attach(device.clone());
        queue_idle(&device, 2);

        let mut lpc = Lpc43xxTarget::connect(bus, &TargetOptions::default()).unwrap();
        assert_eq!(lpc.size_to_program(&[0u8; 100]).unwrap(), 116);
        lpc.program(&[0x42; 100], &mut no_progress).unwrap();

        let downloads: Vec<_> = device
            .writes()
            .into_iter()
            .filter(|w| w.request.request == DNLOAD)
            .collect();
        assert_eq!(downloads.len(), 2);
        assert_eq!(downloads[0].data.len(), 116);
        assert_eq!(&downloads[0].data[..4], &[0xDA, 0xFF, 0x01, 0x00]);
        assert_eq!(downloads[0].data[16], 0x42);
    }

    #[test]
    fn test_other_vendor_not_matched() {
        let bus = MockBus::new();
        bus.attach(dfu_device(0x1234, 0x5678, 2, 2048));
        assert!(matches!(
            Lpc43xxTarget::connect(bus, &TargetOptions::default()),
            Err(FwupError::NotFound(_))
        ));
    }
}
