//! Cypress FX3 USB boot ROM.
//!
//! The ROM accepts image chunks over vendor request 0xA0 with the target RAM
//! address split across wValue (low half) and wIndex (high half). A
//! zero-length write to the entry point starts the loaded firmware.

pub mod image;

use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::config::TargetOptions;
use crate::error::{FwupError, Result};
use crate::target::{Progress, Sink, Target};
use crate::transport::{ControlRequest, UsbBus, UsbTransport};

pub use image::{ChunkMap, Fx3Image};

pub const FX3_VENDOR_ID: u16 = 0x04b4;
pub const FX3_PRODUCT_ID: u16 = 0x00f3;

pub const FX3_TIMEOUT: Duration = Duration::from_millis(5000);
pub const REQUEST_FIRMWARE: u8 = 0xA0;
/// Largest payload sent in one control request.
pub const MAX_REQUEST_SIZE: usize = 2048;

/// An FX3 in boot ROM mode.
pub struct Fx3Target<D> {
    device: D,
    /// Address of the last chunk sent; the entry point for well-formed images.
    last_address: Option<u32>,
}

impl<D: UsbTransport> Fx3Target<D> {
    pub const TARGET_NAME: &'static str = "fx3";
    pub const UTILITY_NAME: &'static str = "fx3load";

    #[instrument(level = "info", skip_all)]
    pub fn connect<B: UsbBus<Device = D>>(bus: B, options: &TargetOptions) -> Result<Self> {
        let selector = options.selector.or_ids(FX3_VENDOR_ID, FX3_PRODUCT_ID);
        let mut device = bus
            .enumerate(&selector.filter())?
            .into_iter()
            .nth(selector.index)
            .ok_or_else(|| FwupError::NotFound("no FX3 in bootloader mode found".into()))?;

        if let Err(e) = device.claim_interface(0) {
            debug!(error = %e, "Claiming interface 0 failed");
        }

        let description = device.description();
        info!(
            vid = %format!("{:04X}", description.vendor_id),
            pid = %format!("{:04X}", description.product_id),
            "Found FX3 bootloader"
        );

        Ok(Self {
            device,
            last_address: None,
        })
    }

    fn write_chunk(&self, address: u32, data: &[u8]) -> Result<()> {
        debug!(address = %format!("0x{address:08X}"), len = data.len(), "FX3 write");
        self.device.control_out(
            ControlRequest::vendor(REQUEST_FIRMWARE, address as u16, (address >> 16) as u16),
            data,
            FX3_TIMEOUT,
        )?;
        Ok(())
    }

    /// Send one image chunk, split into request-sized writes.
    fn upload(&self, address: u32, data: &[u8]) -> Result<()> {
        let end = u64::from(address) + data.len() as u64;
        if end > 1 << 32 {
            return Err(FwupError::Format(format!(
                "chunk at 0x{address:08X} runs past the end of the address space"
            )));
        }

        for (i, piece) in data.chunks(MAX_REQUEST_SIZE).enumerate() {
            self.write_chunk(address + (i * MAX_REQUEST_SIZE) as u32, piece)?;
        }
        Ok(())
    }
}

impl<D: UsbTransport + 'static> Target for Fx3Target<D> {
    fn name(&self) -> &'static str {
        Self::TARGET_NAME
    }

    fn size_to_program(&self, image: &[u8]) -> Result<usize> {
        Ok(Fx3Image::parse(image)?.total_size())
    }

    #[instrument(level = "info", skip_all, fields(len = image.len()))]
    fn program(&mut self, image: &[u8], progress: Progress<'_>) -> Result<()> {
        let image = Fx3Image::parse(image)?;
        let total = image.total_size();

        let mut written = 0;
        for (address, data) in image.chunks.iter() {
            self.last_address = Some(address);
            self.upload(address, data)?;
            written += data.len();
            progress(written, total);
        }

        info!(chunks = image.chunks.len(), bytes = total, "FX3 image loaded");
        Ok(())
    }

    /// Configuration lives in RAM; there is nothing to erase.
    fn erase(&mut self) -> Result<()> {
        info!("Configuration is volatile; erase skipped.");
        Ok(())
    }

    fn run_user_program(&mut self) -> Result<()> {
        let address = self
            .last_address
            .ok_or(FwupError::InvalidState("no FX3 image has been loaded"))?;
        info!(entry = %format!("0x{address:08X}"), "Starting loaded firmware");
        self.write_chunk(address, &[])
    }

    fn print_target_info(&self, sink: Sink<'_>) {
        let description = self.device.description();
        let text = |s: &Option<String>| s.clone().unwrap_or_else(|| "(none)".to_string());
        sink(&format!(
            "    Serial number: {}",
            text(&description.serial_number)
        ));
        sink(&format!("    Product: {}", text(&description.product)));
        sink(&format!("    Manufacturer: {}", text(&description.manufacturer)));
        sink(&format!(
            "    Device revision: {}.{}",
            description.device_version >> 8,
            description.device_version & 0xFF
        ));
    }
}
