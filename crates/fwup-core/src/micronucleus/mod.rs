//! Micronucleus USB bootloader for small AVR microcontrollers.
//!
//! The bootloader lives at the top of flash. Programming always rewrites the
//! whole user area: the first page's reset vector is redirected to the
//! bootloader (v2) and the user's own reset target is stored in the word just
//! below the bootloader, where the bootloader jumps once it is done.

pub mod avr;
pub mod info;

use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, trace, warn};

use crate::config::TargetOptions;
use crate::error::{FwupError, Result};
use crate::target::{Progress, Sink, Target};
use crate::transport::{ControlRequest, DeviceSelector, UsbBus, UsbTransport};

pub use info::MicronucleusInfo;

pub const MICRONUCLEUS_VENDOR_ID: u16 = 0x16d0;
pub const MICRONUCLEUS_PRODUCT_ID: u16 = 0x0753;

pub const MICRONUCLEUS_TIMEOUT: Duration = Duration::from_millis(1000);
/// Highest protocol version this engine speaks.
const MAX_PROTOCOL_VERSION: u8 = 2;
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Lets udev settle the permissions of a freshly plugged device.
const POST_CONNECT_DELAY: Duration = Duration::from_millis(500);

/// Vendor requests understood by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MicronucleusRequest {
    GetInfo = 0,
    /// v1: carries the whole page. v2: only sets the page address.
    WritePage = 1,
    EraseFlash = 2,
    /// v2 only: one 4-byte word spread over wValue and wIndex.
    WriteDword = 3,
    StartApplication = 4,
}

fn protocol_version(device: &impl UsbTransport) -> u8 {
    (device.description().device_version >> 8) as u8
}

/// Wait for a compatible bootloader to appear, claim it and let it settle.
fn find_device<B: UsbBus>(
    bus: &B,
    selector: &DeviceSelector,
    wait: bool,
    timeout: Option<Duration>,
) -> Result<B::Device> {
    let start = Instant::now();

    loop {
        let candidate = bus
            .enumerate(&selector.filter())?
            .into_iter()
            .filter(|d| protocol_version(d) <= MAX_PROTOCOL_VERSION)
            .nth(selector.index);

        if let Some(mut device) = candidate {
            if let Err(e) = device.claim_interface(0) {
                debug!(error = %e, "Claiming interface 0 failed");
            }
            bus.sleep(POST_CONNECT_DELAY);
            return Ok(device);
        }

        if !wait {
            return Err(FwupError::NotFound(
                "no Micronucleus bootloader connected".into(),
            ));
        }
        if let Some(timeout) = timeout {
            if start.elapsed() >= timeout {
                return Err(FwupError::NotFound(format!(
                    "no Micronucleus bootloader appeared within {}ms",
                    timeout.as_millis()
                )));
            }
        }
        bus.sleep(CONNECT_POLL_INTERVAL);
    }
}

/// A Micronucleus bootloader speaking protocol v1 or v2.
pub struct MicronucleusTarget<B: UsbBus> {
    bus: B,
    device: B::Device,
    selector: DeviceSelector,
    reconnect_timeout: Duration,
    info: MicronucleusInfo,
}

impl<B: UsbBus> MicronucleusTarget<B> {
    pub const TARGET_NAME: &'static str = "micronucleus";
    pub const UTILITY_NAME: &'static str = "microprog";

    #[instrument(level = "info", skip_all, fields(wait = options.wait, fast = options.fast_mode))]
    pub fn connect(bus: B, options: &TargetOptions) -> Result<Self> {
        let selector = options
            .selector
            .or_ids(MICRONUCLEUS_VENDOR_ID, MICRONUCLEUS_PRODUCT_ID);
        let device = find_device(&bus, &selector, options.wait, options.wait_timeout())?;

        let version = protocol_version(&device);
        let raw = device.control_in(
            ControlRequest::vendor(MicronucleusRequest::GetInfo as u8, 0, 0),
            MicronucleusInfo::info_length(version)?,
            MICRONUCLEUS_TIMEOUT,
        )?;
        let info = MicronucleusInfo::parse(version, &raw, options.fast_mode)?;

        info!(
            protocol = version,
            flash_size = info.flash_size,
            page_size = info.page_size,
            signature = %format!("0x{:04X}", info.signature),
            "Found Micronucleus bootloader"
        );

        Ok(Self {
            bus,
            device,
            selector,
            reconnect_timeout: options.reconnect_timeout(),
            info,
        })
    }

    pub fn info(&self) -> &MicronucleusInfo {
        &self.info
    }

    pub fn print_preconnect_info(sink: Sink<'_>) {
        sink("Plug the target board in now.");
        sink(
            "If the board is already plugged in, you may need to unplug and replug it \
             before it will be found.",
        );
    }

    fn request_out(
        &self,
        request: MicronucleusRequest,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<()> {
        self.device.control_out(
            ControlRequest::vendor(request as u8, value, index),
            data,
            MICRONUCLEUS_TIMEOUT,
        )?;
        Ok(())
    }

    /// Write one full page, leaving the reset vector handling to `program`.
    fn write_page(&self, address: u16, page: &[u8]) -> Result<()> {
        let page_size = self.info.page_size as u16;
        debug!(address = %format!("0x{address:04X}"), "Writing page");

        if self.info.protocol_version == 1 {
            self.request_out(MicronucleusRequest::WritePage, page_size, address, page)?;
        } else {
            self.request_out(MicronucleusRequest::WritePage, page_size, address, &[])?;
            for word in page.chunks_exact(4) {
                let value = u16::from_le_bytes([word[0], word[1]]);
                let index = u16::from_le_bytes([word[2], word[3]]);
                trace!(value, index, "WRITE_DWORD");
                self.request_out(MicronucleusRequest::WriteDword, value, index, &[])?;
            }
        }

        self.bus.sleep(self.info.write_duration());
        Ok(())
    }

    /// Reacquire the bootloader after it dropped off the bus.
    fn reconnect(&mut self) -> Result<()> {
        match find_device(&self.bus, &self.selector, true, Some(self.reconnect_timeout)) {
            Ok(device) => {
                info!("Reconnected to Micronucleus bootloader");
                self.device = device;
                Ok(())
            }
            Err(e) => Err(FwupError::ProgrammingFailure(format!(
                "board did not come back after erase: {e}"
            ))),
        }
    }
}

impl<B: UsbBus + 'static> Target for MicronucleusTarget<B> {
    fn name(&self) -> &'static str {
        Self::TARGET_NAME
    }

    /// The whole user area is always rewritten.
    fn size_to_program(&self, _image: &[u8]) -> Result<usize> {
        Ok(self.info.flash_size as usize)
    }

    fn erase(&mut self) -> Result<()> {
        let result = self.request_out(MicronucleusRequest::EraseFlash, 0, 0, &[]);
        self.bus.sleep(self.info.erase_duration());

        match result {
            Ok(()) => Ok(()),
            // The board is busy erasing and may stop servicing USB.
            Err(e @ (FwupError::Transport(_) | FwupError::Timeout { .. })) => {
                warn!(error = %e, "Erase request failed, reconnecting");
                self.reconnect()
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(level = "info", skip_all, fields(len = image.len()))]
    fn program(&mut self, image: &[u8], progress: Progress<'_>) -> Result<()> {
        let flash_size = self.info.flash_size as usize;
        let page_size = self.info.page_size as usize;
        let bootloader_start = self.info.bootloader_start;

        if image.len() > flash_size {
            return Err(FwupError::Format(format!(
                "image is {} bytes but only {flash_size} bytes of flash are available",
                image.len()
            )));
        }

        let reset_address = avr::reset_address(image)?;
        debug!(reset_address = %format!("0x{reset_address:04X}"), "User reset vector");

        self.erase()?;

        for page_address in (0..flash_size).step_by(page_size) {
            let is_first = page_address == 0;
            let is_last = page_address + page_size >= bootloader_start as usize;

            let mut page = match image.get(page_address..) {
                Some(rest) if !rest.is_empty() => rest[..rest.len().min(page_size)].to_vec(),
                // The last page carries the user reset jump, so it is always written.
                _ if is_last => Vec::new(),
                _ => continue,
            };
            page.resize(page_size, 0xFF);

            if is_first && self.info.protocol_version == 2 {
                avr::patch_jump(&mut page, page_size, 0, bootloader_start);
            }
            if is_last {
                avr::patch_jump(&mut page, page_size, bootloader_start - 4, reset_address);
            }

            self.write_page(page_address as u16, &page)?;
            progress(page_address, flash_size);
        }

        info!(pages = self.info.page_count, "Micronucleus programming complete");
        Ok(())
    }

    fn run_user_program(&mut self) -> Result<()> {
        info!("Starting user program");
        self.request_out(MicronucleusRequest::StartApplication, 0, 0, &[])
    }

    fn print_target_info(&self, sink: Sink<'_>) {
        let info = &self.info;
        sink(&format!(
            "    Micronucleus protocol supported: v{}",
            info.protocol_version
        ));
        sink(&format!("    Processor: {}", info.cpu_name()));
        sink(&format!("    Maximum program size: {} B", info.flash_size));
        sink(&format!("    Page size: {} B", info.page_size));
        sink(&format!("    Page count: {}", info.page_count));
        sink(&format!(
            "    Sleep time between writes: {} ms",
            info.write_duration_ms
        ));
        sink("");
    }
}
