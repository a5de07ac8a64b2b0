//! USB DFU class bootloaders.
//!
//! Implements the download half of the DFU 1.1 state machine: find the DFU
//! interface, optionally detach a run-time device into DFU mode, then write
//! the image block by block, polling GET_STATUS after every block.

pub mod descriptor;
pub mod status;

use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::config::TargetOptions;
use crate::error::{FwupError, Result};
use crate::target::{Progress, Sink, Target};
use crate::transport::{
    ControlRequest, DeviceDescription, DeviceSelector, InterfaceInfo, UsbBus, UsbTransport,
};

pub use descriptor::FunctionalDescriptor;
pub use status::{DfuState, DfuStatus};

pub const DFU_INTERFACE_CLASS: u8 = 0xFE;
pub const DFU_INTERFACE_SUBCLASS: u8 = 0x01;
/// `bInterfaceProtocol` of a device running its application.
pub const RUNTIME_PROTOCOL: u8 = 0x01;

pub const DFU_TIMEOUT: Duration = Duration::from_millis(5000);
const DETACH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// DFU class requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuRequest {
    Detach = 0,
    Download = 1,
    Upload = 2,
    GetStatus = 3,
    ClearStatus = 4,
    GetState = 5,
    Abort = 6,
}

/// An opened device together with the DFU parameters read from it.
pub struct DfuLink<D> {
    device: D,
    configuration: u8,
    interface: u8,
    descriptor: FunctionalDescriptor,
    runtime_mode: bool,
}

impl<D: UsbTransport> DfuLink<D> {
    fn out_request(&self, request: DfuRequest, value: u16, data: &[u8]) -> Result<()> {
        self.device.control_out(
            ControlRequest::class_interface(request as u8, value, self.interface),
            data,
            DFU_TIMEOUT,
        )?;
        Ok(())
    }

    fn in_request(&self, request: DfuRequest, value: u16, length: u16) -> Result<Vec<u8>> {
        Ok(self.device.control_in(
            ControlRequest::class_interface(request as u8, value, self.interface),
            length,
            DFU_TIMEOUT,
        )?)
    }

    pub fn get_status(&self) -> Result<DfuStatus> {
        let raw = self.in_request(DfuRequest::GetStatus, 0, status::STATUS_LENGTH)?;
        DfuStatus::from_bytes(&raw)
    }

    pub fn get_state(&self) -> Result<DfuState> {
        let raw = self.in_request(DfuRequest::GetState, 0, 1)?;
        match raw.first() {
            Some(&state) => DfuState::from_u8(state),
            None => Err(FwupError::InvalidResponse("empty GET_STATE response".into())),
        }
    }

    pub fn clear_status(&self) -> Result<()> {
        self.out_request(DfuRequest::ClearStatus, 0, &[])
    }

    pub fn descriptor(&self) -> &FunctionalDescriptor {
        &self.descriptor
    }

    pub fn is_runtime_mode(&self) -> bool {
        self.runtime_mode
    }
}

/// Locate the first DFU interface on any configuration.
fn find_dfu_interface(description: &DeviceDescription) -> Option<(u8, &InterfaceInfo)> {
    description.configurations.iter().find_map(|config| {
        config
            .interfaces
            .iter()
            .find(|iface| {
                iface.class == DFU_INTERFACE_CLASS && iface.subclass == DFU_INTERFACE_SUBCLASS
            })
            .map(|iface| (config.value, iface))
    })
}

/// Open the selected DFU-capable device once, without any detach handling.
fn open<B: UsbBus>(bus: &B, selector: &DeviceSelector) -> Result<DfuLink<B::Device>> {
    let filter = selector
        .filter()
        .with_interface_class(DFU_INTERFACE_CLASS, DFU_INTERFACE_SUBCLASS);
    let mut device = bus
        .enumerate(&filter)?
        .into_iter()
        .filter(|d| find_dfu_interface(d.description()).is_some())
        .nth(selector.index)
        .ok_or_else(|| {
            FwupError::NotFound(format!("no DFU device at index {}", selector.index))
        })?;

    let (configuration, iface) = find_dfu_interface(device.description())
        .ok_or_else(|| FwupError::NotFound("DFU interface disappeared".into()))?;
    let interface = iface.number;
    let runtime_mode = iface.protocol == RUNTIME_PROTOCOL;
    let descriptor = FunctionalDescriptor::find(&iface.extra_descriptors)?;

    // A kernel driver may own the interface, and the configuration may
    // already be active; neither failure stops us from talking to the device.
    if let Err(e) = device.claim_interface(interface) {
        debug!(error = %e, "Claiming DFU interface failed");
    }
    if let Err(e) = device.set_configuration(configuration) {
        debug!(error = %e, "Selecting configuration failed");
    }

    debug!(
        configuration,
        interface,
        runtime_mode,
        transfer_size = descriptor.transfer_size,
        "Found DFU interface"
    );

    Ok(DfuLink {
        device,
        configuration,
        interface,
        descriptor,
        runtime_mode,
    })
}

/// Connect to a DFU device, switching it into DFU mode first if asked to.
#[instrument(level = "info", skip(bus))]
pub fn connect<B: UsbBus>(
    bus: &B,
    selector: &DeviceSelector,
    detach: bool,
    detach_timeout: Duration,
) -> Result<DfuLink<B::Device>> {
    let link = open(bus, selector)?;
    if !(detach && link.runtime_mode && link.descriptor.will_detach()) {
        return Ok(link);
    }

    info!("Device is in run-time mode, requesting detach");
    if let Err(e) = link.out_request(DfuRequest::Detach, link.descriptor.detach_timeout_ms, &[]) {
        debug!(error = %e, "DFU_DETACH not acknowledged");
    }
    drop(link);

    wait_for_dfu_mode(bus, selector, detach_timeout)
}

/// Poll until the device re-enumerates in DFU mode or `timeout` elapses.
fn wait_for_dfu_mode<B: UsbBus>(
    bus: &B,
    selector: &DeviceSelector,
    timeout: Duration,
) -> Result<DfuLink<B::Device>> {
    let start = Instant::now();
    let mut attempts = 0u64;

    loop {
        attempts += 1;
        match open(bus, selector) {
            Ok(link) if !link.runtime_mode => {
                info!(attempts, "Device re-enumerated in DFU mode");
                return Ok(link);
            }
            Ok(_) => debug!(attempts, "Device still in run-time mode"),
            Err(FwupError::NotFound(_)) => debug!(attempts, "Device not present yet"),
            Err(e) => return Err(e),
        }

        if start.elapsed() >= timeout {
            return Err(FwupError::NotFound(format!(
                "device not found {}ms after DFU_DETACH",
                timeout.as_millis()
            )));
        }
        bus.sleep(DETACH_POLL_INTERVAL);
    }
}

/// Generic DFU target.
pub struct DfuTarget<B: UsbBus> {
    bus: B,
    link: DfuLink<B::Device>,
}

impl<B: UsbBus> DfuTarget<B> {
    pub const TARGET_NAME: &'static str = "dfu";
    pub const UTILITY_NAME: &'static str = "dfu-upload";

    pub fn connect(bus: B, options: &TargetOptions) -> Result<Self> {
        Self::connect_with(
            bus,
            &options.selector,
            options.detach,
            options.detach_timeout(),
        )
    }

    pub fn connect_with(
        bus: B,
        selector: &DeviceSelector,
        detach: bool,
        detach_timeout: Duration,
    ) -> Result<Self> {
        let link = connect(&bus, selector, detach, detach_timeout)?;
        Ok(Self { bus, link })
    }

    pub fn link(&self) -> &DfuLink<B::Device> {
        &self.link
    }

    pub fn transfer_size(&self) -> usize {
        self.link.descriptor.transfer_size as usize
    }

    /// Download one block and wait for the device to finish with it.
    ///
    /// Returns the block number used, `address / transfer_size` unless given.
    pub fn write_page(
        &self,
        address: usize,
        data: &[u8],
        block_number: Option<u16>,
    ) -> Result<u16> {
        let block_number = match block_number {
            Some(block) => block,
            None => u16::try_from(address / self.transfer_size()).map_err(|_| {
                FwupError::Format(format!(
                    "address 0x{address:X} is beyond the last addressable DFU block"
                ))
            })?,
        };

        debug!(block_number, len = data.len(), "DFU_DNLOAD");
        self.link.out_request(DfuRequest::Download, block_number, data)?;
        self.complete_command()?;
        Ok(block_number)
    }

    /// Poll GET_STATUS until the block settles; report any error status.
    fn complete_command(&self) -> Result<()> {
        let status = loop {
            let status = self.link.get_status()?;
            if status.state.is_download_settled() {
                break status;
            }
            if status.poll_timeout_ms > 0 {
                self.bus.sleep(Duration::from_millis(status.poll_timeout_ms as u64));
            }
        };

        if !status.is_ok() {
            return Err(FwupError::Protocol {
                code: status.status,
            });
        }
        Ok(())
    }

    /// Recover a device left in dfuERROR by an earlier session.
    fn prepare_download(&self) -> Result<()> {
        match self.link.get_state() {
            Ok(DfuState::Error) => {
                warn!("Device is in dfuERROR, clearing status");
                self.link.clear_status()
            }
            Ok(state) => {
                debug!(%state, "Initial DFU state");
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "Could not read initial DFU state");
                Ok(())
            }
        }
    }
}

/// Cursor over one download; ends with the zero-length finalize block.
struct Download<'a, B: UsbBus> {
    target: &'a DfuTarget<B>,
    last_block_number: Option<u16>,
}

impl<B: UsbBus> Download<'_, B> {
    fn write(&mut self, address: usize, data: &[u8]) -> Result<()> {
        let block = self.target.write_page(address, data, None)?;
        self.last_block_number = Some(block);
        Ok(())
    }

    fn finish(self) -> Result<()> {
        let block = match self.last_block_number {
            Some(last) => last
                .checked_add(1)
                .ok_or_else(|| FwupError::Format("image fills every DFU block".into()))?,
            None => 0,
        };

        // Many devices leave the bus as soon as they see the final block.
        match self.target.write_page(0, &[], Some(block)) {
            Ok(_) => Ok(()),
            Err(e @ (FwupError::Transport(_) | FwupError::Timeout { .. })) => {
                debug!(error = %e, "Device dropped off after final block");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl<B: UsbBus + 'static> Target for DfuTarget<B> {
    fn name(&self) -> &'static str {
        Self::TARGET_NAME
    }

    #[instrument(level = "info", skip_all, fields(len = image.len()))]
    fn program(&mut self, image: &[u8], progress: Progress<'_>) -> Result<()> {
        self.prepare_download()?;

        let total = image.len();
        let mut download = Download {
            target: self,
            last_block_number: None,
        };

        for (i, chunk) in image.chunks(self.transfer_size()).enumerate() {
            let address = i * self.transfer_size();
            download.write(address, chunk)?;
            progress(address + chunk.len(), total);
        }

        download.finish()?;
        progress(total, total);
        info!(bytes = total, "DFU download complete");
        Ok(())
    }

    fn print_target_info(&self, sink: Sink<'_>) {
        let description = self.link.device.description();
        let descriptor = &self.link.descriptor;
        sink(&format!(
            "    Device: {:04x}:{:04x}",
            description.vendor_id, description.product_id
        ));
        sink(&format!(
            "    Configuration {}, interface {}",
            self.link.configuration, self.link.interface
        ));
        sink(&format!(
            "    Mode: {}",
            if self.link.runtime_mode { "run-time" } else { "DFU" }
        ));
        sink(&format!("    Transfer size: {} B", descriptor.transfer_size));
        sink(&format!("    Detach timeout: {} ms", descriptor.detach_timeout_ms));
        sink(&format!(
            "    Attributes: {}",
            descriptor.attribute_names().join(", ")
        ));
        sink("");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::target::no_progress;
    use crate::transport::{
        ConfigurationInfo, ControlDirection, MockBus, MockTransport, TransportError,
    };

    pub(crate) const GET_STATUS: u8 = DfuRequest::GetStatus as u8;
    pub(crate) const DNLOAD: u8 = DfuRequest::Download as u8;

    pub(crate) fn dfu_device(
        vid: u16,
        pid: u16,
        protocol: u8,
        transfer_size: u16,
    ) -> MockTransport {
        let [ts_lo, ts_hi] = transfer_size.to_le_bytes();
        MockTransport::new(DeviceDescription {
            vendor_id: vid,
            product_id: pid,
            configurations: vec![ConfigurationInfo {
                value: 1,
                interfaces: vec![
                    InterfaceInfo {
                        number: 0,
                        class: 0x03,
                        ..Default::default()
                    },
                    InterfaceInfo {
                        number: 2,
                        class: DFU_INTERFACE_CLASS,
                        subclass: DFU_INTERFACE_SUBCLASS,
                        protocol,
                        extra_descriptors: vec![vec![
                            0x09, 0x21, 0x0D, 0xE8, 0x03, ts_lo, ts_hi, 0x1A, 0x01,
                        ]],
                    },
                ],
            }],
            ..Default::default()
        })
    }

    pub(crate) fn queue_idle(device: &MockTransport, count: usize) {
        for _ in 0..count {
            device.queue_in(GET_STATUS, &[0x00, 0x00, 0x00, 0x00, 0x05, 0x00]);
        }
    }

    fn target(bus: &MockBus) -> DfuTarget<MockBus> {
        DfuTarget::connect_with(
            bus.clone(),
            &DeviceSelector::default(),
            true,
            Duration::from_millis(50),
        )
        .unwrap()
    }

    #[test]
    fn test_connect_records_interface() {
        let bus = MockBus::new();
        let device = dfu_device(0x1234, 0x5678, 2, 64);
        bus.attach(device.clone());

        let dfu = target(&bus);
        assert_eq!(dfu.transfer_size(), 64);
        assert!(!dfu.link().is_runtime_mode());
        assert_eq!(device.claimed_interface(), Some(2));
        assert_eq!(device.configuration(), Some(1));
    }

    #[test]
    fn test_no_dfu_device_is_not_found() {
        let bus = MockBus::new();
        bus.attach(MockTransport::new(DeviceDescription::default()));
        let result = DfuTarget::connect_with(
            bus,
            &DeviceSelector::default(),
            true,
            Duration::from_millis(50),
        );
        assert!(matches!(result, Err(FwupError::NotFound(_))));
    }

    #[test]
    fn test_program_blocks_and_finalize() {
        let bus = MockBus::new();
        let device = dfu_device(0x1234, 0x5678, 2, 4);
        bus.attach(device.clone());
        // Three data blocks plus the finalize block.
        queue_idle(&device, 4);

        let mut dfu = target(&bus);
        let mut updates = Vec::new();
        dfu.program(b"0123456789", &mut |done, total| updates.push((done, total)))
            .unwrap();

        let downloads: Vec<_> = device
            .writes()
            .into_iter()
            .filter(|w| w.request.request == DNLOAD)
            .collect();
        assert_eq!(downloads.len(), 4);
        assert_eq!(downloads[0].data, b"0123");
        assert_eq!(downloads[2].data, b"89");
        let blocks: Vec<_> = downloads.iter().map(|w| w.request.value).collect();
        assert_eq!(blocks, vec![0, 1, 2, 3]);
        assert!(downloads[3].data.is_empty());
        assert_eq!(downloads[0].request.index, 2);

        assert_eq!(updates, vec![(4, 10), (8, 10), (10, 10), (10, 10)]);
    }

    #[test]
    fn test_status_polling_sleeps_poll_timeout() {
        let bus = MockBus::new();
        let device = dfu_device(0x1234, 0x5678, 2, 16);
        bus.attach(device.clone());
        device.queue_in(GET_STATUS, &[0x00, 0x19, 0x00, 0x00, 0x04, 0x00]);
        queue_idle(&device, 2);

        let mut dfu = target(&bus);
        dfu.program(b"abc", &mut no_progress).unwrap();
        assert_eq!(bus.sleeps(), vec![Duration::from_millis(25)]);
    }

    #[test]
    fn test_error_status_aborts_transfer() {
        let bus = MockBus::new();
        let device = dfu_device(0x1234, 0x5678, 2, 4);
        bus.attach(device.clone());
        queue_idle(&device, 1);
        device.queue_in(GET_STATUS, &[0x06, 0x00, 0x00, 0x00, 0x0A, 0x00]);

        let mut dfu = target(&bus);
        let err = dfu.program(&[0u8; 16], &mut no_progress).unwrap_err();
        assert!(matches!(err, FwupError::Protocol { code: 6 }));

        let downloads = device
            .writes()
            .into_iter()
            .filter(|w| w.request.request == DNLOAD)
            .count();
        assert_eq!(downloads, 2);
    }

    #[test]
    fn test_finalize_transport_error_is_swallowed() {
        let bus = MockBus::new();
        let device = dfu_device(0x1234, 0x5678, 2, 8);
        bus.attach(device.clone());
        // Only the data block gets a status; the finalize poll times out.
        queue_idle(&device, 1);

        let mut dfu = target(&bus);
        let mut updates = Vec::new();
        dfu.program(b"12345678", &mut |done, total| updates.push((done, total)))
            .unwrap();
        assert_eq!(updates, vec![(8, 8), (8, 8)]);
    }

    #[test]
    fn test_status_transport_failure_mid_download() {
        let bus = MockBus::new();
        let device = dfu_device(0x1234, 0x5678, 2, 4);
        bus.attach(device.clone());
        queue_idle(&device, 1);
        device.fail_in(GET_STATUS, TransportError::Stall);

        let mut dfu = target(&bus);
        let err = dfu.program(&[0u8; 12], &mut no_progress).unwrap_err();
        assert!(matches!(err, FwupError::Transport(TransportError::Stall)));

        // No further blocks and no finalize after the failed poll.
        let blocks: Vec<_> = device
            .writes()
            .into_iter()
            .filter(|w| w.request.request == DNLOAD)
            .map(|w| w.request.value)
            .collect();
        assert_eq!(blocks, vec![0, 1]);
    }

    #[test]
    fn test_data_block_timeout_propagates() {
        let bus = MockBus::new();
        let device = dfu_device(0x1234, 0x5678, 2, 8);
        bus.attach(device.clone());

        let mut dfu = target(&bus);
        let err = dfu.program(b"12345678", &mut no_progress).unwrap_err();
        assert!(matches!(err, FwupError::Timeout { timeout_ms: 5000 }));
    }

    #[test]
    fn test_initial_error_state_is_cleared() {
        let bus = MockBus::new();
        let device = dfu_device(0x1234, 0x5678, 2, 8);
        bus.attach(device.clone());
        device.queue_in(DfuRequest::GetState as u8, &[0x0A]);
        queue_idle(&device, 2);

        let mut dfu = target(&bus);
        dfu.program(b"1234", &mut no_progress).unwrap();

        let first_out = &device.writes()[0];
        assert_eq!(first_out.request.request, DfuRequest::ClearStatus as u8);
    }

    #[test]
    fn test_explicit_block_number() {
        let bus = MockBus::new();
        let device = dfu_device(0x1234, 0x5678, 2, 8);
        bus.attach(device.clone());
        queue_idle(&device, 1);

        let dfu = target(&bus);
        assert_eq!(dfu.write_page(64, b"xy", Some(42)).unwrap(), 42);
        let log = device.log();
        assert_eq!(log[0].direction, ControlDirection::Out);
        assert_eq!(log[0].request.value, 42);
    }

    #[test]
    fn test_detach_reconnects_in_dfu_mode() {
        let bus = MockBus::new();
        let runtime = dfu_device(0x1234, 0x5678, RUNTIME_PROTOCOL, 64);
        let dfu_mode = dfu_device(0x1234, 0x5678, 2, 64);
        bus.script_enumeration(vec![runtime.clone()]);
        bus.script_enumeration(vec![]);
        bus.script_enumeration(vec![runtime.clone()]);
        bus.attach(dfu_mode.clone());

        let dfu = target(&bus);
        assert!(!dfu.link().is_runtime_mode());
        assert_eq!(bus.enumerations(), 4);

        let detach = &runtime.writes()[0];
        assert_eq!(detach.request.request, DfuRequest::Detach as u8);
        assert_eq!(detach.request.value, 1000);
        assert_eq!(bus.sleeps().len(), 2);
    }

    #[test]
    fn test_detach_disabled_keeps_runtime_link() {
        let bus = MockBus::new();
        let runtime = dfu_device(0x1234, 0x5678, RUNTIME_PROTOCOL, 64);
        bus.attach(runtime.clone());

        let dfu = DfuTarget::connect_with(
            bus.clone(),
            &DeviceSelector::default(),
            false,
            Duration::from_millis(50),
        )
        .unwrap();
        assert!(dfu.link().is_runtime_mode());
        assert!(runtime.writes().is_empty());
    }

    #[test]
    fn test_detach_times_out_only_after_deadline() {
        let bus = MockBus::new();
        let runtime = dfu_device(0x1234, 0x5678, RUNTIME_PROTOCOL, 64);
        bus.script_enumeration(vec![runtime]);

        let timeout = Duration::from_millis(30);
        let start = Instant::now();
        let result =
            DfuTarget::connect_with(bus.clone(), &DeviceSelector::default(), true, timeout);

        assert!(matches!(result, Err(FwupError::NotFound(_))));
        assert!(start.elapsed() >= timeout);
        assert!(bus.enumerations() > 2);
    }
}
