//! nusb-based USB transport implementation.

use std::time::Duration;

use nusb::transfer::{ControlIn, ControlOut, ControlType, TransferError};
use nusb::{Device, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument};

use super::traits::{
    ConfigurationInfo, ControlRequest, DeviceDescription, DeviceFilter, InterfaceInfo, Recipient,
    RequestKind, TransportError, UsbBus, UsbTransport,
};

/// Endpoint descriptor type; these belong to the endpoint, not the interface class.
const ENDPOINT_DESCRIPTOR_TYPE: u8 = 0x05;

/// Enumerates real devices through nusb.
#[derive(Debug, Clone, Copy, Default)]
pub struct NusbBus;

impl UsbBus for NusbBus {
    type Device = NusbTransport;

    #[instrument(level = "debug", skip(self))]
    fn enumerate(&self, filter: &DeviceFilter) -> Result<Vec<NusbTransport>, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::EnumerationFailed(e.to_string()))?;

        let mut opened = Vec::new();
        for device_info in devices {
            if !filter.matches(device_info.vendor_id(), device_info.product_id()) {
                continue;
            }
            let classes = device_info.interfaces().map(|i| (i.class(), i.subclass()));
            if !filter.matches_interfaces(classes) {
                continue;
            }
            match NusbTransport::open(&device_info) {
                Ok(transport) => opened.push(transport),
                // Devices we cannot open (permissions, busy) are simply not candidates.
                Err(e) => debug!(
                    vid = %format!("{:04X}", device_info.vendor_id()),
                    pid = %format!("{:04X}", device_info.product_id()),
                    error = %e,
                    "Skipping device"
                ),
            }
        }
        Ok(opened)
    }
}

/// nusb-based USB transport.
pub struct NusbTransport {
    description: DeviceDescription,
    device: Device,
    interface: Option<Interface>,
}

impl NusbTransport {
    fn open(device_info: &nusb::DeviceInfo) -> Result<Self, TransportError> {
        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let configurations = device
            .configurations()
            .map(|config| ConfigurationInfo {
                value: config.configuration_value(),
                interfaces: config
                    .interface_alt_settings()
                    .map(|alt| InterfaceInfo {
                        number: alt.interface_number(),
                        class: alt.class(),
                        subclass: alt.subclass(),
                        protocol: alt.protocol(),
                        extra_descriptors: alt
                            .descriptors()
                            .filter(|d| d.descriptor_type() != ENDPOINT_DESCRIPTOR_TYPE)
                            .map(|d| d.to_vec())
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        let description = DeviceDescription {
            vendor_id: device_info.vendor_id(),
            product_id: device_info.product_id(),
            device_version: device_info.device_version(),
            manufacturer: device_info.manufacturer_string().map(str::to_owned),
            product: device_info.product_string().map(str::to_owned),
            serial_number: device_info.serial_number().map(str::to_owned),
            configurations,
        };

        debug!(
            vid = %format!("{:04X}", description.vendor_id),
            pid = %format!("{:04X}", description.product_id),
            "Opened device"
        );

        Ok(Self {
            description,
            device,
            interface: None,
        })
    }

    fn interface(&self) -> Result<&Interface, TransportError> {
        self.interface.as_ref().ok_or(TransportError::NotClaimed)
    }
}

fn control_type(kind: RequestKind) -> ControlType {
    match kind {
        RequestKind::Standard => ControlType::Standard,
        RequestKind::Class => ControlType::Class,
        RequestKind::Vendor => ControlType::Vendor,
    }
}

fn recipient(recipient: Recipient) -> nusb::transfer::Recipient {
    match recipient {
        Recipient::Device => nusb::transfer::Recipient::Device,
        Recipient::Interface => nusb::transfer::Recipient::Interface,
        Recipient::Endpoint => nusb::transfer::Recipient::Endpoint,
        Recipient::Other => nusb::transfer::Recipient::Other,
    }
}

fn transfer_error(e: TransferError, timeout: Duration) -> TransportError {
    match e {
        // nusb cancels a transfer once its timeout expires.
        TransferError::Cancelled => TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        },
        TransferError::Stall => TransportError::Stall,
        TransferError::Disconnected => TransportError::Disconnected,
        other => TransportError::TransferFailed(other.to_string()),
    }
}

impl UsbTransport for NusbTransport {
    fn description(&self) -> &DeviceDescription {
        &self.description
    }

    #[instrument(level = "debug", skip(self))]
    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        let claimed = match self.device.detach_and_claim_interface(interface).wait() {
            Ok(claimed) => claimed,
            Err(e) => {
                debug!(error = %e, "Kernel driver detach failed, claiming directly");
                self.device
                    .claim_interface(interface)
                    .wait()
                    .map_err(|e| TransportError::ClaimInterfaceFailed {
                        interface,
                        message: e.to_string(),
                    })?
            }
        };
        info!(interface, "Interface claimed");
        self.interface = Some(claimed);
        Ok(())
    }

    fn set_configuration(&self, configuration: u8) -> Result<(), TransportError> {
        self.device
            .set_configuration(configuration)
            .wait()
            .map_err(|e| TransportError::SetConfigurationFailed {
                configuration,
                message: e.to_string(),
            })
    }

    #[instrument(level = "trace", skip(self))]
    fn control_in(
        &self,
        request: ControlRequest,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let data = self
            .interface()?
            .control_in(
                ControlIn {
                    control_type: control_type(request.kind),
                    recipient: recipient(request.recipient),
                    request: request.request,
                    value: request.value,
                    index: request.index,
                    length,
                },
                timeout,
            )
            .wait()
            .map_err(|e| transfer_error(e, timeout))?;
        Ok(data)
    }

    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    fn control_out(
        &self,
        request: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.interface()?
            .control_out(
                ControlOut {
                    control_type: control_type(request.kind),
                    recipient: recipient(request.recipient),
                    request: request.request,
                    value: request.value,
                    index: request.index,
                    data,
                },
                timeout,
            )
            .wait()
            .map_err(|e| transfer_error(e, timeout))
    }
}
