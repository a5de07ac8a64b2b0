//! USB Transport layer abstraction.
//!
//! Defines the `UsbBus` trait for device enumeration and the `UsbTransport`
//! trait for control transfers on one opened device, allowing different
//! implementations (nusb, mock, etc.).

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to enumerate devices: {0}")]
    EnumerationFailed(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Failed to select configuration {configuration}: {message}")]
    SetConfigurationFailed { configuration: u8, message: String },

    #[error("No interface claimed on device")]
    NotClaimed,

    #[error("Control transfer stalled")]
    Stall,

    #[error("Control transfer failed: {0}")]
    TransferFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Kind of control request, encoded in bits 5..6 of `bmRequestType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
}

/// Recipient of a control request, encoded in bits 0..4 of `bmRequestType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// Setup packet fields shared by IN and OUT control transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub kind: RequestKind,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlRequest {
    /// Vendor request addressed to the whole device.
    pub const fn vendor(request: u8, value: u16, index: u16) -> Self {
        Self {
            kind: RequestKind::Vendor,
            recipient: Recipient::Device,
            request,
            value,
            index,
        }
    }

    /// Class request addressed to an interface.
    pub const fn class_interface(request: u8, value: u16, interface: u8) -> Self {
        Self {
            kind: RequestKind::Class,
            recipient: Recipient::Interface,
            request,
            value,
            index: interface as u16,
        }
    }
}

/// Match criteria used during enumeration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    /// Interface `(class, subclass)` the device must expose.
    ///
    /// Checked against the interface list the OS already knows, so devices
    /// without it are skipped before being opened.
    pub interface_class: Option<(u8, u8)>,
}

impl DeviceFilter {
    pub fn with_interface_class(self, class: u8, subclass: u8) -> Self {
        Self {
            interface_class: Some((class, subclass)),
            ..self
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|vid| vid == vendor_id)
            && self.product_id.is_none_or(|pid| pid == product_id)
    }

    /// Whether any of the given `(class, subclass)` pairs satisfies the filter.
    pub fn matches_interfaces(&self, mut interfaces: impl Iterator<Item = (u8, u8)>) -> bool {
        match self.interface_class {
            Some(wanted) => interfaces.any(|iface| iface == wanted),
            None => true,
        }
    }
}

/// VID/PID match criteria plus the index of the device to use among matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSelector {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub index: usize,
}

impl DeviceSelector {
    /// Fill in VID/PID the caller left open with a family's defaults.
    pub fn or_ids(self, vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id: self.vendor_id.or(Some(vendor_id)),
            product_id: self.product_id.or(Some(product_id)),
            index: self.index,
        }
    }

    pub fn filter(&self) -> DeviceFilter {
        DeviceFilter {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            interface_class: None,
        }
    }
}

/// One interface alternate setting as seen in a configuration descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// Class-specific descriptors following the interface descriptor.
    pub extra_descriptors: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigurationInfo {
    pub value: u8,
    pub interfaces: Vec<InterfaceInfo>,
}

/// Static description of an enumerated device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDescription {
    pub vendor_id: u16,
    pub product_id: u16,
    /// `bcdDevice` from the device descriptor.
    pub device_version: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub configurations: Vec<ConfigurationInfo>,
}

impl DeviceDescription {
    /// `(class, subclass)` of every interface on every configuration.
    pub fn interface_classes(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        self.configurations
            .iter()
            .flat_map(|config| config.interfaces.iter())
            .map(|iface| (iface.class, iface.subclass))
    }
}

/// Abstract control-transfer channel to one opened device.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Mock implementation for unit testing
pub trait UsbTransport: Send {
    /// Descriptor data captured when the device was enumerated.
    fn description(&self) -> &DeviceDescription;

    /// Claim an interface, detaching a kernel driver bound to it if possible.
    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError>;

    /// Select the active configuration.
    fn set_configuration(&self, configuration: u8) -> Result<(), TransportError>;

    /// Read up to `length` bytes with an IN control transfer.
    fn control_in(
        &self,
        request: ControlRequest,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Send `data` with an OUT control transfer.
    fn control_out(
        &self,
        request: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError>;
}

/// Access to the set of attached devices.
pub trait UsbBus: Clone + Send {
    type Device: UsbTransport + 'static;

    /// List and open every device matching `filter`, in enumeration order.
    fn enumerate(&self, filter: &DeviceFilter) -> Result<Vec<Self::Device>, TransportError>;

    /// Wait for device-side work to finish.
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}
