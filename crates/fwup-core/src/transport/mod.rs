//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{ControlDirection, ControlRecord, MockBus, MockTransport};
pub use nusb::{NusbBus, NusbTransport};
pub use traits::{
    ConfigurationInfo, ControlRequest, DeviceDescription, DeviceFilter, DeviceSelector,
    InterfaceInfo, Recipient, RequestKind, TransportError, UsbBus, UsbTransport,
};
