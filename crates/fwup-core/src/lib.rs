//! fwup-core: firmware upload engines for USB bootloaders.
//!
//! This crate turns a firmware image plus a USB control-transfer channel into
//! a correctly sequenced device program for several bootloader families.
//!
//! # Architecture
//!
//! - **Transport**: USB control-transfer abstraction (nusb, mock)
//! - **Target**: the capability trait every family implements
//! - **Registry**: lookup of families by target or utility name
//! - **DFU**: USB DFU 1.1 block download state machine
//! - **LPC43xx**: DFU with the LPC43xx ROM load header
//! - **Micronucleus**: AVR page writes with reset-vector relocation
//! - **FX3**: Cypress boot image decoding and chunk streaming
//!
//! # Example
//!
//! ```no_run
//! use fwup_core::{NusbBus, Registry, TargetOptions};
//!
//! let registry = Registry::<NusbBus>::builtin();
//! let kind = registry.by_target_name("micronucleus").unwrap();
//! let mut target = kind.connect(NusbBus, &TargetOptions::default()).unwrap();
//!
//! let image = std::fs::read("blink.bin").unwrap();
//! target.program(&image, &mut |done, total| println!("{done}/{total}")).unwrap();
//! target.run_user_program().unwrap();
//! ```

pub mod config;
pub mod dfu;
pub mod error;
pub mod fx3;
pub mod lpc43xx;
pub mod micronucleus;
pub mod registry;
pub mod target;
pub mod transport;

// Re-exports for convenience
pub use config::TargetOptions;
pub use dfu::{DfuState, DfuStatus, DfuTarget, FunctionalDescriptor};
pub use error::{FwupError, Result};
pub use fx3::{ChunkMap, Fx3Image, Fx3Target};
pub use lpc43xx::Lpc43xxTarget;
pub use micronucleus::{MicronucleusInfo, MicronucleusTarget};
pub use registry::{Registry, TargetKind};
pub use target::{Progress, Sink, Target, no_progress};
pub use transport::{
    DeviceDescription, DeviceSelector, MockBus, MockTransport, NusbBus, NusbTransport,
    TransportError, UsbBus, UsbTransport,
};
