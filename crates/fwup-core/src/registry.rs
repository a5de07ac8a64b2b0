//! Static table of supported bootloader families.
//!
//! Each family is reachable by its target name (`--target dfu`) and by the
//! name of the single-purpose utility it was historically shipped as
//! (`dfu-upload`).

use crate::config::TargetOptions;
use crate::dfu::DfuTarget;
use crate::error::Result;
use crate::fx3::Fx3Target;
use crate::lpc43xx::Lpc43xxTarget;
use crate::micronucleus::MicronucleusTarget;
use crate::target::{Sink, Target};
use crate::transport::UsbBus;

pub type ConnectFn<B> = fn(B, &TargetOptions) -> Result<Box<dyn Target>>;
pub type PreconnectFn = fn(Sink<'_>);

/// One supported family: its names, constructor and pre-connect hints.
pub struct TargetKind<B> {
    pub target_name: &'static str,
    pub utility_name: &'static str,
    pub description: &'static str,
    pub connect: ConnectFn<B>,
    pub preconnect: PreconnectFn,
}

impl<B> TargetKind<B> {
    pub fn connect(&self, bus: B, options: &TargetOptions) -> Result<Box<dyn Target>> {
        (self.connect)(bus, options)
    }

    /// Print anything the user must do before the device can be found.
    pub fn print_preconnect_info(&self, sink: Sink<'_>) {
        (self.preconnect)(sink)
    }
}

fn no_preconnect_info(_sink: Sink<'_>) {}

fn connect_dfu<B: UsbBus + 'static>(bus: B, options: &TargetOptions) -> Result<Box<dyn Target>> {
    Ok(Box::new(DfuTarget::connect(bus, options)?))
}

fn connect_lpc43xx<B: UsbBus + 'static>(
    bus: B,
    options: &TargetOptions,
) -> Result<Box<dyn Target>> {
    Ok(Box::new(Lpc43xxTarget::connect(bus, options)?))
}

fn connect_micronucleus<B: UsbBus + 'static>(
    bus: B,
    options: &TargetOptions,
) -> Result<Box<dyn Target>> {
    Ok(Box::new(MicronucleusTarget::connect(bus, options)?))
}

fn connect_fx3<B: UsbBus + 'static>(bus: B, options: &TargetOptions) -> Result<Box<dyn Target>> {
    Ok(Box::new(Fx3Target::connect(bus, options)?))
}

pub struct Registry<B> {
    kinds: Vec<TargetKind<B>>,
}

impl<B: UsbBus + 'static> Registry<B> {
    /// Every family this crate knows how to program.
    pub fn builtin() -> Self {
        Self {
            kinds: vec![
                TargetKind {
                    target_name: DfuTarget::<B>::TARGET_NAME,
                    utility_name: DfuTarget::<B>::UTILITY_NAME,
                    description: "USB DFU 1.1 class bootloaders",
                    connect: connect_dfu::<B>,
                    preconnect: no_preconnect_info,
                },
                TargetKind {
                    target_name: Lpc43xxTarget::<B>::TARGET_NAME,
                    utility_name: Lpc43xxTarget::<B>::UTILITY_NAME,
                    description: "NXP LPC43xx ROM DFU bootloader",
                    connect: connect_lpc43xx::<B>,
                    preconnect: no_preconnect_info,
                },
                TargetKind {
                    target_name: MicronucleusTarget::<B>::TARGET_NAME,
                    utility_name: MicronucleusTarget::<B>::UTILITY_NAME,
                    description: "Micronucleus AVR bootloader (protocol v1 and v2)",
                    connect: connect_micronucleus::<B>,
                    preconnect: MicronucleusTarget::<B>::print_preconnect_info,
                },
                TargetKind {
                    target_name: Fx3Target::<B::Device>::TARGET_NAME,
                    utility_name: Fx3Target::<B::Device>::UTILITY_NAME,
                    description: "Cypress FX3 USB boot ROM",
                    connect: connect_fx3::<B>,
                    preconnect: no_preconnect_info,
                },
            ],
        }
    }
}

impl<B> Registry<B> {
    pub fn by_target_name(&self, name: &str) -> Option<&TargetKind<B>> {
        self.kinds.iter().find(|kind| kind.target_name == name)
    }

    pub fn by_utility_name(&self, name: &str) -> Option<&TargetKind<B>> {
        self.kinds.iter().find(|kind| kind.utility_name == name)
    }

    pub fn kinds(&self) -> &[TargetKind<B>] {
        &self.kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfu::tests::{dfu_device, queue_idle};
    use crate::error::FwupError;
    use crate::target::no_progress;
    use crate::transport::MockBus;

    #[test]
    fn test_lookup_by_both_names() {
        let registry = Registry::<MockBus>::builtin();
        assert_eq!(registry.kinds().len(), 4);

        for (target, utility) in [
            ("dfu", "dfu-upload"),
            ("lpc43xx", "lpc-upload"),
            ("micronucleus", "microprog"),
            ("fx3", "fx3load"),
        ] {
            let kind = registry.by_target_name(target).unwrap();
            assert_eq!(kind.utility_name, utility);
            let kind = registry.by_utility_name(utility).unwrap();
            assert_eq!(kind.target_name, target);
        }

        assert!(registry.by_target_name("dfu-upload").is_none());
        assert!(registry.by_utility_name("avrdude").is_none());
    }

    #[test]
    fn test_preconnect_info() {
        let registry = Registry::<MockBus>::builtin();

        let mut lines = Vec::new();
        registry
            .by_target_name("micronucleus")
            .unwrap()
            .print_preconnect_info(&mut |line| lines.push(line.to_string()));
        assert_eq!(lines.len(), 2);

        lines.clear();
        registry
            .by_target_name("dfu")
            .unwrap()
            .print_preconnect_info(&mut |line| lines.push(line.to_string()));
        assert!(lines.is_empty());
    }

    #[test]
    fn test_connect_through_registry() {
        let bus = MockBus::new();
        let device = dfu_device(0x1234, 0x5678, 2, 64);
        bus.attach(device.clone());
        queue_idle(&device, 2);

        let registry = Registry::<MockBus>::builtin();
        let kind = registry.by_utility_name("dfu-upload").unwrap();
        let mut target = kind.connect(bus, &TargetOptions::default()).unwrap();
        assert_eq!(target.name(), "dfu");
        target.program(b"payload", &mut no_progress).unwrap();
    }

    #[test]
    fn test_connect_without_device() {
        let registry = Registry::<MockBus>::builtin();
        let kind = registry.by_target_name("fx3").unwrap();
        assert!(matches!(
            kind.connect(MockBus::new(), &TargetOptions::default()),
            Err(FwupError::NotFound(_))
        ));
    }
}
