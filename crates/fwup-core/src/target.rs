//! Capability interface shared by every bootloader family.

use crate::error::Result;

/// Progress callback: `(bytes_or_address_done, total)`.
pub type Progress<'a> = &'a mut dyn FnMut(usize, usize);

/// Line-oriented output supplied by the caller for informational text.
pub type Sink<'a> = &'a mut dyn FnMut(&str);

/// Progress callback that ignores every update.
pub fn no_progress(_done: usize, _total: usize) {}

/// A connected bootloader that can be programmed.
///
/// Callers only ever hold a `Box<dyn Target>`; the defaults describe a target
/// with nothing to erase and nothing to start.
pub trait Target {
    /// Registry name of the family this target belongs to.
    fn name(&self) -> &'static str;

    /// Number of bytes `program` will report progress against.
    fn size_to_program(&self, image: &[u8]) -> Result<usize> {
        Ok(image.len())
    }

    /// Write `image` to the device.
    fn program(&mut self, image: &[u8], progress: Progress<'_>) -> Result<()>;

    fn erase(&mut self) -> Result<()> {
        Ok(())
    }

    /// Hand control from the bootloader to the freshly written program.
    fn run_user_program(&mut self) -> Result<()> {
        Ok(())
    }

    fn print_target_info(&self, _sink: Sink<'_>) {}
}
