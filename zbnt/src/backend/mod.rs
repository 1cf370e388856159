//! The platform specific half of a device: how bitstreams reach the hardware, how register
//! windows are mapped and where interrupts come from.
//!
//! [`crate::device::Device`] runs the same discovery over every backend, asking it for a
//! [`Configuration`] and then for the windows of the nodes it finds.

pub mod axi;
pub mod mock;
pub mod pci;

use crate::{
    dma_buffer::DmaBuffer,
    error::Result,
    mmio::RegisterWindow,
};
use std::{
    fmt,
    io,
    sync::Arc,
    time::Duration,
};
use zbnt_utils::{
    fdt::{
        Fdt,
        NodeOffset,
    },
    firmware::BitstreamCatalog,
};

/// Which part of the fabric a device tree describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    /// A device tree overlay applied on top of the live system tree
    Overlay,
    /// The part of a PCIe board that never changes
    Static,
    /// The part of a PCIe board swapped by partial reconfiguration
    Reconfigurable,
}

/// What a backend hands back after programming a bitstream
#[derive(Debug, Default)]
pub struct Configuration {
    /// The device trees to enumerate, in order
    pub trees: Vec<(Partition, Vec<u8>)>,
    /// A DMA buffer the backend found outside of the trees
    pub dma_buffer: Option<DmaBuffer>,
}

/// An interrupt line the DMA engine raises
pub trait InterruptSource: fmt::Debug + Send + Sync {
    /// Wait for at most `timeout` for the line to fire, consuming the event. A zero timeout only
    /// polls.
    /// # Errors
    /// Returns an error if the line can't be waited on
    fn wait(&self, timeout: Duration) -> io::Result<bool>;

    /// Re-arm the line once its causes have been cleared
    /// # Errors
    /// Returns an error if the line can't be written
    fn acknowledge(&self) -> io::Result<()>;
}

pub trait Backend: Send {
    /// The bitstreams this backend can program
    fn catalog(&self) -> &BitstreamCatalog;

    /// The bitstream to load when the device is opened
    /// # Errors
    /// Returns an error if the hardware can't be queried
    fn initial_bitstream(&self) -> Result<String> {
        Ok(self.catalog().first().to_owned())
    }

    /// Drop every mapping handed out for the previous configuration
    fn release(&mut self);

    /// Program `name` and return the device trees describing it
    /// # Errors
    /// Returns an error if the bitstream can't be read or the hardware rejects it
    fn apply_configuration(&mut self, name: &str) -> Result<Configuration>;

    /// Whether the core at `node` is available to be mapped
    fn exposes(&self, partition: Partition, node: &str, compatible: &str) -> bool;

    /// Map the register window of `node`
    /// # Errors
    /// Returns an error if the window can't be mapped
    fn map_window(
        &mut self,
        partition: Partition,
        node: &str,
        base: u64,
        size: u64,
    ) -> Result<RegisterWindow>;

    /// Map the DMA buffer described by `node`
    /// # Errors
    /// Returns an error if the buffer is malformed or can't be mapped
    fn map_dma_buffer(&mut self, fdt: Fdt<'_>, node: NodeOffset) -> Result<DmaBuffer>;

    /// The interrupt line of the DMA engine at `node`
    /// # Errors
    /// Returns an error if the line exists but can't be opened
    fn interrupt(&mut self, node: &str) -> Result<Option<Arc<dyn InterruptSource>>>;
}

/// Parse a sysfs attribute holding a hex number, with or without `0x`
pub(crate) fn parse_hex(text: &str) -> Option<u64> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u64::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0x1f000000\n"), Some(0x1f00_0000));
        assert_eq!(parse_hex("00400000"), Some(0x40_0000));
        assert_eq!(parse_hex(""), None);
        assert_eq!(parse_hex("0xnope"), None);
    }
}
