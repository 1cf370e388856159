//! The ring buffer the DMA engine streams measurements into

use crate::mmio::Region;
use kstring::KString;

#[derive(Debug, Clone)]
pub struct DmaBuffer {
    name: KString,
    region: Region,
    phys_addr: u64,
}

impl DmaBuffer {
    #[must_use]
    pub fn new(name: impl Into<KString>, region: Region, phys_addr: u64) -> Self {
        Self {
            name: name.into(),
            region,
            phys_addr,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bus address the DMA engine writes to
    #[must_use]
    pub fn phys_addr(&self) -> u64 {
        self.phys_addr
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.region.len()
    }

    /// Copy `[start, end)` out of the buffer. Out of range bounds are clamped to the buffer size.
    #[must_use]
    pub fn read(&self, start: usize, end: usize) -> Vec<u8> {
        let end = end.min(self.size());
        if start >= end {
            return vec![];
        }
        self.region.copy_out(start, end - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmio::HeapMemory;

    #[test]
    fn test_read() {
        let mem = HeapMemory::zeroed(16);
        let region = mem.region();
        region.write_bytes(0, &(0..16).collect::<Vec<u8>>());
        let buf = DmaBuffer::new("dmabuf0", region, 0x1000_0000);
        assert_eq!(buf.size(), 16);
        assert_eq!(buf.read(3, 6), [3, 4, 5]);
        assert_eq!(buf.read(14, 100), [14, 15]);
        assert!(buf.read(6, 3).is_empty());
    }
}
