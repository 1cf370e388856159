//! A small writer for device tree blobs, used to build fixtures and device tree ROM images
use super::{
    FDT_BEGIN_NODE,
    FDT_END,
    FDT_END_NODE,
    FDT_MAGIC,
    FDT_NOP,
    FDT_PROP,
    HEADER_SIZE,
};

const VERSION: u32 = 17;
const LAST_COMP_VERSION: u32 = 16;
/// An empty memory reservation map is a single all-zero entry
const RSVMAP_SIZE: usize = 16;

/// Builds a blob token by token. Nodes must be balanced before calling [`FdtWriter::finish`].
#[derive(Debug, Default)]
pub struct FdtWriter {
    structs: Vec<u8>,
    strings: Vec<u8>,
}

impl FdtWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn word(&mut self, v: u32) {
        self.structs.extend_from_slice(&v.to_be_bytes());
    }

    fn pad(&mut self) {
        while self.structs.len() % 4 != 0 {
            self.structs.push(0);
        }
    }

    fn string_offset(&mut self, name: &str) -> u32 {
        let mut start = 0;
        for s in self.strings.split(|&b| b == 0) {
            if s == name.as_bytes() {
                #[allow(clippy::cast_possible_truncation)]
                let offset = start as u32;
                return offset;
            }
            start += s.len() + 1;
        }
        #[allow(clippy::cast_possible_truncation)]
        let offset = self.strings.len() as u32;
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        offset
    }

    pub fn begin_node(&mut self, name: &str) -> &mut Self {
        self.word(FDT_BEGIN_NODE);
        self.structs.extend_from_slice(name.as_bytes());
        self.structs.push(0);
        self.pad();
        self
    }

    pub fn end_node(&mut self) -> &mut Self {
        self.word(FDT_END_NODE);
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.word(FDT_NOP);
        self
    }

    pub fn property(&mut self, name: &str, value: &[u8]) -> &mut Self {
        let name_offset = self.string_offset(name);
        #[allow(clippy::cast_possible_truncation)]
        let len = value.len() as u32;
        self.word(FDT_PROP);
        self.word(len);
        self.word(name_offset);
        self.structs.extend_from_slice(value);
        self.pad();
        self
    }

    pub fn string_property(&mut self, name: &str, value: &str) -> &mut Self {
        self.stringlist_property(name, &[value])
    }

    pub fn stringlist_property(&mut self, name: &str, values: &[&str]) -> &mut Self {
        let mut value = vec![];
        for v in values {
            value.extend_from_slice(v.as_bytes());
            value.push(0);
        }
        self.property(name, &value)
    }

    /// A property made of 32-bit big-endian cells
    pub fn cells_property(&mut self, name: &str, cells: &[u32]) -> &mut Self {
        let value: Vec<u8> = cells.iter().flat_map(|c| c.to_be_bytes()).collect();
        self.property(name, &value)
    }

    /// Terminate the struct block and lay out the final blob
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn finish(mut self) -> Vec<u8> {
        self.word(FDT_END);
        let off_mem_rsvmap = HEADER_SIZE;
        let off_dt_struct = off_mem_rsvmap + RSVMAP_SIZE;
        let off_dt_strings = off_dt_struct + self.structs.len();
        let total_size = off_dt_strings + self.strings.len();

        let mut blob = Vec::with_capacity(total_size);
        for v in [
            FDT_MAGIC,
            total_size as u32,
            off_dt_struct as u32,
            off_dt_strings as u32,
            off_mem_rsvmap as u32,
            VERSION,
            LAST_COMP_VERSION,
            0,
            self.strings.len() as u32,
            self.structs.len() as u32,
        ] {
            blob.extend_from_slice(&v.to_be_bytes());
        }
        blob.resize(off_dt_struct, 0);
        blob.extend_from_slice(&self.structs);
        blob.extend_from_slice(&self.strings);
        blob
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strings_are_shared() {
        let mut w = FdtWriter::new();
        w.begin_node("")
            .string_property("compatible", "a")
            .begin_node("x")
            .string_property("compatible", "b")
            .end_node()
            .end_node();
        assert_eq!(w.strings, b"compatible\0");
    }

    #[test]
    fn test_alignment() {
        let mut w = FdtWriter::new();
        w.begin_node("abc").property("p", &[1, 2, 3]);
        assert_eq!(w.structs.len() % 4, 0);
        // begin (4) + "abc\0" (4) + prop header (12) + value padded (4)
        assert_eq!(w.structs.len(), 24);
    }
}
