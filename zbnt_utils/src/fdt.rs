//! Reader for flattened device tree blobs, as found in `.dtbo` overlays and in the device tree
//! ROMs of PCIe boards. Only what is needed to discover hardware cores is supported: walking
//! subnodes and fetching string, string list and big-endian cell properties.
use nom::{
    bytes::complete::{
        tag,
        take,
        take_till,
    },
    number::complete::be_u32,
    sequence::tuple,
    IResult,
};
use std::str::from_utf8;
use thiserror::Error;

pub mod writer;

/// Magic number found at the start of every device tree blob
pub const FDT_MAGIC: u32 = 0xd00d_feed;

/// Size in bytes of the fixed header
pub const HEADER_SIZE: usize = 40;

const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_NOP: u32 = 4;
const FDT_END: u32 = 9;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("Blob is too short to hold a device tree header")]
    Truncated,
    #[error("Bad magic number `{0:#010x}`")]
    Magic(u32),
    #[error("Struct or strings block lies outside of the blob")]
    Layout,
    #[error("Invalid UTF8 in a node name")]
    Utf8,
    #[error("Parsing failed to match the grammar at struct offset {0}")]
    ParseMatch(usize),
    #[error("Unbalanced node nesting")]
    Nesting,
}

/// The fixed header at the start of every blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub total_size: u32,
    pub off_dt_struct: u32,
    pub off_dt_strings: u32,
    pub off_mem_rsvmap: u32,
    pub version: u32,
    pub last_comp_version: u32,
    pub boot_cpuid_phys: u32,
    pub size_dt_strings: u32,
    pub size_dt_struct: u32,
}

/// Location of a node inside the struct block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeOffset(usize);

impl NodeOffset {
    #[must_use]
    pub fn get(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    BeginNode(&'a [u8]),
    EndNode,
    Prop { name_offset: u32, value: &'a [u8] },
    Nop,
    End,
}

fn header(input: &[u8]) -> IResult<&[u8], Header> {
    let (remaining, fields) = tuple((
        be_u32, be_u32, be_u32, be_u32, be_u32, be_u32, be_u32, be_u32, be_u32, be_u32,
    ))(input)?;
    let (
        magic,
        total_size,
        off_dt_struct,
        off_dt_strings,
        off_mem_rsvmap,
        version,
        last_comp_version,
        boot_cpuid_phys,
        size_dt_strings,
        size_dt_struct,
    ) = fields;
    Ok((
        remaining,
        Header {
            magic,
            total_size,
            off_dt_struct,
            off_dt_strings,
            off_mem_rsvmap,
            version,
            last_comp_version,
            boot_cpuid_phys,
            size_dt_strings,
            size_dt_struct,
        },
    ))
}

/// Consume the zero padding that follows `consumed` bytes of a token
fn padding(input: &[u8], consumed: usize) -> IResult<&[u8], &[u8]> {
    take((4 - consumed % 4) % 4)(input)
}

fn token(input: &[u8]) -> IResult<&[u8], Token> {
    let (remaining, kind) = be_u32(input)?;
    match kind {
        FDT_BEGIN_NODE => {
            let (remaining, name) = take_till(|b| b == 0)(remaining)?;
            let (remaining, _) = tag(b"\0".as_slice())(remaining)?;
            let (remaining, _) = padding(remaining, name.len() + 1)?;
            Ok((remaining, Token::BeginNode(name)))
        }
        FDT_END_NODE => Ok((remaining, Token::EndNode)),
        FDT_PROP => {
            let (remaining, (len, name_offset)) = tuple((be_u32, be_u32))(remaining)?;
            let (remaining, value) = take(len)(remaining)?;
            let (remaining, _) = padding(remaining, value.len())?;
            Ok((remaining, Token::Prop { name_offset, value }))
        }
        FDT_NOP => Ok((remaining, Token::Nop)),
        FDT_END => Ok((remaining, Token::End)),
        _ => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Tag,
        ))),
    }
}

/// Types that can be filled from a run of 32-bit big-endian cells. Each output consumes exactly
/// one cell, wider outputs are zero-extended and narrower ones are truncated.
pub trait FromCells: Sized {
    /// Number of cells consumed
    const CELLS: usize;
    fn from_cells(cells: &[u32]) -> Self;
}

macro_rules! cell_num {
    ($num:ty) => {
        impl FromCells for $num {
            const CELLS: usize = 1;
            #[allow(clippy::cast_possible_truncation)]
            fn from_cells(cells: &[u32]) -> Self {
                cells[0] as $num
            }
        }
    };
}

cell_num!(u8);
cell_num!(u16);
cell_num!(u32);
cell_num!(u64);
cell_num!(usize);

macro_rules! cell_tuple {
    ($($name:ident),+) => {
        impl<$($name: FromCells),+> FromCells for ($($name,)+) {
            const CELLS: usize = 0 $(+ $name::CELLS)+;
            #[allow(unused_assignments)]
            fn from_cells(cells: &[u32]) -> Self {
                let mut at = 0;
                ($({
                    let v = $name::from_cells(&cells[at..]);
                    at += $name::CELLS;
                    v
                },)+)
            }
        }
    };
}

cell_tuple!(A);
cell_tuple!(A, B);
cell_tuple!(A, B, C);
cell_tuple!(A, B, C, D);

impl<T: FromCells, const N: usize> FromCells for [T; N] {
    const CELLS: usize = T::CELLS * N;
    fn from_cells(cells: &[u32]) -> Self {
        std::array::from_fn(|i| T::from_cells(&cells[i * T::CELLS..]))
    }
}

/// A validated, borrowed device tree blob
#[derive(Debug, Clone, Copy)]
pub struct Fdt<'a> {
    header: Header,
    structs: &'a [u8],
    strings: &'a [u8],
    root: NodeOffset,
}

impl<'a> Fdt<'a> {
    /// Validate the header and the struct block of `blob`
    /// # Errors
    /// Returns an error if the blob is not a well formed device tree
    pub fn new(blob: &'a [u8]) -> Result<Self, Error> {
        if blob.len() < HEADER_SIZE {
            return Err(Error::Truncated);
        }
        let (_, header) = header(blob).map_err(|_| Error::Truncated)?;
        if header.magic != FDT_MAGIC {
            return Err(Error::Magic(header.magic));
        }
        let block = |off: u32, size: u32| {
            let start = off as usize;
            let end = start.checked_add(size as usize)?;
            blob.get(start..end)
        };
        let structs = block(header.off_dt_struct, header.size_dt_struct).ok_or(Error::Layout)?;
        let strings = block(header.off_dt_strings, header.size_dt_strings).ok_or(Error::Layout)?;
        let mut fdt = Self {
            header,
            structs,
            strings,
            root: NodeOffset(0),
        };
        fdt.root = fdt.validate()?;
        Ok(fdt)
    }

    /// Walk the whole struct block once so later lookups can't run off the rails
    fn validate(&self) -> Result<NodeOffset, Error> {
        let mut offset = 0;
        let mut depth = 0usize;
        let mut root = None;
        loop {
            let (tok, next) = self.token_at(offset).ok_or(Error::ParseMatch(offset))?;
            match tok {
                Token::BeginNode(name) => {
                    from_utf8(name).map_err(|_| Error::Utf8)?;
                    if depth == 0 {
                        if root.is_some() {
                            return Err(Error::Nesting);
                        }
                        root = Some(NodeOffset(offset));
                    }
                    depth += 1;
                }
                Token::EndNode => depth = depth.checked_sub(1).ok_or(Error::Nesting)?,
                Token::Prop { .. } if depth == 0 => return Err(Error::Nesting),
                Token::Prop { .. } | Token::Nop => {}
                Token::End => break,
            }
            offset = next;
        }
        if depth != 0 {
            return Err(Error::Nesting);
        }
        root.ok_or(Error::Nesting)
    }

    fn token_at(&self, offset: usize) -> Option<(Token<'a>, usize)> {
        let input = self.structs.get(offset..)?;
        let (remaining, tok) = token(input).ok()?;
        Some((tok, self.structs.len() - remaining.len()))
    }

    /// Offset just past the end of the node starting at `node`
    fn skip_node(&self, node: usize) -> Option<usize> {
        let mut offset = node;
        let mut depth = 0usize;
        loop {
            let (tok, next) = self.token_at(offset)?;
            match tok {
                Token::BeginNode(_) => depth += 1,
                Token::EndNode => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(next);
                    }
                }
                Token::End => return None,
                Token::Prop { .. } | Token::Nop => {}
            }
            offset = next;
        }
    }

    fn string_at(&self, offset: u32) -> Option<&'a str> {
        let bytes = self.strings.get(offset as usize..)?;
        let end = bytes.iter().position(|&b| b == 0)?;
        from_utf8(&bytes[..end]).ok()
    }

    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The root node of the tree
    #[must_use]
    pub fn root(&self) -> NodeOffset {
        self.root
    }

    /// The name of the node at `node`, including any unit address
    #[must_use]
    pub fn name(&self, node: NodeOffset) -> Option<&'a str> {
        match self.token_at(node.0)? {
            (Token::BeginNode(name), _) => from_utf8(name).ok(),
            _ => None,
        }
    }

    /// Raw value of the property `key` of `node`
    #[must_use]
    pub fn property(&self, node: NodeOffset, key: &str) -> Option<&'a [u8]> {
        let (Token::BeginNode(_), mut offset) = self.token_at(node.0)? else {
            return None;
        };
        loop {
            let (tok, next) = self.token_at(offset)?;
            match tok {
                Token::Prop { name_offset, value } => {
                    if self.string_at(name_offset) == Some(key) {
                        return Some(value);
                    }
                }
                Token::Nop => {}
                _ => return None,
            }
            offset = next;
        }
    }

    /// The property `key` of `node` as a string. For string lists only the first item is
    /// returned.
    #[must_use]
    pub fn string_property(&self, node: NodeOffset, key: &str) -> Option<&'a str> {
        let value = self.property(node, key)?;
        let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
        from_utf8(&value[..end]).ok()
    }

    /// Read the property `key` of `node` as big-endian cells into `T`, e.g. `(u64, u64)` for a
    /// `reg` pair. Returns `None` if the property is missing or too short.
    #[must_use]
    pub fn array_property<T: FromCells>(&self, node: NodeOffset, key: &str) -> Option<T> {
        let value = self.property(node, key)?;
        if value.len() < 4 * T::CELLS {
            return None;
        }
        let cells: Vec<u32> = value
            .chunks_exact(4)
            .take(T::CELLS)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(T::from_cells(&cells))
    }

    /// Every whole cell of the property `key` of `node`
    #[must_use]
    pub fn cells(&self, node: NodeOffset, key: &str) -> Option<impl Iterator<Item = u32> + 'a> {
        let value = self.property(node, key)?;
        Some(
            value
                .chunks_exact(4)
                .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]])),
        )
    }

    /// The items of the string list property `key` of `node`
    #[must_use]
    pub fn stringlist(&self, node: NodeOffset, key: &str) -> Option<impl Iterator<Item = &'a str>> {
        let value = self.property(node, key)?;
        let value = value.strip_suffix(&[0]).unwrap_or(value);
        let items = if value.is_empty() {
            None
        } else {
            Some(value.split(|&b| b == 0).map(|s| from_utf8(s).unwrap_or_default()))
        };
        Some(items.into_iter().flatten())
    }

    #[must_use]
    pub fn stringlist_count(&self, node: NodeOffset, key: &str) -> Option<usize> {
        Some(self.stringlist(node, key)?.count())
    }

    #[must_use]
    pub fn stringlist_item(&self, node: NodeOffset, key: &str, idx: usize) -> Option<&'a str> {
        self.stringlist(node, key)?.nth(idx)
    }

    /// Iterate over the direct children of `node`
    #[must_use]
    pub fn children(&self, node: NodeOffset) -> Children<'_, 'a> {
        let next = match self.token_at(node.0) {
            Some((Token::BeginNode(_), next)) => Some(next),
            _ => None,
        };
        Children { fdt: self, next }
    }

    /// Visit every node below `node` in pre-order, calling `visit` on a node before descending
    /// into it. The walk stops at every level as soon as `visit` returns `false`, in which case
    /// this returns `false` too.
    pub fn for_each_subnode<F>(&self, node: NodeOffset, mut visit: F) -> bool
    where
        F: FnMut(&'a str, NodeOffset) -> bool,
    {
        self.walk(node, &mut visit)
    }

    fn walk<F>(&self, node: NodeOffset, visit: &mut F) -> bool
    where
        F: FnMut(&'a str, NodeOffset) -> bool,
    {
        for (name, child) in self.children(node) {
            if !visit(name, child) || !self.walk(child, visit) {
                return false;
            }
        }
        true
    }
}

/// Iterator over the direct children of a node
#[derive(Debug)]
pub struct Children<'f, 'a> {
    fdt: &'f Fdt<'a>,
    next: Option<usize>,
}

impl<'f, 'a> Iterator for Children<'f, 'a> {
    type Item = (&'a str, NodeOffset);

    fn next(&mut self) -> Option<Self::Item> {
        let mut offset = self.next.take()?;
        loop {
            let (tok, next) = self.fdt.token_at(offset)?;
            match tok {
                Token::Prop { .. } | Token::Nop => offset = next,
                Token::BeginNode(name) => {
                    self.next = self.fdt.skip_node(offset);
                    return Some((from_utf8(name).unwrap_or_default(), NodeOffset(offset)));
                }
                Token::EndNode | Token::End => return None,
            }
        }
    }
}
