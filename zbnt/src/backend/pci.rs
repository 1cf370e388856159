//! PCIe boards. A single UIO device exposes every memory region of the board: a DMA buffer, a
//! static partition holding the DMA engine and a partial reconfiguration controller, and a
//! reconfigurable partition swapped by that controller. Each partition starts with a
//! [`RegionHeader`] followed by the device tree describing it.

use super::{
    axi::UioInterrupt,
    parse_hex,
    Backend,
    Configuration,
    InterruptSource,
    Partition,
};
use crate::{
    cores::{
        AxiDma,
        CoreArgs,
        FromNode,
        PrController,
    },
    dma_buffer::DmaBuffer,
    error::{
        Error,
        Result,
    },
    mmio::{
        Region,
        RegisterWindow,
    },
    settings::Settings,
};
use kstring::KString;
use libc::O_SYNC;
use memmap2::MmapOptions;
use packed_struct::prelude::*;
use std::{
    collections::HashMap,
    fs::{
        self,
        File,
    },
    os::unix::fs::OpenOptionsExt,
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};
use tracing::{
    debug,
    info,
    warn,
};
use zbnt_utils::{
    fdt::{
        Fdt,
        NodeOffset,
    },
    firmware::BitstreamCatalog,
};

/// Name the kernel driver gives the UIO device
pub const UIO_NAME: &str = "zbnt:pci";
pub const HEADER_MAGIC: [u8; 5] = *b"ZBNT\0";
pub const STATIC_TYPE: [u8; 3] = *b"ST\0";
pub const RECONFIGURABLE_TYPE: [u8; 3] = *b"RP\0";
pub const HEADER_SIZE: usize = 48;
/// UIO devices expose at most this many maps
const MAX_MAPS: usize = 5;

const MAP_DMA_META: &str = "dmabuf_meta";
const MAP_DMA_BUFFER: &str = "dmabuf";
const MAP_STATIC: &str = "static";
const MAP_RECONFIGURABLE: &str = "rp";

/// Nodes that describe the partitions themselves
const PARTITION_ROMS: [&str; 2] = ["zbnt,dtb-rom", "zbnt,rp_dtb"];

#[derive(PackedStruct, Debug, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "48")]
pub struct RegionHeader {
    #[packed_field(bytes = "0..=4")]
    pub magic: [u8; 5],
    #[packed_field(bytes = "5..=7")]
    pub kind: [u8; 3],
    /// `major << 24 | minor << 16 | patch`
    #[packed_field(bytes = "8..=11", endian = "lsb")]
    pub version: u32,
    #[packed_field(bytes = "12..=27")]
    pub prerelease: [u8; 16],
    #[packed_field(bytes = "28..=43")]
    pub commit: [u8; 16],
    #[packed_field(bytes = "44..=45", endian = "lsb")]
    pub dirty: u16,
    #[packed_field(bytes = "46..=47", endian = "lsb")]
    pub dtb_size: u16,
}

/// The text of a NUL padded field
fn c_str(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end]).unwrap_or_default()
}

impl RegionHeader {
    /// Semantic version of the partition, e.g. `1.2.3-beta+abc123.d`
    #[must_use]
    pub fn version_string(&self) -> String {
        let mut version = format!(
            "{}.{}.{}",
            self.version >> 24,
            (self.version >> 16) & 0xFF,
            self.version & 0xFFFF
        );
        let prerelease = c_str(&self.prerelease);
        if !prerelease.is_empty() {
            version.push('-');
            version.push_str(prerelease);
        }
        let commit = c_str(&self.commit);
        if !commit.is_empty() {
            version.push('+');
            version.push_str(commit);
            if self.dirty != 0 {
                version.push_str(".d");
            }
        } else if self.dirty != 0 {
            version.push_str("+d");
        }
        version
    }
}

/// Parse the header at the start of map `map` and return it with the device tree following it
/// # Errors
/// Returns an error if the header is truncated, has the wrong magic or type, or the tree doesn't
/// fit in the map
pub fn read_partition(
    region: &Region,
    map: &'static str,
    kind: [u8; 3],
) -> Result<(RegionHeader, Vec<u8>)> {
    if region.len() < HEADER_SIZE {
        return Err(Error::RegionHeader(map));
    }
    let raw: [u8; HEADER_SIZE] = region
        .read_bytes(0, HEADER_SIZE)
        .try_into()
        .map_err(|_| Error::RegionHeader(map))?;
    let header = RegionHeader::unpack(&raw).map_err(|_| Error::RegionHeader(map))?;
    if header.magic != HEADER_MAGIC || header.kind != kind {
        return Err(Error::RegionHeader(map));
    }
    let dtb_size = usize::from(header.dtb_size);
    if !region.contains(HEADER_SIZE, dtb_size) {
        return Err(Error::RegionHeader(map));
    }
    let dtb = region.read_bytes(HEADER_SIZE, dtb_size);
    Ok((header, dtb))
}

#[derive(Debug)]
pub struct PciBackend {
    device: PathBuf,
    maps: HashMap<KString, Region>,
    phys_addr: u64,
    static_dtb: Vec<u8>,
    board: String,
    version: String,
    pr: PrController,
    catalog: BitstreamCatalog,
}

fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u64::try_from(size).unwrap_or(4096)
}

fn read_attr(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_owned())
}

impl PciBackend {
    /// Open the board behind the UIO device named in the settings
    /// # Errors
    /// Returns an error if the device isn't a ZBNT board, lacks one of its maps or its static
    /// partition is malformed
    pub fn new(settings: &Settings) -> Result<Self> {
        let name = &settings.device.pci_device;
        let class = settings.paths.sysfs.join("class/uio").join(name);
        let device = settings.paths.dev.join(name);

        let file = File::options()
            .read(true)
            .write(true)
            .custom_flags(O_SYNC)
            .open(&device)?;
        if read_attr(&class.join("name")).as_deref() != Some(UIO_NAME) {
            return Err(Error::PciDevice(format!("{name} is not a ZBNT device")));
        }

        let page = page_size();
        let mut maps = HashMap::new();
        for i in 0..MAX_MAPS {
            let dir = class.join(format!("maps/map{i}"));
            if !dir.exists() {
                break;
            }
            let map_name = read_attr(&dir.join("name")).unwrap_or_default();
            let size = read_attr(&dir.join("size")).and_then(|s| parse_hex(&s));
            let Some(size) = size.filter(|_| !map_name.is_empty()) else {
                warn!(map = i, "Ignoring map without a name or size");
                continue;
            };
            let len = usize::try_from(size).unwrap_or(0);
            // SAFETY: device memory, only ever accessed through volatile operations
            let map = unsafe {
                MmapOptions::new()
                    .offset(i as u64 * page)
                    .len(len)
                    .map_mut(&file)
            };
            match map {
                Ok(map) => {
                    debug!(map = map_name.as_str(), size, "Mapped region");
                    maps.insert(KString::from_string(map_name), Region::from_mmap(map));
                }
                Err(e) => warn!(map = map_name.as_str(), error = %e, "Failed to map region"),
            }
        }
        for required in [MAP_DMA_META, MAP_DMA_BUFFER, MAP_STATIC, MAP_RECONFIGURABLE] {
            if !maps.contains_key(required) {
                return Err(Error::PciDevice(format!("{name} lacks the map {required}")));
            }
        }

        let meta = &maps[MAP_DMA_META];
        if meta.len() < 8 {
            return Err(Error::PciDevice(format!("{MAP_DMA_META} is too small")));
        }
        let phys_addr = meta.read::<u64>(0);

        let (header, static_dtb) = read_partition(&maps[MAP_STATIC], MAP_STATIC, STATIC_TYPE)?;
        let version = header.version_string();
        let fdt = Fdt::new(&static_dtb)?;
        let board = fdt
            .string_property(fdt.root(), "compatible")
            .and_then(|c| c.get(5..))
            .unwrap_or("<unknown>")
            .to_owned();

        let pr = build_pr_controller(fdt, &maps[MAP_STATIC])?;
        let catalog = BitstreamCatalog::from_names(pr.bitstreams().iter().cloned())?;
        info!(board = board.as_str(), version = version.as_str(), "Opened PCIe board");

        Ok(Self {
            device,
            maps,
            phys_addr,
            static_dtb,
            board,
            version,
            pr,
            catalog,
        })
    }

    /// The board model, from the static partition
    #[must_use]
    pub fn board_name(&self) -> &str {
        &self.board
    }

    /// Version of the static partition
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn pr_controller(&self) -> &PrController {
        &self.pr
    }

    fn partition_map(&self, partition: Partition) -> Option<&Region> {
        match partition {
            Partition::Static => self.maps.get(MAP_STATIC),
            Partition::Reconfigurable => self.maps.get(MAP_RECONFIGURABLE),
            Partition::Overlay => None,
        }
    }
}

/// Find the PR controller in the static partition and build it over its window
fn build_pr_controller(fdt: Fdt<'_>, map: &Region) -> Result<PrController> {
    let mut found = None;
    fdt.for_each_subnode(fdt.root(), |name, node| {
        if fdt.string_property(node, "compatible") == Some(PrController::COMPATIBLE) {
            found = Some((name, node));
            return false;
        }
        true
    });
    let (name, node) = found.ok_or(Error::Missing("partial reconfiguration controller"))?;
    let property = || Error::Property {
        node: KString::from_ref(name),
        property: "reg",
    };
    let (base, size): (u64, u64) = fdt.array_property(node, "reg").ok_or_else(property)?;
    let region = usize::try_from(base)
        .ok()
        .zip(usize::try_from(size).ok())
        .and_then(|(base, size)| map.sub(base, size))
        .ok_or_else(property)?;
    let args = CoreArgs {
        name,
        index: 0,
        window: RegisterWindow::new(region, base),
        fdt,
        node,
        dma_buffer: None,
    };
    PrController::from_node(args).map_err(|e| Error::Core {
        name: KString::from_ref(name),
        source: e.into(),
    })
}

impl Backend for PciBackend {
    fn catalog(&self) -> &BitstreamCatalog {
        &self.catalog
    }

    fn initial_bitstream(&self) -> Result<String> {
        Ok(self.pr.active_bitstream().to_owned())
    }

    // The maps live as long as the device
    fn release(&mut self) {}

    fn apply_configuration(&mut self, name: &str) -> Result<Configuration> {
        self.pr.load(name)?;
        let (_, rp_dtb) = read_partition(
            &self.maps[MAP_RECONFIGURABLE],
            MAP_RECONFIGURABLE,
            RECONFIGURABLE_TYPE,
        )?;
        let buffer = DmaBuffer::new(
            "dmabuf0",
            self.maps[MAP_DMA_BUFFER].clone(),
            self.phys_addr,
        );
        Ok(Configuration {
            trees: vec![
                (Partition::Static, self.static_dtb.clone()),
                (Partition::Reconfigurable, rp_dtb),
            ],
            dma_buffer: Some(buffer),
        })
    }

    fn exposes(&self, partition: Partition, _node: &str, compatible: &str) -> bool {
        match partition {
            Partition::Static => compatible == AxiDma::COMPATIBLE,
            Partition::Reconfigurable => {
                !PARTITION_ROMS.contains(&compatible) && compatible != PrController::COMPATIBLE
            }
            Partition::Overlay => false,
        }
    }

    fn map_window(
        &mut self,
        partition: Partition,
        node: &str,
        base: u64,
        size: u64,
    ) -> Result<RegisterWindow> {
        let map = self
            .partition_map(partition)
            .ok_or_else(|| Error::NoWindow(KString::from_ref(node)))?;
        let available = map.len();
        let too_small = || Error::WindowTooSmall {
            needed: usize::try_from(base.saturating_add(size)).unwrap_or(usize::MAX),
            available,
        };
        let region = usize::try_from(base)
            .ok()
            .zip(usize::try_from(size).ok())
            .and_then(|(base, size)| map.sub(base, size))
            .ok_or_else(too_small)?;
        Ok(RegisterWindow::new(region, base))
    }

    fn map_dma_buffer(&mut self, _fdt: Fdt<'_>, _node: NodeOffset) -> Result<DmaBuffer> {
        // The buffer is a map of its own, never a node
        Err(Error::Duplicate("DMA buffer"))
    }

    fn interrupt(&mut self, _node: &str) -> Result<Option<Arc<dyn InterruptSource>>> {
        Ok(Some(Arc::new(UioInterrupt::open(&self.device)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cores::pr_controller::{
            PrRegisters,
            ST_ACTIVE_OKAY,
        },
        device::Device,
    };
    use zbnt_utils::fdt::writer::FdtWriter;

    fn header(kind: [u8; 3], version: u32, prerelease: &str, commit: &str, dirty: u16) -> RegionHeader {
        let mut h = RegionHeader {
            magic: HEADER_MAGIC,
            kind,
            version,
            prerelease: [0; 16],
            commit: [0; 16],
            dirty,
            dtb_size: 0,
        };
        h.prerelease[..prerelease.len()].copy_from_slice(prerelease.as_bytes());
        h.commit[..commit.len()].copy_from_slice(commit.as_bytes());
        h
    }

    #[test]
    fn test_header_layout() {
        let mut h = header(STATIC_TYPE, 0x0102_0003, "rc1", "", 0);
        h.dtb_size = 0x0456;
        let raw = h.pack().unwrap();
        assert_eq!(raw[..8], *b"ZBNT\0ST\0");
        assert_eq!(raw[8..12], [3, 0, 2, 1]);
        assert_eq!(raw[12..15], *b"rc1");
        assert_eq!(raw[46..48], [0x56, 0x04]);
        assert_eq!(RegionHeader::unpack(&raw).unwrap(), h);
    }

    #[test]
    fn test_version_strings() {
        let v = 0x0203_0010;
        for (prerelease, commit, dirty, expected) in [
            ("", "", 0, "2.3.16"),
            ("beta", "", 0, "2.3.16-beta"),
            ("", "abc123", 0, "2.3.16+abc123"),
            ("", "abc123", 1, "2.3.16+abc123.d"),
            ("", "", 1, "2.3.16+d"),
            ("rc2", "f00d", 1, "2.3.16-rc2+f00d.d"),
        ] {
            assert_eq!(
                header(STATIC_TYPE, v, prerelease, commit, dirty).version_string(),
                expected
            );
        }
    }

    /// A map holding `header` and `dtb`, with room for registers at 0x800
    fn partition(kind: [u8; 3], dtb: &[u8]) -> Vec<u8> {
        let mut h = header(kind, 0x0100_0000, "", "", 0);
        h.dtb_size = u16::try_from(dtb.len()).unwrap();
        let mut map = h.pack().unwrap().to_vec();
        map.extend_from_slice(dtb);
        map.resize(0x1000, 0);
        map
    }

    #[test]
    fn test_read_partition() {
        let dtb = vec![0xAB; 16];
        let raw = partition(RECONFIGURABLE_TYPE, &dtb);
        let region = crate::mmio::HeapMemory::zeroed(raw.len()).region();
        region.write_bytes(0, &raw);
        let (h, tree) = read_partition(&region, "rp", RECONFIGURABLE_TYPE).unwrap();
        assert_eq!(h.dtb_size, 16);
        assert_eq!(tree, dtb);
        // Wrong type
        assert!(matches!(
            read_partition(&region, "rp", STATIC_TYPE),
            Err(Error::RegionHeader("rp"))
        ));
        // Tree runs past the map
        region.write::<u16>(46, 0x2000);
        assert!(read_partition(&region, "rp", RECONFIGURABLE_TYPE).is_err());
        // Too small for a header
        let tiny = crate::mmio::HeapMemory::zeroed(16).region();
        assert!(read_partition(&tiny, "rp", RECONFIGURABLE_TYPE).is_err());
    }

    fn static_tree() -> Vec<u8> {
        let mut w = FdtWriter::new();
        w.begin_node("").string_property("compatible", "zbnt,nfb-200g");
        w.begin_node("rom@0")
            .string_property("compatible", "zbnt,dtb-rom")
            .cells_property("reg", &[0, 0x800])
            .end_node();
        w.begin_node("dma@800")
            .string_property("compatible", "zbnt,message-dma")
            .cells_property("reg", &[0x800, 0x100])
            .end_node();
        w.begin_node("pr@900")
            .string_property("compatible", "zbnt,pr-controller")
            .stringlist_property("zbnt,bitstreams", &["quad_tgen", "dual_tgen_latency"])
            .cells_property("reg", &[0x900, 0x10])
            .end_node();
        w.end_node();
        w.finish()
    }

    fn rp_tree() -> Vec<u8> {
        let mut w = FdtWriter::new();
        w.begin_node("");
        w.begin_node("rom@0")
            .string_property("compatible", "zbnt,rp_dtb")
            .cells_property("reg", &[0, 0x800])
            .end_node();
        w.begin_node("timer@800")
            .string_property("compatible", "zbnt,simple-timer")
            .cells_property("reg", &[0x800, 0x100])
            .end_node();
        w.begin_node("stats@900")
            .string_property("compatible", "zbnt,stats-collector")
            .cells_property("zbnt,ports", &[2])
            .cells_property("reg", &[0x900, 0x100])
            .end_node();
        w.end_node();
        w.finish()
    }

    struct Board {
        root: tempfile::TempDir,
        settings: Settings,
        page: usize,
    }

    impl Board {
        /// A board whose maps are, in order, `maps` as `(name, contents)`
        fn new(maps: &[(&str, Vec<u8>)]) -> Self {
            let root = tempfile::tempdir().unwrap();
            let mut settings = Settings::default();
            settings.paths.sysfs = root.path().join("sys");
            settings.paths.dev = root.path().join("dev");
            let class = settings.paths.sysfs.join("class/uio/uio0");
            fs::create_dir_all(&class).unwrap();
            fs::create_dir_all(&settings.paths.dev).unwrap();
            fs::write(class.join("name"), "zbnt:pci\n").unwrap();

            let page = usize::try_from(page_size()).unwrap();
            let mut file = vec![0u8; page * maps.len()];
            for (i, (name, contents)) in maps.iter().enumerate() {
                let dir = class.join(format!("maps/map{i}"));
                fs::create_dir_all(&dir).unwrap();
                fs::write(dir.join("name"), format!("{name}\n")).unwrap();
                fs::write(dir.join("size"), format!("0x{:08x}\n", contents.len())).unwrap();
                file[i * page..i * page + contents.len()].copy_from_slice(contents);
            }
            fs::write(settings.paths.dev.join("uio0"), file).unwrap();
            Self {
                root,
                settings,
                page,
            }
        }

        /// Store `value` in the file backing map `map` at `offset`
        fn poke(&self, map: usize, offset: usize, value: &[u8]) {
            let path = self.root.path().join("dev/uio0");
            let mut file = fs::read(&path).unwrap();
            let at = map * self.page + offset;
            file[at..at + value.len()].copy_from_slice(value);
            fs::write(&path, file).unwrap();
        }
    }

    fn standard() -> Board {
        let board = Board::new(&[
            (MAP_DMA_META, 0x1f00_0000u64.to_le_bytes().to_vec()),
            (MAP_DMA_BUFFER, vec![0; 0x1000]),
            (MAP_STATIC, partition(STATIC_TYPE, &static_tree())),
            (MAP_RECONFIGURABLE, partition(RECONFIGURABLE_TYPE, &rp_tree())),
        ]);
        // Second bitstream active and healthy
        let status = (1 << 8) | ST_ACTIVE_OKAY;
        board.poke(2, 0x900 + PrRegisters::STATUS, &status.to_le_bytes());
        board
    }

    #[test]
    fn test_open() {
        let board = standard();
        let backend = PciBackend::new(&board.settings).unwrap();
        assert_eq!(backend.board_name(), "nfb-200g");
        assert_eq!(backend.version(), "1.0.0");
        assert_eq!(backend.catalog().names(), ["quad_tgen", "dual_tgen_latency"]);
        assert_eq!(backend.initial_bitstream().unwrap(), "dual_tgen_latency");

        let dev = Device::open(backend).unwrap();
        assert_eq!(dev.active_bitstream(), Some("dual_tgen_latency"));
        assert_eq!(dev.dma_buffer().unwrap().phys_addr(), 0x1f00_0000);
        assert_eq!(dev.dma_buffer().unwrap().size(), 0x1000);
        assert!(dev.dma().is_some());
        assert!(dev.timer().is_some());
        // The ROMs and the controller are hidden
        assert_eq!(dev.cores().len(), 1);
        assert!(dev.interrupt().is_some());
    }

    #[test]
    fn test_not_a_zbnt_device() {
        let board = standard();
        fs::write(
            board.settings.paths.sysfs.join("class/uio/uio0/name"),
            "something_else\n",
        )
        .unwrap();
        assert!(matches!(
            PciBackend::new(&board.settings),
            Err(Error::PciDevice(_))
        ));
    }

    #[test]
    fn test_missing_map() {
        let board = Board::new(&[
            (MAP_DMA_META, vec![0; 8]),
            (MAP_STATIC, partition(STATIC_TYPE, &static_tree())),
            (MAP_RECONFIGURABLE, partition(RECONFIGURABLE_TYPE, &rp_tree())),
        ]);
        assert!(matches!(
            PciBackend::new(&board.settings),
            Err(Error::PciDevice(_))
        ));
    }

    #[test]
    fn test_bad_static_header() {
        let board = standard();
        board.poke(2, 0, b"NOPE");
        assert!(matches!(
            PciBackend::new(&board.settings),
            Err(Error::RegionHeader("static"))
        ));
    }

    #[test]
    fn test_failed_reconfiguration() {
        let board = standard();
        // Active index 0 but an error status
        board.poke(2, 0x900 + PrRegisters::STATUS, &0x0000_0002u32.to_le_bytes());
        let backend = PciBackend::new(&board.settings).unwrap();
        assert_eq!(backend.initial_bitstream().unwrap(), "quad_tgen");
        assert!(matches!(
            Device::open(backend),
            Err(Error::Reconfiguration(2))
        ));
    }

    #[test]
    fn test_exposes() {
        let board = standard();
        let backend = PciBackend::new(&board.settings).unwrap();
        assert!(backend.exposes(Partition::Static, "dma@800", "zbnt,message-dma"));
        assert!(!backend.exposes(Partition::Static, "pr@900", "zbnt,pr-controller"));
        assert!(!backend.exposes(Partition::Static, "stats@0", "zbnt,stats-collector"));
        assert!(backend.exposes(Partition::Reconfigurable, "timer@800", "zbnt,simple-timer"));
        assert!(!backend.exposes(Partition::Reconfigurable, "rom@0", "zbnt,rp_dtb"));
        assert!(!backend.exposes(Partition::Reconfigurable, "pr@0", "zbnt,pr-controller"));
        assert!(!backend.exposes(Partition::Overlay, "dma@800", "zbnt,message-dma"));
    }

    #[test]
    fn test_window_bounds() {
        let board = standard();
        let mut backend = PciBackend::new(&board.settings).unwrap();
        let window = backend
            .map_window(Partition::Reconfigurable, "stats@900", 0x900, 0x100)
            .unwrap();
        assert_eq!(window.base(), 0x900);
        assert_eq!(window.len(), 0x100);
        assert!(matches!(
            backend.map_window(Partition::Reconfigurable, "big", 0xF00, 0x200),
            Err(Error::WindowTooSmall {
                needed: 0x1100,
                available: 0x1000
            })
        ));
    }
}
