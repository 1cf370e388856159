//! Zynq boards, where bitstreams are loaded by applying a device tree overlay through configfs and
//! every core is bound to its own UIO device

use super::{
    parse_hex,
    Backend,
    Configuration,
    InterruptSource,
    Partition,
};
use crate::{
    dma_buffer::DmaBuffer,
    error::{
        Error,
        Result,
    },
    mmio::{
        Region,
        RegisterWindow,
    },
    settings::{
        PathSettings,
        Settings,
    },
};
use kstring::KString;
use libc::O_SYNC;
use memmap2::MmapOptions;
use std::{
    collections::HashMap,
    fs::{
        self,
        File,
    },
    io::{
        self,
        Read,
        Write,
    },
    os::unix::{
        fs::OpenOptionsExt,
        io::AsRawFd,
    },
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
    time::Duration,
};
use tracing::{
    debug,
    info,
};
use zbnt_utils::{
    fdt::{
        Fdt,
        NodeOffset,
    },
    firmware::{
        overlay_path,
        BitstreamCatalog,
    },
};

#[derive(Debug)]
pub struct AxiBackend {
    paths: PathSettings,
    firmware_dir: PathBuf,
    overlay_name: String,
    catalog: BitstreamCatalog,
    /// UIO device file of every bound device tree node
    uio: HashMap<KString, PathBuf>,
}

impl AxiBackend {
    /// A backend programming the bitstreams of the firmware profile `profile`
    /// # Errors
    /// Returns an error if the profile name is invalid or its directory holds no bitstreams
    pub fn new(settings: &Settings, profile: &str) -> Result<Self> {
        let firmware_dir = settings.profile_dir(profile)?;
        let catalog = BitstreamCatalog::scan(&firmware_dir)?;
        Ok(Self {
            paths: settings.paths.clone(),
            firmware_dir,
            overlay_name: settings.device.overlay_name.clone(),
            catalog,
            uio: HashMap::new(),
        })
    }

    fn overlay_dir(&self) -> PathBuf {
        self.paths
            .configfs
            .join("device-tree/overlays")
            .join(&self.overlay_name)
    }

    /// Replace the active overlay with `blob`
    fn apply_overlay(&self, blob: &[u8]) -> io::Result<()> {
        let dir = self.overlay_dir();
        if dir.exists() {
            fs::remove_dir(&dir)?;
        }
        fs::create_dir(&dir)?;
        File::create(dir.join("dtbo"))?.write_all(blob)
    }

    /// Map every UIO device to the device tree node it was bound to
    fn scan_uio(&mut self) -> io::Result<()> {
        self.uio.clear();
        let class = self.paths.sysfs.join("class/uio");
        for entry in fs::read_dir(&class)? {
            let entry = entry?;
            let Ok(node) = fs::canonicalize(entry.path().join("device/of_node")) else {
                continue;
            };
            let Some(node) = node.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let dev = self.paths.dev.join(entry.file_name());
            debug!(node, dev = %dev.display(), "Found UIO device");
            self.uio.insert(KString::from_ref(node), dev);
        }
        Ok(())
    }

    fn uio_device(&self, node: &str) -> Result<&Path> {
        self.uio
            .get(node)
            .map(PathBuf::as_path)
            .ok_or_else(|| Error::NoWindow(KString::from_ref(node)))
    }
}

fn open_sync(path: &Path) -> io::Result<File> {
    File::options()
        .read(true)
        .write(true)
        .custom_flags(O_SYNC)
        .open(path)
}

impl Backend for AxiBackend {
    fn catalog(&self) -> &BitstreamCatalog {
        &self.catalog
    }

    fn release(&mut self) {
        self.uio.clear();
    }

    fn apply_configuration(&mut self, name: &str) -> Result<Configuration> {
        let path = overlay_path(&self.firmware_dir, name);
        let blob = fs::read(&path).map_err(|source| Error::DeviceTree {
            name: KString::from_ref(name),
            source,
        })?;
        self.apply_overlay(&blob).map_err(Error::Overlay)?;
        info!(overlay = %self.overlay_dir().display(), "Applied device tree overlay");
        self.scan_uio()?;
        Ok(Configuration {
            trees: vec![(Partition::Overlay, blob)],
            dma_buffer: None,
        })
    }

    fn exposes(&self, _partition: Partition, node: &str, _compatible: &str) -> bool {
        self.uio.contains_key(node)
    }

    fn map_window(
        &mut self,
        _partition: Partition,
        node: &str,
        base: u64,
        size: u64,
    ) -> Result<RegisterWindow> {
        let file = open_sync(self.uio_device(node)?)?;
        let len = usize::try_from(size).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        // SAFETY: UIO maps are device memory only ever accessed through volatile operations
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(RegisterWindow::new(Region::from_mmap(map), base))
    }

    fn map_dma_buffer(&mut self, fdt: Fdt<'_>, node: NodeOffset) -> Result<DmaBuffer> {
        let name = fdt.name(node).unwrap_or_default();
        let missing = |property| Error::Property {
            node: KString::from_ref(name),
            property,
        };
        let dev_name = fdt
            .string_property(node, "device-name")
            .ok_or_else(|| missing("device-name"))?;
        let size: usize = fdt
            .array_property(node, "size")
            .ok_or_else(|| missing("size"))?;

        let attr = self
            .paths
            .sysfs
            .join("class/u-dma-buf")
            .join(dev_name)
            .join("phys_addr");
        let phys_addr = parse_hex(&fs::read_to_string(&attr)?).ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid physical address in {}", attr.display()),
            ))
        })?;

        let file = File::open(self.paths.dev.join(dev_name))?;
        // SAFETY: the buffer is only read, through volatile copies
        let map = unsafe { MmapOptions::new().len(size).map(&file)? };
        Ok(DmaBuffer::new(
            KString::from_ref(name),
            Region::from_mmap_ro(map),
            phys_addr,
        ))
    }

    fn interrupt(&mut self, node: &str) -> Result<Option<Arc<dyn InterruptSource>>> {
        let Some(dev) = self.uio.get(node) else {
            return Ok(None);
        };
        Ok(Some(Arc::new(UioInterrupt::open(dev)?)))
    }
}

/// The interrupt of a UIO device. Reading the device file blocks until the interrupt fires,
/// writing 1 to it re-enables it.
#[derive(Debug)]
pub struct UioInterrupt {
    file: File,
}

impl UioInterrupt {
    /// # Errors
    /// Returns an error if the device file can't be opened
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: open_sync(path)?,
        })
    }
}

impl InterruptSource for UioInterrupt {
    fn wait(&self, timeout: Duration) -> io::Result<bool> {
        let mut pollfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        // SAFETY: pollfd is a single valid entry that outlives the call
        let res = unsafe { libc::poll(&mut pollfd, 1, timeout) };
        if res < 0 {
            let err = io::Error::last_os_error();
            return if err.kind() == io::ErrorKind::Interrupted {
                Ok(false)
            } else {
                Err(err)
            };
        }
        if res == 0 || pollfd.revents & libc::POLLIN == 0 {
            return Ok(false);
        }
        // Interrupt count, only consumed
        let mut count = [0u8; 4];
        (&self.file).read_exact(&mut count)?;
        Ok(true)
    }

    fn acknowledge(&self) -> io::Result<()> {
        (&self.file).write_all(&1u32.to_ne_bytes())
    }
}
