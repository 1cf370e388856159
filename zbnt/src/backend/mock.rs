//! A backend that simulates a device in memory, useful for testing the layers above it.
//!
//! Bitstreams are device tree blobs held in memory, every register window and the DMA buffer are
//! zeroed heap memory the test can reach through [`MockBackend::window`], and the interrupt line
//! is raised by hand.

use super::{
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
        HeapMemory,
        Region,
        RegisterWindow,
    },
};
use kstring::KString;
use std::{
    collections::{
        HashMap,
        HashSet,
    },
    io,
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
        Condvar,
        Mutex,
    },
    time::Duration,
};
use zbnt_utils::{
    fdt::{
        writer::FdtWriter,
        Fdt,
        NodeOffset,
    },
    firmware::BitstreamCatalog,
};

/// Bus address reported for every mock DMA buffer
pub const MOCK_PHYS_ADDR: u64 = 0x1F00_0000;

/// An interrupt line raised by calling [`MockInterrupt::raise`]
#[derive(Debug, Default)]
pub struct MockInterrupt {
    raised: Mutex<bool>,
    cond: Condvar,
    acks: AtomicUsize,
}

impl MockInterrupt {
    pub fn raise(&self) {
        let mut raised = self.raised.lock().unwrap_or_else(|e| e.into_inner());
        *raised = true;
        self.cond.notify_all();
    }

    /// How many times the line was re-armed
    #[must_use]
    pub fn acknowledgements(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }
}

impl InterruptSource for MockInterrupt {
    fn wait(&self, timeout: Duration) -> io::Result<bool> {
        let raised = self.raised.lock().unwrap_or_else(|e| e.into_inner());
        let (mut raised, _) = self
            .cond
            .wait_timeout_while(raised, timeout, |r| !*r)
            .unwrap_or_else(|e| e.into_inner());
        Ok(std::mem::take(&mut *raised))
    }

    fn acknowledge(&self) -> io::Result<()> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockBackend {
    catalog: BitstreamCatalog,
    bitstreams: HashMap<KString, Vec<u8>>,
    windows: HashMap<KString, Region>,
    hidden: HashSet<KString>,
    rejected: HashSet<KString>,
    applied: Vec<KString>,
    irq: Arc<MockInterrupt>,
}

impl MockBackend {
    /// A backend offering `bitstreams`, given as `(name, device tree)` pairs in catalog order
    /// # Errors
    /// Returns an error if no bitstreams are given
    pub fn new<I, S>(bitstreams: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Vec<u8>)>,
        S: Into<KString>,
    {
        let bitstreams: Vec<(KString, Vec<u8>)> = bitstreams
            .into_iter()
            .map(|(n, b)| (n.into(), b))
            .collect();
        let catalog = BitstreamCatalog::from_names(bitstreams.iter().map(|(n, _)| n.clone()))?;
        Ok(Self {
            catalog,
            bitstreams: bitstreams.into_iter().collect(),
            windows: HashMap::new(),
            hidden: HashSet::new(),
            rejected: HashSet::new(),
            applied: vec![],
            irq: Arc::default(),
        })
    }

    /// Memory behind the window or DMA buffer mapped for `node`
    #[must_use]
    pub fn window(&self, node: &str) -> Option<Region> {
        self.windows.get(node).cloned()
    }

    /// Pretend the system never bound `node`
    pub fn hide(&mut self, node: &str) {
        self.hidden.insert(KString::from_ref(node));
    }

    /// Make programming `name` fail
    pub fn reject(&mut self, name: &str) {
        self.rejected.insert(KString::from_ref(name));
    }

    /// Every bitstream programmed so far
    #[must_use]
    pub fn applied(&self) -> &[KString] {
        &self.applied
    }

    #[must_use]
    pub fn interrupt_line(&self) -> Arc<MockInterrupt> {
        self.irq.clone()
    }
}

impl Backend for MockBackend {
    fn catalog(&self) -> &BitstreamCatalog {
        &self.catalog
    }

    fn release(&mut self) {
        self.windows.clear();
    }

    fn apply_configuration(&mut self, name: &str) -> Result<Configuration> {
        if self.rejected.contains(name) {
            return Err(Error::Overlay(io::Error::other("overlay rejected")));
        }
        let blob = self
            .bitstreams
            .get(name)
            .ok_or_else(|| Error::DeviceTree {
                name: KString::from_ref(name),
                source: io::ErrorKind::NotFound.into(),
            })?
            .clone();
        self.applied.push(KString::from_ref(name));
        Ok(Configuration {
            trees: vec![(Partition::Overlay, blob)],
            dma_buffer: None,
        })
    }

    fn exposes(&self, _partition: Partition, node: &str, _compatible: &str) -> bool {
        !self.hidden.contains(node)
    }

    fn map_window(
        &mut self,
        _partition: Partition,
        node: &str,
        base: u64,
        size: u64,
    ) -> Result<RegisterWindow> {
        let region = HeapMemory::zeroed(usize::try_from(size).unwrap_or(0)).region();
        self.windows.insert(KString::from_ref(node), region.clone());
        Ok(RegisterWindow::new(region, base))
    }

    fn map_dma_buffer(&mut self, fdt: Fdt<'_>, node: NodeOffset) -> Result<DmaBuffer> {
        let name = fdt.name(node).unwrap_or_default();
        let size: u64 = fdt
            .array_property(node, "size")
            .ok_or_else(|| Error::Property {
                node: KString::from_ref(name),
                property: "size",
            })?;
        let size = usize::try_from(size).unwrap_or(0);
        let region = HeapMemory::zeroed(size)
            .region()
            .sub(0, size)
            .ok_or(Error::WindowTooSmall {
                needed: size,
                available: 0,
            })?;
        self.windows.insert(KString::from_ref(name), region.clone());
        Ok(DmaBuffer::new(KString::from_ref(name), region, MOCK_PHYS_ADDR))
    }

    fn interrupt(&mut self, _node: &str) -> Result<Option<Arc<dyn InterruptSource>>> {
        Ok(Some(self.irq.clone()))
    }
}

/// Add a core node with a `reg` property
pub fn core_node<'w>(
    w: &'w mut FdtWriter,
    name: &str,
    compatible: &str,
    base: u32,
    size: u32,
) -> &'w mut FdtWriter {
    w.begin_node(name)
        .string_property("compatible", compatible)
        .cells_property("reg", &[base, size])
}

/// An overlay holding the three nodes every bitstream needs: a DMA buffer of `buffer_size` bytes
/// named `dmabuf`, a DMA engine named `dma@0` and a timer named `timer@100`. `cores` adds the rest.
pub fn overlay<F>(buffer_size: u32, cores: F) -> Vec<u8>
where
    F: FnOnce(&mut FdtWriter),
{
    let mut w = FdtWriter::new();
    w.begin_node("")
        .begin_node("fragment@0")
        .begin_node("__overlay__");
    w.begin_node("dmabuf")
        .string_property("compatible", "ikwzm,u-dma-buf")
        .string_property("device-name", "udmabuf0")
        .cells_property("size", &[buffer_size])
        .end_node();
    core_node(&mut w, "dma@0", "zbnt,message-dma", 0, 0x100).end_node();
    core_node(&mut w, "timer@100", "zbnt,simple-timer", 0x100, 0x100).end_node();
    cores(&mut w);
    w.end_node().end_node().end_node();
    w.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_interrupt_wait() {
        let irq = Arc::new(MockInterrupt::default());
        assert!(!irq.wait(Duration::ZERO).unwrap());
        irq.raise();
        assert!(irq.wait(Duration::ZERO).unwrap());
        // Consumed
        assert!(!irq.wait(Duration::from_millis(5)).unwrap());
    }

    #[test]
    fn test_interrupt_wakes_waiter() {
        let irq = Arc::new(MockInterrupt::default());
        let waiter = {
            let irq = irq.clone();
            thread::spawn(move || irq.wait(Duration::from_secs(5)).unwrap())
        };
        thread::sleep(Duration::from_millis(10));
        irq.raise();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_windows() {
        let mut backend = MockBackend::new([("a", overlay(64, |_| {}))]).unwrap();
        let window = backend
            .map_window(Partition::Overlay, "dma@0", 0x4000, 32)
            .unwrap();
        assert_eq!(window.base(), 0x4000);
        window.region().write::<u32>(4, 7);
        assert_eq!(backend.window("dma@0").unwrap().read::<u32>(4), 7);
        backend.release();
        assert!(backend.window("dma@0").is_none());
    }

    #[test]
    fn test_configuration() {
        let mut backend = MockBackend::new([("a", vec![1, 2]), ("b", vec![3])]).unwrap();
        backend.reject("b");
        assert_eq!(backend.catalog().names(), ["a", "b"]);
        assert_eq!(backend.initial_bitstream().unwrap(), "a");
        let config = backend.apply_configuration("a").unwrap();
        assert_eq!(config.trees, [(Partition::Overlay, vec![1, 2])]);
        assert!(matches!(
            backend.apply_configuration("b"),
            Err(Error::Overlay(_))
        ));
        assert_eq!(backend.applied(), ["a"]);
    }

    #[test]
    fn test_no_bitstreams() {
        let none: [(&str, Vec<u8>); 0] = [];
        assert!(MockBackend::new(none).is_err());
    }
}
