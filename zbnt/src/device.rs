//! A device and the lifecycle of the bitstream loaded into it.
//!
//! Loading a bitstream drops every core of the previous one before the backend touches the
//! hardware, then walks the device trees the backend returns and builds a core for every `zbnt,*`
//! node it exposes. The DMA engine and the timer are kept apart from the other cores since clients
//! address them out of band.

use crate::{
    backend::{
        Backend,
        InterruptSource,
        Partition,
    },
    cores::{
        create_core,
        AxiDma,
        Core,
        CoreArgs,
        FromNode,
        HardwareCore,
        SimpleTimer,
        DMA_INDEX,
        REGISTRY,
        TIMER_INDEX,
    },
    dma_buffer::DmaBuffer,
    error::{
        Error,
        Result,
    },
};
use kstring::KString;
use std::{
    sync::Arc,
    time::Duration,
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

/// `compatible` of the DMA buffer nodes
pub const DMA_BUFFER_COMPATIBLE: &str = "ikwzm,u-dma-buf";

#[derive(Debug)]
pub struct Device<B: Backend> {
    backend: B,
    cores: Vec<Core>,
    dma: Option<AxiDma>,
    dma_buffer: Option<DmaBuffer>,
    timer: Option<SimpleTimer>,
    irq: Option<Arc<dyn InterruptSource>>,
    active: Option<KString>,
}

impl<B: Backend> Device<B> {
    /// A device with nothing loaded
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            cores: vec![],
            dma: None,
            dma_buffer: None,
            timer: None,
            irq: None,
            active: None,
        }
    }

    /// Create a device and load the backend's initial bitstream into it
    /// # Errors
    /// Returns an error if the initial bitstream fails to load
    pub fn open(backend: B) -> Result<Self> {
        let mut dev = Self::new(backend);
        let initial = dev.backend.initial_bitstream()?;
        info!(
            count = dev.catalog().len(),
            bitstream = initial.as_str(),
            "Bitstreams found"
        );
        dev.load_bitstream(&initial)?;
        Ok(dev)
    }

    /// Replace the loaded bitstream with `name`. An unknown name leaves the device untouched, any
    /// other failure leaves it with no cores until the next successful load.
    /// # Errors
    /// Returns an error if `name` isn't in the catalog, the backend fails to program it or its
    /// device tree doesn't describe a usable design
    pub fn load_bitstream(&mut self, name: &str) -> Result<()> {
        if !self.backend.catalog().contains(name) {
            return Err(Error::UnknownBitstream(KString::from_ref(name)));
        }
        info!(bitstream = name, "Loading bitstream");
        self.teardown();
        if let Err(e) = self.configure(name) {
            self.teardown();
            return Err(e);
        }
        self.active = Some(KString::from_ref(name));
        Ok(())
    }

    fn teardown(&mut self) {
        self.irq = None;
        self.cores.clear();
        self.dma = None;
        self.timer = None;
        self.dma_buffer = None;
        self.active = None;
        self.backend.release();
    }

    fn configure(&mut self, name: &str) -> Result<()> {
        let config = self.backend.apply_configuration(name)?;
        self.dma_buffer = config.dma_buffer;
        for (partition, blob) in &config.trees {
            self.enumerate(*partition, blob)?;
        }

        let dma_name = self
            .dma
            .as_ref()
            .map(|d| KString::from_ref(d.name()))
            .ok_or(Error::Missing("DMA engine"))?;
        if self.dma_buffer.is_none() {
            return Err(Error::Missing("DMA buffer"));
        }
        if self.timer.is_none() {
            return Err(Error::Missing("timer"));
        }
        self.irq = self.backend.interrupt(&dma_name)?;
        if self.irq.is_none() {
            warn!(bitstream = name, "DMA engine has no interrupt line");
        }
        Ok(())
    }

    fn enumerate(&mut self, partition: Partition, blob: &[u8]) -> Result<()> {
        let fdt = Fdt::new(blob)?;
        let mut failure = None;
        fdt.for_each_subnode(fdt.root(), |name, node| {
            match self.visit(partition, fdt, name, node) {
                Ok(()) => true,
                Err(e) => {
                    failure = Some(e);
                    false
                }
            }
        });
        failure.map_or(Ok(()), Err)
    }

    fn visit(
        &mut self,
        partition: Partition,
        fdt: Fdt<'_>,
        name: &str,
        node: NodeOffset,
    ) -> Result<()> {
        let Some(compatible) = fdt.string_property(node, "compatible") else {
            return Ok(());
        };

        if compatible == DMA_BUFFER_COMPATIBLE {
            if self.dma_buffer.is_some() {
                return Err(Error::Duplicate("DMA buffer"));
            }
            let buffer = self.backend.map_dma_buffer(fdt, node)?;
            info!(
                node = name,
                size = buffer.size(),
                phys_addr = buffer.phys_addr(),
                "Found DMA buffer"
            );
            self.dma_buffer = Some(buffer);
            return Ok(());
        }

        if !compatible.starts_with("zbnt,") {
            return Ok(());
        }
        if !self.backend.exposes(partition, name, compatible) {
            debug!(node = name, compatible, "Node not exposed, ignoring");
            return Ok(());
        }
        if !REGISTRY.iter().any(|(c, _)| *c == compatible) {
            warn!(node = name, compatible, "Unknown core type, ignoring");
            return Ok(());
        }

        let index = if compatible == AxiDma::COMPATIBLE {
            if self.dma.is_some() {
                return Err(Error::Duplicate("DMA engine"));
            }
            DMA_INDEX
        } else if compatible == SimpleTimer::COMPATIBLE {
            if self.timer.is_some() {
                return Err(Error::Duplicate("timer"));
            }
            TIMER_INDEX
        } else {
            let index = u32::try_from(self.cores.len()).unwrap_or(u32::MAX);
            if index >= TIMER_INDEX {
                return Err(Error::TooManyCores(index));
            }
            index
        };

        let (base, size): (u64, u64) = fdt
            .array_property(node, "reg")
            .ok_or_else(|| Error::Property {
                node: KString::from_ref(name),
                property: "reg",
            })?;
        info!(node = name, compatible, index, base, size, "Found core");

        let window = self.backend.map_window(partition, name, base, size)?;
        let args = CoreArgs {
            name,
            index,
            window,
            fdt,
            node,
            dma_buffer: self.dma_buffer.as_ref(),
        };
        let core = match create_core(compatible, args) {
            Some(Ok(core)) => core,
            Some(Err(e)) => {
                return Err(Error::Core {
                    name: KString::from_ref(name),
                    source: e.into(),
                })
            }
            None => return Ok(()),
        };

        match core {
            Core::AxiDma(dma) => self.dma = Some(dma),
            Core::SimpleTimer(timer) => self.timer = Some(timer),
            core => self.cores.push(core),
        }
        Ok(())
    }

    /// Wait for at most `timeout` for the DMA engine to raise its interrupt. Returns `false` when
    /// nothing is loaded.
    pub fn wait_for_interrupt(&self, timeout: Duration) -> bool {
        if self.dma.is_none() || self.dma_buffer.is_none() {
            return false;
        }
        let Some(irq) = &self.irq else {
            return false;
        };
        irq.wait(timeout).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to wait for the DMA interrupt");
            false
        })
    }

    /// Clear the interrupt causes in `mask` and re-arm the interrupt line
    pub fn clear_interrupts(&self, mask: u16) {
        let Some(dma) = &self.dma else {
            return;
        };
        dma.clear_interrupts(mask);
        if let Some(irq) = &self.irq {
            if let Err(e) = irq.acknowledge() {
                warn!(error = %e, "Failed to re-arm the DMA interrupt");
            }
        }
    }

    /// Append the announce records of every core, then the timer
    pub fn announce(&self, out: &mut Vec<u8>) {
        for core in &self.cores {
            core.announce(out);
        }
        if let Some(timer) = &self.timer {
            timer.announce(out);
        }
    }

    /// The core clients address as `index`, `0xFF` being the timer
    #[must_use]
    pub fn core(&self, index: u8) -> Option<&dyn HardwareCore> {
        if u32::from(index) == TIMER_INDEX {
            return self.timer.as_ref().map(|t| t as &dyn HardwareCore);
        }
        self.cores
            .get(usize::from(index))
            .map(|c| c as &dyn HardwareCore)
    }

    #[must_use]
    pub fn core_mut(&mut self, index: u8) -> Option<&mut dyn HardwareCore> {
        if u32::from(index) == TIMER_INDEX {
            return self.timer.as_mut().map(|t| t as &mut dyn HardwareCore);
        }
        self.cores
            .get_mut(usize::from(index))
            .map(|c| c as &mut dyn HardwareCore)
    }

    #[must_use]
    pub fn catalog(&self) -> &BitstreamCatalog {
        self.backend.catalog()
    }

    /// The loaded bitstream, if the last load succeeded
    #[must_use]
    pub fn active_bitstream(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Every core except the DMA engine and the timer, in index order
    #[must_use]
    pub fn cores(&self) -> &[Core] {
        &self.cores
    }

    #[must_use]
    pub fn dma(&self) -> Option<&AxiDma> {
        self.dma.as_ref()
    }

    #[must_use]
    pub fn dma_buffer(&self) -> Option<&DmaBuffer> {
        self.dma_buffer.as_ref()
    }

    #[must_use]
    pub fn timer(&self) -> Option<&SimpleTimer> {
        self.timer.as_ref()
    }

    #[must_use]
    pub fn timer_mut(&mut self) -> Option<&mut SimpleTimer> {
        self.timer.as_mut()
    }

    /// A handle to the interrupt line, to wait on without borrowing the device
    #[must_use]
    pub fn interrupt(&self) -> Option<Arc<dyn InterruptSource>> {
        self.irq.clone()
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::mock::{
            core_node,
            overlay,
            MockBackend,
        },
        cores::dma::{
            DmaRegisters,
            IRQ_MSG_END,
        },
        messages::{
            CoreKind,
            PropertyId,
        },
    };

    fn stats(w: &mut zbnt_utils::fdt::writer::FdtWriter, name: &str, port: u32) {
        core_node(w, name, "zbnt,stats-collector", 0x1000, 0x100)
            .cells_property("zbnt,ports", &[port])
            .end_node();
    }

    fn two_stats() -> Vec<u8> {
        overlay(4096, |w| {
            stats(w, "stats@1000", 0);
            stats(w, "stats@2000", 1);
        })
    }

    fn backend() -> MockBackend {
        MockBackend::new([
            ("dual", two_stats()),
            ("bare", overlay(4096, |_| {})),
            (
                "latency",
                overlay(4096, |w| {
                    core_node(w, "lm@3000", "zbnt,latency-measurer", 0x3000, 0x100)
                        .cells_property("zbnt,ports", &[0, 1])
                        .end_node();
                }),
            ),
        ])
        .unwrap()
    }

    fn kinds<B: Backend>(dev: &Device<B>) -> Vec<(u32, CoreKind)> {
        dev.cores().iter().map(|c| (c.index(), c.kind())).collect()
    }

    #[test]
    fn test_open_loads_first_bitstream() {
        let dev = Device::open(backend()).unwrap();
        assert_eq!(dev.active_bitstream(), Some("dual"));
        assert_eq!(
            kinds(&dev),
            [(0, CoreKind::StatsCollector), (1, CoreKind::StatsCollector)]
        );
        assert_eq!(dev.dma().unwrap().index(), DMA_INDEX);
        assert_eq!(dev.timer().unwrap().index(), TIMER_INDEX);
        assert_eq!(dev.dma_buffer().unwrap().size(), 4096);
        assert!(dev.interrupt().is_some());
    }

    #[test]
    fn test_dma_engine_gets_the_buffer() {
        let dev = Device::open(backend()).unwrap();
        let regs = dev.backend().window("dma@0").unwrap();
        assert_eq!(
            regs.read::<u64>(DmaRegisters::MEM_BASE),
            crate::backend::mock::MOCK_PHYS_ADDR
        );
        assert_eq!(regs.read::<u32>(DmaRegisters::MEM_SIZE), 4096);
    }

    #[test]
    fn test_reload_same_bitstream() {
        let mut dev = Device::open(backend()).unwrap();
        let before = kinds(&dev);
        dev.load_bitstream("dual").unwrap();
        assert_eq!(kinds(&dev), before);
        assert_eq!(dev.backend().applied(), ["dual", "dual"]);
    }

    #[test]
    fn test_switch_bitstream() {
        let mut dev = Device::open(backend()).unwrap();
        dev.load_bitstream("latency").unwrap();
        assert_eq!(dev.active_bitstream(), Some("latency"));
        assert_eq!(kinds(&dev), [(0, CoreKind::LatencyMeasurer)]);
        // Windows of the previous bitstream are gone
        assert!(dev.backend().window("stats@2000").is_none());
    }

    #[test]
    fn test_unknown_bitstream_changes_nothing() {
        let mut dev = Device::open(backend()).unwrap();
        let err = dev.load_bitstream("nonexistent").unwrap_err();
        assert!(matches!(err, Error::UnknownBitstream(_)));
        assert_eq!(dev.active_bitstream(), Some("dual"));
        assert_eq!(dev.cores().len(), 2);
        assert_eq!(dev.backend().applied(), ["dual"]);
    }

    #[test]
    fn test_rejected_bitstream_leaves_no_cores() {
        let mut dev = Device::open(backend()).unwrap();
        dev.backend_mut().reject("bare");
        assert!(matches!(
            dev.load_bitstream("bare"),
            Err(Error::Overlay(_))
        ));
        assert_eq!(dev.active_bitstream(), None);
        assert!(dev.cores().is_empty());
        assert!(dev.timer().is_none());
        assert!(!dev.wait_for_interrupt(Duration::ZERO));
        // Recovers on the next load
        dev.load_bitstream("dual").unwrap();
        assert_eq!(dev.cores().len(), 2);
    }

    #[test]
    fn test_hidden_node_is_skipped() {
        let mut backend = backend();
        backend.hide("stats@1000");
        let dev = Device::open(backend).unwrap();
        assert_eq!(kinds(&dev), [(0, CoreKind::StatsCollector)]);
        assert_eq!(dev.core(0).unwrap().name(), "stats@2000");
    }

    #[test]
    fn test_unknown_core_is_skipped() {
        let blob = overlay(4096, |w| {
            core_node(w, "mystery@1000", "zbnt,mystery", 0x1000, 0x100).end_node();
            stats(w, "stats@2000", 1);
        });
        let dev = Device::open(MockBackend::new([("a", blob)]).unwrap()).unwrap();
        assert_eq!(kinds(&dev), [(0, CoreKind::StatsCollector)]);
    }

    macro_rules! test_load_fails {
        ($name:ident, $blob:expr, $err:pat) => {
            #[test]
            fn $name() {
                let backend = MockBackend::new([("a", $blob)]).unwrap();
                let mut dev = Device::new(backend);
                let err = dev.load_bitstream("a").unwrap_err();
                assert!(matches!(err, $err), "{err:?}");
                assert!(dev.cores().is_empty());
                assert_eq!(dev.active_bitstream(), None);
            }
        };
    }

    test_load_fails!(
        test_missing_reg,
        overlay(4096, |w| {
            w.begin_node("stats@1000")
                .string_property("compatible", "zbnt,stats-collector")
                .cells_property("zbnt,ports", &[0])
                .end_node();
        }),
        Error::Property { property: "reg", .. }
    );

    test_load_fails!(
        test_core_construction_fails,
        overlay(4096, |w| {
            stats(w, "stats@1000", 0);
            core_node(w, "stats@2000", "zbnt,stats-collector", 0x2000, 0x100).end_node();
        }),
        Error::Core { .. }
    );

    test_load_fails!(
        test_duplicate_timer,
        overlay(4096, |w| {
            core_node(w, "timer@200", "zbnt,simple-timer", 0x200, 0x100).end_node();
        }),
        Error::Duplicate("timer")
    );

    test_load_fails!(
        test_duplicate_buffer,
        overlay(4096, |w| {
            w.begin_node("dmabuf2")
                .string_property("compatible", DMA_BUFFER_COMPATIBLE)
                .cells_property("size", &[64])
                .end_node();
        }),
        Error::Duplicate("DMA buffer")
    );

    test_load_fails!(
        test_missing_timer,
        {
            let mut w = zbnt_utils::fdt::writer::FdtWriter::new();
            w.begin_node("")
                .begin_node("dmabuf")
                .string_property("compatible", DMA_BUFFER_COMPATIBLE)
                .cells_property("size", &[64])
                .end_node();
            core_node(&mut w, "dma@0", "zbnt,message-dma", 0, 0x100).end_node();
            w.end_node();
            w.finish()
        },
        Error::Missing("timer")
    );

    test_load_fails!(
        test_dma_before_buffer,
        {
            let mut w = zbnt_utils::fdt::writer::FdtWriter::new();
            w.begin_node("");
            core_node(&mut w, "dma@0", "zbnt,message-dma", 0, 0x100).end_node();
            w.end_node();
            w.finish()
        },
        Error::Core { .. }
    );

    #[test]
    fn test_too_many_cores() {
        let blob = overlay(4096, |w| {
            for i in 0..256u32 {
                stats(w, &format!("stats@{i:x}"), 0);
            }
        });
        let mut dev = Device::new(MockBackend::new([("a", blob)]).unwrap());
        let err = dev.load_bitstream("a").unwrap_err();
        assert!(matches!(err, Error::TooManyCores(0xFF)));
    }

    #[test]
    fn test_property_addressing() {
        let mut dev = Device::open(backend()).unwrap();
        let timer = dev.core_mut(0xFF).unwrap();
        assert_eq!(timer.kind(), CoreKind::SimpleTimer);
        timer
            .set_property(PropertyId::TimerLimit, &1000u64.to_le_bytes())
            .unwrap();
        assert_eq!(dev.timer().unwrap().maximum_time(), 1000);
        assert!(dev.core(1).is_some());
        assert!(dev.core(2).is_none());
    }

    #[test]
    fn test_announce() {
        let dev = Device::open(backend()).unwrap();
        let mut out = vec![];
        dev.announce(&mut out);
        assert_eq!(
            out,
            [
                0, 4, 5, 0, 23, 0, 1, 0, 0, // stats 0
                1, 4, 5, 0, 23, 0, 1, 0, 1, // stats 1
                0xFF, 2, 8, 0, 25, 0, 4, 0, 0x40, 0x59, 0x73, 0x07, // timer
            ]
        );
    }

    #[test]
    fn test_interrupts() {
        let dev = Device::open(backend()).unwrap();
        let line = dev.backend().interrupt_line();
        assert!(!dev.wait_for_interrupt(Duration::ZERO));
        line.raise();
        assert!(dev.wait_for_interrupt(Duration::ZERO));
        let regs = dev.backend().window("dma@0").unwrap();
        dev.clear_interrupts(IRQ_MSG_END);
        assert_eq!(regs.read::<u16>(DmaRegisters::IRQ), IRQ_MSG_END);
        assert_eq!(line.acknowledgements(), 1);
    }
}
