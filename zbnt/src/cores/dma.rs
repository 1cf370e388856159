//! The engine that streams measurement records into the DMA buffer

use super::{
    CoreArgs,
    FromNode,
    HardwareCore,
    PropertyError,
    PropertyResult,
};
use crate::{
    messages::{
        CoreKind,
        PropertyId,
    },
    mmio::Registers,
};
use anyhow::anyhow;
use kstring::KString;
use zbnt_derive::RegisterBlock;

pub const CFG_ENABLE: u16 = 1;
pub const CFG_RESET: u16 = 2;
pub const CFG_FLUSH_REQ: u16 = 4;

pub const ST_IO_ACTIVE: u16 = 1;
pub const ST_ERROR_SLV: u16 = 2;
pub const ST_ERROR_DEC: u16 = 4;
pub const ST_FLUSH_ACK: u16 = 8;
pub const ST_FIFO_ACTIVE: u16 = 16;

/// The write pointer reached the end of the buffer and wrapped around
pub const IRQ_MEM_END: u16 = 1;
/// A message was completed, or the engine timed out waiting for one
pub const IRQ_MSG_END: u16 = 2;
pub const IRQ_AXI_ERROR: u16 = 4;
pub const IRQ_ALL: u16 = IRQ_MEM_END | IRQ_MSG_END | IRQ_AXI_ERROR;

#[derive(RegisterBlock)]
#[repr(C)]
pub struct DmaRegisters {
    config: u16,
    status: u16,
    irq: u16,
    irq_enable: u16,
    mem_base: u64,
    mem_size: u32,
    bytes_written: u32,
    last_msg_end: u32,
}

#[derive(Debug)]
pub struct AxiDma {
    name: KString,
    index: u32,
    regs: Registers<DmaRegisters>,
}

impl AxiDma {
    pub fn start_transfer(&self) {
        self.regs.set_irq_enable(IRQ_ALL);
        self.regs.set_config(CFG_ENABLE);
    }

    pub fn stop_transfer(&self) {
        self.regs.set_config(self.regs.config() & !CFG_ENABLE);
    }

    pub fn flush_fifo(&self) {
        self.regs.set_config(self.regs.config() | CFG_FLUSH_REQ);
    }

    #[must_use]
    pub fn is_fifo_empty(&self) -> bool {
        self.regs.status() & ST_FIFO_ACTIVE == 0
    }

    /// Acknowledge the interrupt causes in `mask`
    pub fn clear_interrupts(&self, mask: u16) {
        self.regs.set_irq(mask);
    }

    #[must_use]
    pub fn active_interrupts(&self) -> u16 {
        self.regs.irq()
    }

    /// Offset just past the last complete message in the buffer
    #[must_use]
    pub fn last_message_end(&self) -> u32 {
        self.regs.last_msg_end()
    }

    #[must_use]
    pub fn bytes_written(&self) -> u32 {
        self.regs.bytes_written()
    }
}

impl FromNode for AxiDma {
    const COMPATIBLE: &'static str = "zbnt,message-dma";

    fn from_node(args: CoreArgs<'_>) -> anyhow::Result<Self> {
        let buffer = args
            .dma_buffer
            .ok_or_else(|| anyhow!("No valid DMA buffer found"))?;
        let mem_size = u32::try_from(buffer.size())?;
        let regs = Registers::<DmaRegisters>::new(args.window)?;
        regs.set_mem_base(buffer.phys_addr());
        regs.set_mem_size(mem_size);
        Ok(Self {
            name: KString::from_ref(args.name),
            index: args.index,
            regs,
        })
    }
}

impl HardwareCore for AxiDma {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CoreKind {
        CoreKind::AxiDma
    }

    fn index(&self) -> u32 {
        self.index
    }

    fn announce(&self, _out: &mut Vec<u8>) {}

    fn set_reset(&mut self, reset: bool) {
        let config = self.regs.config();
        if reset {
            self.regs.set_config(config | CFG_RESET);
        } else {
            self.regs.set_config(config & !CFG_RESET);
        }
    }

    fn set_property(&mut self, prop: PropertyId, _value: &[u8]) -> PropertyResult<()> {
        Err(PropertyError::Unsupported(prop))
    }

    fn get_property(&self, prop: PropertyId, _params: &[u8]) -> PropertyResult<Vec<u8>> {
        Err(PropertyError::Unsupported(prop))
    }
}
