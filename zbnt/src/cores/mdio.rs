//! MDIO bus master used to configure the Ethernet PHYs

use super::{
    Announce,
    CoreArgs,
    FromNode,
    HardwareCore,
    PropertyError,
    PropertyResult,
};
use crate::{
    error::{
        Error,
        Result,
    },
    messages::{
        CoreKind,
        PropertyId,
    },
    mmio::Registers,
};
use anyhow::{
    anyhow,
    bail,
};
use kstring::KString;
use std::time::{
    Duration,
    Instant,
};
use tracing::{
    debug,
    info,
};
use zbnt_derive::RegisterBlock;

pub const CTL_START: u32 = 1;
pub const CTL_ENABLE: u32 = 8;
pub const OP_READ: u32 = 1024;

/// Registers above this address are only reachable through the extended address sequence
pub const MAX_DIRECT_REG: u32 = 31;
pub const MAX_PHY_ADDR: u32 = 31;

/// Longest a single bus transaction may take
pub const TRANSACTION_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(RegisterBlock)]
#[repr(C)]
pub struct MdioRegisters {
    _padding: [u8; 0x7E4],
    addr: u32,
    wr_data: u32,
    rd_data: u32,
    ctl: u32,
}

#[derive(Debug)]
pub struct AxiMdio {
    name: KString,
    index: u32,
    ports: Vec<u8>,
    phys: Vec<u8>,
    regs: Registers<MdioRegisters>,
    timeout: Duration,
}

impl AxiMdio {
    fn transaction(&self, addr: u32) -> Result<()> {
        self.regs.set_addr(addr);
        self.regs.set_ctl(CTL_ENABLE | CTL_START);
        let start = Instant::now();
        while self.regs.ctl() & CTL_START != 0 {
            if start.elapsed() > self.timeout {
                return Err(Error::Unresponsive {
                    what: "MDIO bus",
                    timeout: self.timeout,
                });
            }
            std::hint::spin_loop();
        }
        Ok(())
    }

    /// Read a register of the PHY at `phy`
    /// # Errors
    /// Returns an error if the bus doesn't complete the transaction in time
    pub fn read_phy(&self, phy: u32, reg: u32) -> Result<u32> {
        self.transaction(OP_READ | (phy << 5) | reg)?;
        Ok(self.regs.rd_data())
    }

    /// # Errors
    /// Returns an error if the bus doesn't complete the transaction in time
    pub fn write_phy(&self, phy: u32, reg: u32, value: u32) -> Result<()> {
        self.regs.set_wr_data(value);
        self.transaction((phy << 5) | reg)
    }

    fn select_extended(&self, phy: u32, reg: u32) -> Result<()> {
        self.write_phy(phy, 0x0D, 0x001F)?;
        self.write_phy(phy, 0x0E, reg)?;
        self.write_phy(phy, 0x0D, 0x401F)
    }

    /// Read an extended PHY register through the indirect access registers
    /// # Errors
    /// Returns an error if the bus doesn't complete a transaction in time
    pub fn read_phy_indirect(&self, phy: u32, reg: u32) -> Result<u32> {
        self.select_extended(phy, reg)?;
        self.read_phy(phy, 0x0E)
    }

    /// # Errors
    /// Returns an error if the bus doesn't complete a transaction in time
    pub fn write_phy_indirect(&self, phy: u32, reg: u32, value: u32) -> Result<()> {
        self.select_extended(phy, reg)?;
        self.write_phy(phy, 0x0E, value)
    }

    #[must_use]
    pub fn phys(&self) -> &[u8] {
        &self.phys
    }
}

impl FromNode for AxiMdio {
    const COMPATIBLE: &'static str = "zbnt,axi-mdio";

    fn from_node(args: CoreArgs<'_>) -> anyhow::Result<Self> {
        // Out of range entries are dropped, the two lists must still line up afterwards
        let ports: Vec<u8> = args
            .fdt
            .cells(args.node, "zbnt,ports")
            .ok_or_else(|| anyhow!("Device tree lacks a valid value for zbnt,ports"))?
            .filter_map(|p| u8::try_from(p).ok())
            .collect();
        let phys: Vec<u8> = args
            .fdt
            .cells(args.node, "zbnt,phy-addr")
            .ok_or_else(|| anyhow!("Device tree lacks a valid value for zbnt,phy-addr"))?
            .filter(|&p| p <= MAX_PHY_ADDR)
            .filter_map(|p| u8::try_from(p).ok())
            .collect();
        if ports.len() != phys.len() {
            bail!(
                "Number of ports ({}) and PHYs ({}) doesn't match",
                ports.len(),
                phys.len()
            );
        }

        let core = Self {
            name: KString::from_ref(args.name),
            index: args.index,
            ports,
            phys,
            regs: Registers::new(args.window)?,
            timeout: TRANSACTION_TIMEOUT,
        };
        for (port, phy) in core.ports.iter().zip(&core.phys) {
            info!(core = args.name, port, phy, "PHY attached");
        }

        if let Some(cells) = args.fdt.cells(args.node, "zbnt,init-seq") {
            let cells: Vec<u32> = cells.collect();
            for step in cells.chunks_exact(3) {
                let (phy, reg, value) = (step[0], step[1], step[2]);
                if phy > MAX_PHY_ADDR {
                    continue;
                }
                debug!(core = args.name, phy, reg, value, "PHY init");
                if reg > MAX_DIRECT_REG {
                    core.write_phy_indirect(phy, reg, value)?;
                } else {
                    core.write_phy(phy, reg, value)?;
                }
            }
        }
        Ok(core)
    }
}

impl HardwareCore for AxiMdio {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CoreKind {
        CoreKind::AxiMdio
    }

    fn index(&self) -> u32 {
        self.index
    }

    fn announce(&self, out: &mut Vec<u8>) {
        let mut rec = Announce::begin(out, self.index, self.kind());
        rec.property(PropertyId::Ports, &self.ports)
            .property(PropertyId::PhyAddr, &self.phys);
        rec.finish();
    }

    fn set_reset(&mut self, _reset: bool) {}

    fn set_property(&mut self, prop: PropertyId, _value: &[u8]) -> PropertyResult<()> {
        Err(PropertyError::Unsupported(prop))
    }

    fn get_property(&self, prop: PropertyId, _params: &[u8]) -> PropertyResult<Vec<u8>> {
        Err(PropertyError::Unsupported(prop))
    }
}
