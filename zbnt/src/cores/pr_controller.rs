//! Partial reconfiguration controller, swaps the reconfigurable partition of a PCIe board

use super::{
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
use anyhow::bail;
use kstring::KString;
use std::{
    thread,
    time::{
        Duration,
        Instant,
    },
};
use tracing::{
    debug,
    info,
};
use zbnt_derive::RegisterBlock;

pub const CMD_RESTART: u32 = 1;
pub const ST_SHUTDOWN: u32 = 1 << 7;
pub const ST_ACTIVE_OKAY: u32 = 7;
pub const TRIGGER_PENDING: u32 = 1 << 31;

/// Longest a reconfiguration may take
pub const RECONFIG_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(RegisterBlock)]
#[repr(C)]
pub struct PrRegisters {
    status: u32,
    trigger: u32,
}

#[derive(Debug)]
pub struct PrController {
    name: KString,
    index: u32,
    bitstreams: Vec<KString>,
    regs: Registers<PrRegisters>,
    timeout: Duration,
}

impl PrController {
    /// Names of the bitstreams the controller can load, in trigger order
    #[must_use]
    pub fn bitstreams(&self) -> &[KString] {
        &self.bitstreams
    }

    /// The bitstream currently loaded in the partition
    #[must_use]
    pub fn active_bitstream(&self) -> &str {
        let idx = ((self.regs.status() >> 8) & 0xFFFF) as usize;
        self.bitstreams
            .get(idx)
            .unwrap_or(&self.bitstreams[0])
            .as_str()
    }

    /// Load `name` into the partition and wait for the controller to finish
    /// # Errors
    /// Returns an error if the bitstream is unknown, the controller doesn't finish in time or
    /// reports a failure
    pub fn load(&self, name: &str) -> Result<()> {
        let idx = self
            .bitstreams
            .iter()
            .position(|b| b == name)
            .ok_or_else(|| Error::UnknownBitstream(KString::from_ref(name)))?;

        if self.regs.status() & ST_SHUTDOWN != 0 {
            debug!(core = %self.name, "Restarting PR controller");
            self.regs.set_status(CMD_RESTART);
            thread::sleep(Duration::from_millis(1));
        }

        #[allow(clippy::cast_possible_truncation)]
        self.regs.set_trigger(idx as u32);
        let start = Instant::now();
        loop {
            thread::sleep(Duration::from_millis(1));
            if self.regs.status() & TRIGGER_PENDING == 0 {
                break;
            }
            if start.elapsed() > self.timeout {
                return Err(Error::Unresponsive {
                    what: "PR controller",
                    timeout: self.timeout,
                });
            }
        }

        let status = self.regs.status();
        if status & 0xFF != ST_ACTIVE_OKAY {
            return Err(Error::Reconfiguration(status));
        }
        info!(core = %self.name, bitstream = name, "Partition reconfigured");
        Ok(())
    }
}

impl FromNode for PrController {
    const COMPATIBLE: &'static str = "zbnt,pr-controller";

    fn from_node(args: CoreArgs<'_>) -> anyhow::Result<Self> {
        let bitstreams: Vec<KString> = args
            .fdt
            .stringlist(args.node, "zbnt,bitstreams")
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .map(KString::from_ref)
            .collect();
        if bitstreams.is_empty() {
            bail!("Device tree lacks a valid value for zbnt,bitstreams");
        }
        Ok(Self {
            name: KString::from_ref(args.name),
            index: args.index,
            bitstreams,
            regs: Registers::new(args.window)?,
            timeout: RECONFIG_TIMEOUT,
        })
    }
}

impl HardwareCore for PrController {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CoreKind {
        CoreKind::PrController
    }

    fn index(&self) -> u32 {
        self.index
    }

    // Not visible to clients
    fn announce(&self, _out: &mut Vec<u8>) {}

    fn set_reset(&mut self, _reset: bool) {}

    fn set_property(&mut self, prop: PropertyId, _value: &[u8]) -> PropertyResult<()> {
        Err(PropertyError::Unsupported(prop))
    }

    fn get_property(&self, prop: PropertyId, _params: &[u8]) -> PropertyResult<Vec<u8>> {
        Err(PropertyError::Unsupported(prop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cores::test_util::{
            build,
            single_node,
        },
        mmio::Region,
    };

    fn controller() -> (PrController, Region) {
        let blob = single_node(PrController::COMPATIBLE, |w| {
            w.stringlist_property("zbnt,bitstreams", &["dual_tgen", "", "quad_tgen"]);
        });
        build::<PrController>(&blob, 0, 8, None).unwrap()
    }

    #[test]
    fn test_empty_names_are_skipped() {
        let (core, _) = controller();
        assert_eq!(core.bitstreams(), ["dual_tgen", "quad_tgen"]);
    }

    #[test]
    fn test_requires_bitstreams() {
        let blob = single_node(PrController::COMPATIBLE, |w| {
            w.stringlist_property("zbnt,bitstreams", &[""]);
        });
        assert!(build::<PrController>(&blob, 0, 8, None).is_err());
    }

    #[test]
    fn test_active_bitstream() {
        let (core, mem) = controller();
        mem.write::<u32>(PrRegisters::STATUS, (1 << 8) | ST_ACTIVE_OKAY);
        assert_eq!(core.active_bitstream(), "quad_tgen");
        // Out of range falls back to the first one
        mem.write::<u32>(PrRegisters::STATUS, 2 << 8);
        assert_eq!(core.active_bitstream(), "dual_tgen");
    }

    #[test]
    fn test_load() {
        let (core, mem) = controller();
        mem.write::<u32>(PrRegisters::STATUS, (1 << 8) | ST_ACTIVE_OKAY);
        core.load("quad_tgen").unwrap();
        assert_eq!(mem.read::<u32>(PrRegisters::TRIGGER), 1);
        assert_eq!(core.active_bitstream(), "quad_tgen");
    }

    #[test]
    fn test_load_failure() {
        let (core, mem) = controller();
        mem.write::<u32>(PrRegisters::STATUS, 0x0000_0102);
        let err = core.load("dual_tgen").unwrap_err();
        assert!(matches!(err, Error::Reconfiguration(0x0102)));
    }

    #[test]
    fn test_restarts_after_shutdown() {
        let (core, mem) = controller();
        mem.write::<u32>(PrRegisters::STATUS, ST_SHUTDOWN);
        // The restart command overwrites the status, which then doesn't read as okay
        let err = core.load("dual_tgen").unwrap_err();
        assert!(matches!(err, Error::Reconfiguration(CMD_RESTART)));
    }

    #[test]
    fn test_unknown_bitstream() {
        let (core, mem) = controller();
        let err = core.load("nope").unwrap_err();
        assert!(matches!(err, Error::UnknownBitstream(_)));
        assert_eq!(mem.read::<u32>(PrRegisters::TRIGGER), 0);
    }

    #[test]
    fn test_stuck_controller() {
        let (mut core, mem) = controller();
        core.timeout = Duration::from_millis(20);
        // Still pending even though the low byte reads okay
        mem.write::<u32>(
            PrRegisters::STATUS,
            TRIGGER_PENDING | (1 << 8) | ST_ACTIVE_OKAY,
        );
        let err = core.load("quad_tgen").unwrap_err();
        assert!(matches!(err, Error::Unresponsive { .. }));
    }

    #[test]
    fn test_load_waits_for_pending() {
        let (core, mem) = controller();
        mem.write::<u32>(
            PrRegisters::STATUS,
            TRIGGER_PENDING | (1 << 8) | ST_ACTIVE_OKAY,
        );
        let done = {
            let mem = mem.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                mem.write::<u32>(PrRegisters::STATUS, (1 << 8) | ST_ACTIVE_OKAY);
            })
        };
        let start = Instant::now();
        core.load("quad_tgen").unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
        done.join().unwrap();
    }
}
