//! Per-port traffic counters

use super::{
    arg,
    flag,
    log_identifier,
    reading,
    Announce,
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
use kstring::KString;
use tracing::info;
use zbnt_derive::RegisterBlock;

pub const CFG_ENABLE: u16 = 1;
pub const CFG_RESET: u16 = 2;
pub const CFG_HOLD: u16 = 4;
pub const CFG_LOG_ENABLE: u16 = 8;

#[derive(RegisterBlock)]
#[repr(C)]
pub struct StatsRegisters {
    config: u16,
    log_identifier: u16,
    sample_period: u32,
    overflow_count: u64,
    time: u64,
    tx_bytes: u64,
    tx_good: u64,
    tx_bad: u64,
    rx_bytes: u64,
    rx_good: u64,
    rx_bad: u64,
}

#[derive(Debug)]
pub struct StatsCollector {
    name: KString,
    index: u32,
    port: u8,
    regs: Registers<StatsRegisters>,
}

impl FromNode for StatsCollector {
    const COMPATIBLE: &'static str = "zbnt,stats-collector";

    fn from_node(args: CoreArgs<'_>) -> anyhow::Result<Self> {
        let port: u8 = args.required("zbnt,ports")?;
        let regs = Registers::<StatsRegisters>::new(args.window)?;
        regs.set_config(CFG_LOG_ENABLE | CFG_ENABLE);
        regs.set_sample_period(12_500_000);
        regs.set_log_identifier(log_identifier(args.index));
        info!(core = args.name, port, "Stats collector connected");
        Ok(Self {
            name: KString::from_ref(args.name),
            index: args.index,
            port,
            regs,
        })
    }
}

impl HardwareCore for StatsCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CoreKind {
        CoreKind::StatsCollector
    }

    fn index(&self) -> u32 {
        self.index
    }

    fn ports(&self) -> u64 {
        u64::from(self.port)
    }

    fn announce(&self, out: &mut Vec<u8>) {
        let mut rec = Announce::begin(out, self.index, self.kind());
        rec.property(PropertyId::Ports, &[self.port]);
        rec.finish();
    }

    fn set_reset(&mut self, reset: bool) {
        self.regs.set_config(if reset { CFG_RESET } else { 0 });
    }

    fn set_property(&mut self, prop: PropertyId, value: &[u8]) -> PropertyResult<()> {
        let config = self.regs.config();
        match prop {
            PropertyId::Enable => {
                let enable = u16::from(arg::<u8>(value, 0)?) & CFG_ENABLE;
                self.regs.set_config((config & !CFG_ENABLE) | enable);
            }
            PropertyId::EnableLog => {
                if flag(value)? {
                    self.regs.set_config(config | CFG_LOG_ENABLE);
                } else {
                    self.regs.set_config(config & !CFG_LOG_ENABLE);
                }
            }
            PropertyId::SamplePeriod => self.regs.set_sample_period(arg(value, 0)?),
            // Read-only
            PropertyId::OverflowCount => {}
            _ => return Err(PropertyError::Unsupported(prop)),
        }
        Ok(())
    }

    fn get_property(&self, prop: PropertyId, _params: &[u8]) -> PropertyResult<Vec<u8>> {
        let config = self.regs.config();
        match prop {
            #[allow(clippy::cast_possible_truncation)]
            PropertyId::Enable => reading(&((config & CFG_ENABLE) as u8)),
            PropertyId::EnableLog => reading(&u8::from(config & CFG_LOG_ENABLE != 0)),
            PropertyId::SamplePeriod => reading(&self.regs.sample_period()),
            PropertyId::OverflowCount => reading(&self.regs.overflow_count()),
            _ => Err(PropertyError::Unsupported(prop)),
        }
    }
}
