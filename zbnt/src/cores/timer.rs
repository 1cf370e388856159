//! The timer that bounds the duration of a run

use super::{
    arg,
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
use zbnt_derive::RegisterBlock;

pub const CFG_ENABLE: u32 = 1;
pub const CFG_RESET: u32 = 2;

/// Frequency the timer counts at, in Hz
pub const CLOCK_FREQ: u32 = 125_000_000;

#[derive(RegisterBlock)]
#[repr(C)]
pub struct TimerRegisters {
    config: u32,
    status: u32,
    max_time: u64,
    current_time: u64,
}

#[derive(Debug)]
pub struct SimpleTimer {
    name: KString,
    index: u32,
    regs: Registers<TimerRegisters>,
}

impl SimpleTimer {
    pub fn set_running(&self, running: bool) {
        let config = self.regs.config() & !CFG_ENABLE;
        self.regs.set_config(config | u32::from(running));
    }

    #[must_use]
    pub fn current_time(&self) -> u64 {
        self.regs.current_time()
    }

    #[must_use]
    pub fn maximum_time(&self) -> u64 {
        self.regs.max_time()
    }

    pub fn set_maximum_time(&self, time: u64) {
        self.regs.set_max_time(time);
    }
}

impl FromNode for SimpleTimer {
    const COMPATIBLE: &'static str = "zbnt,simple-timer";

    fn from_node(args: CoreArgs<'_>) -> anyhow::Result<Self> {
        let regs = Registers::<TimerRegisters>::new(args.window)?;
        // One second
        regs.set_max_time(u64::from(CLOCK_FREQ));
        Ok(Self {
            name: KString::from_ref(args.name),
            index: args.index,
            regs,
        })
    }
}

impl HardwareCore for SimpleTimer {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CoreKind {
        CoreKind::SimpleTimer
    }

    fn index(&self) -> u32 {
        self.index
    }

    fn announce(&self, out: &mut Vec<u8>) {
        let mut rec = Announce::begin(out, self.index, self.kind());
        rec.property(PropertyId::ClockFreq, &CLOCK_FREQ.to_le_bytes());
        rec.finish();
    }

    fn set_reset(&mut self, reset: bool) {
        self.regs.set_config(if reset { CFG_RESET } else { 0 });
    }

    fn set_property(&mut self, prop: PropertyId, value: &[u8]) -> PropertyResult<()> {
        match prop {
            PropertyId::Enable => {
                let enable = arg::<u8>(value, 0)?;
                let config = self.regs.config() & !CFG_ENABLE;
                self.regs.set_config(config | (u32::from(enable) & CFG_ENABLE));
                if enable == 0 {
                    self.regs.set_current_time(0);
                }
            }
            // Reserved, and the current time is read-only
            PropertyId::TimerMode | PropertyId::TimerTime => {}
            PropertyId::TimerLimit => self.regs.set_max_time(arg(value, 0)?),
            _ => return Err(PropertyError::Unsupported(prop)),
        }
        Ok(())
    }

    fn get_property(&self, prop: PropertyId, _params: &[u8]) -> PropertyResult<Vec<u8>> {
        match prop {
            #[allow(clippy::cast_possible_truncation)]
            PropertyId::Enable => reading(&((self.regs.config() & CFG_ENABLE) as u8)),
            PropertyId::TimerMode => Ok(vec![]),
            PropertyId::TimerTime => reading(&self.regs.current_time()),
            PropertyId::TimerLimit => reading(&self.regs.max_time()),
            _ => Err(PropertyError::Unsupported(prop)),
        }
    }
}
