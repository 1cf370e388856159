//! Scripted frame matching and editing between two ports

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
    codec::{
        Decode,
        Encode,
    },
    messages::{
        CoreKind,
        PropertyId,
    },
    mmio::Registers,
};
use anyhow::bail;
use kstring::KString;
use tracing::info;
use zbnt_derive::RegisterBlock;

pub const CFG_ENABLE: u16 = 1;
pub const CFG_RESET: u16 = 2;
pub const CFG_LOG_ENABLE: u16 = 4;

pub const HAS_CMP_UNIT: u32 = 1;
pub const HAS_EDIT_UNIT: u32 = 2;
pub const HAS_CSUM_UNIT: u32 = 4;

#[derive(RegisterBlock)]
#[repr(C)]
pub struct DetectorRegisters {
    config: u16,
    log_identifier: u16,
    script_enable: u32,
    features: u32,
    num_scripts: u32,
    max_script_size: u32,
    script_mem_offset: u32,
    tx_fifo_size: u32,
    extr_fifo_size: u32,
    overflow_count_a: u64,
    overflow_count_b: u64,
}

#[derive(Debug)]
pub struct FrameDetector {
    name: KString,
    index: u32,
    ports: (u8, u8),
    regs: Registers<DetectorRegisters>,
    /// Byte offset of the first script slot in the window
    script_base: usize,
    /// Words in each script slot
    script_words: usize,
    /// Client supplied names, one per script slot
    script_names: Vec<Vec<u8>>,
}

impl FrameDetector {
    /// Scripts in each direction
    #[must_use]
    pub fn num_scripts(&self) -> u32 {
        self.regs.num_scripts()
    }

    #[must_use]
    pub fn features(&self) -> u32 {
        self.regs.features()
    }

    /// Byte offset and length in words of script slot `idx`, already checked to fit the window
    fn script_slot(&self, idx: u32) -> (usize, usize) {
        let offset = self.script_base + 4 * idx as usize * self.script_words;
        (offset, self.script_words)
    }

    /// The script slot selected by the first word of `data`
    fn slot_index(&self, data: &[u8]) -> PropertyResult<u32> {
        let idx = arg::<u32>(data, 0)?;
        if idx as usize >= self.script_names.len() {
            return Err(PropertyError::Invalid("script slot out of range"));
        }
        Ok(idx)
    }

    /// Longer scripts are truncated to the slot, shorter ones are padded with zeros
    fn write_script(&self, value: &[u8]) -> PropertyResult<()> {
        if value.len() % 4 != 0 {
            return Err(PropertyError::Invalid("script is not a whole number of words"));
        }
        let idx = self.slot_index(value)?;
        let (offset, words) = self.script_slot(idx);
        let mem = self.regs.window().region();

        // Take the script offline while it's being replaced
        let mask = 1u32.checked_shl(idx).unwrap_or(0);
        let enable = self.regs.script_enable();
        self.regs.set_script_enable(enable & !mask);
        for i in 0..words {
            let word = u32::decode(value, 4 + 4 * i).unwrap_or(0);
            mem.write::<u32>(offset + 4 * i, word);
        }
        self.regs.set_script_enable(enable);
        Ok(())
    }

    fn read_script(&self, params: &[u8]) -> PropertyResult<Vec<u8>> {
        let idx = self.slot_index(params)?;
        let (offset, words) = self.script_slot(idx);
        let mem = self.regs.window().region();
        let mut out = Vec::with_capacity(4 * words);
        for i in 0..words {
            mem.read::<u32>(offset + 4 * i).encode(&mut out);
        }
        Ok(out)
    }
}

impl FromNode for FrameDetector {
    const COMPATIBLE: &'static str = "zbnt,frame-detector";

    fn from_node(args: CoreArgs<'_>) -> anyhow::Result<Self> {
        let ports: (u8, u8) = args.required("zbnt,ports")?;
        let regs = Registers::<DetectorRegisters>::new(args.window)?;

        // Every script slot has to be reachable through the window
        let script_base = regs.script_mem_offset() as usize;
        let script_words = regs.max_script_size() as usize;
        let Some(slots) = (regs.num_scripts() as usize).checked_mul(2) else {
            bail!("Script count {} is out of range", regs.num_scripts());
        };
        let Some(script_end) = slots
            .checked_mul(script_words)
            .and_then(|w| w.checked_mul(4))
            .and_then(|len| len.checked_add(script_base))
        else {
            bail!(
                "Script memory of {slots} slots, {script_words} words each, overflows the \
                 address space"
            );
        };
        if slots > 0 && script_end > regs.window().len() {
            bail!(
                "Script memory ends at {script_end:#x}, past the register window of {:#x} bytes",
                regs.window().len()
            );
        }

        regs.set_config(CFG_LOG_ENABLE | CFG_ENABLE);
        regs.set_log_identifier(log_identifier(args.index));
        info!(
            core = args.name,
            port_a = ports.0,
            port_b = ports.1,
            scripts = slots,
            "Frame detector connected"
        );
        Ok(Self {
            name: KString::from_ref(args.name),
            index: args.index,
            ports,
            regs,
            script_base,
            script_words,
            script_names: vec![vec![]; slots],
        })
    }
}

impl HardwareCore for FrameDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CoreKind {
        CoreKind::FrameDetector
    }

    fn index(&self) -> u32 {
        self.index
    }

    fn ports(&self) -> u64 {
        (u64::from(self.ports.1) << 8) | u64::from(self.ports.0)
    }

    fn announce(&self, out: &mut Vec<u8>) {
        let mut fifo_size = vec![];
        self.regs.tx_fifo_size().encode(&mut fifo_size);
        self.regs.extr_fifo_size().encode(&mut fifo_size);

        let mut rec = Announce::begin(out, self.index, self.kind());
        rec.property(PropertyId::Ports, &[self.ports.0, self.ports.1])
            .property(PropertyId::FeatureBits, &self.regs.features().to_le_bytes())
            .property(PropertyId::NumScripts, &self.regs.num_scripts().to_le_bytes())
            .property(
                PropertyId::MaxScriptSize,
                &self.regs.max_script_size().to_le_bytes(),
            )
            .property(PropertyId::FifoSize, &fifo_size);
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
            PropertyId::EnableScript => self.regs.set_script_enable(arg(value, 0)?),
            // Read-only
            PropertyId::OverflowCount => {}
            PropertyId::FrameScript => self.write_script(value)?,
            PropertyId::FrameScriptName => {
                let idx = self.slot_index(value)? as usize;
                self.script_names[idx] = value[4..].to_vec();
            }
            _ => return Err(PropertyError::Unsupported(prop)),
        }
        Ok(())
    }

    fn get_property(&self, prop: PropertyId, params: &[u8]) -> PropertyResult<Vec<u8>> {
        let config = self.regs.config();
        match prop {
            #[allow(clippy::cast_possible_truncation)]
            PropertyId::Enable => reading(&((config & CFG_ENABLE) as u8)),
            PropertyId::EnableLog => reading(&u8::from(config & CFG_LOG_ENABLE != 0)),
            PropertyId::EnableScript => reading(&self.regs.script_enable()),
            PropertyId::OverflowCount => {
                let mut out = vec![];
                self.regs.overflow_count_a().encode(&mut out);
                self.regs.overflow_count_b().encode(&mut out);
                Ok(out)
            }
            PropertyId::FrameScript => self.read_script(params),
            PropertyId::FrameScriptName => {
                let idx = self.slot_index(params)? as usize;
                Ok(self.script_names[idx].clone())
            }
            _ => Err(PropertyError::Unsupported(prop)),
        }
    }
}
