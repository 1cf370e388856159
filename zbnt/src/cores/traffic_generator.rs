//! Frame generator driven by a template and per-byte source selectors

use super::{
    arg,
    flag,
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
use tracing::{
    debug,
    info,
};
use zbnt_derive::RegisterBlock;

pub const CFG_ENABLE: u32 = 1;
pub const CFG_RESET: u32 = 2;
pub const CFG_BURST: u32 = 4;
pub const CFG_SEED_REQ: u32 = 8;

/// Offset of the frame template memory
pub const MEM_TEMPLATE_OFFSET: usize = 0x800;
/// Offset of the source selector memory, one selector per template byte
pub const MEM_SOURCE_OFFSET: usize = 0x1000;
pub const MEM_SIZE: usize = 2048;

/// Selector for template bytes past the end of the frame template
const SOURCE_PADDING: u8 = 0x01;

#[derive(RegisterBlock)]
#[repr(C)]
pub struct TgenRegisters {
    config: u32,
    status: u32,
    fsize: u32,
    fdelay: u32,
    burst_time_on: u16,
    burst_time_off: u16,
    prng_seed_val: u8,
}

#[derive(Debug)]
pub struct TrafficGenerator {
    name: KString,
    index: u32,
    port: u8,
    regs: Registers<TgenRegisters>,
    template_name: Vec<u8>,
    template_size: usize,
}

impl TrafficGenerator {
    fn set_template(&mut self, value: &[u8]) -> PropertyResult<()> {
        let name_len = value
            .iter()
            .position(|&b| b == 0)
            .ok_or(PropertyError::Invalid("template name is not terminated"))?;
        if name_len == 0 {
            return Err(PropertyError::Invalid("empty template name"));
        }
        let data = &value[name_len + 1..];
        if data.is_empty() || data.len() % 2 != 0 {
            return Err(PropertyError::Invalid("template and sources differ in length"));
        }
        let template_len = data.len() / 2;
        if template_len > MEM_SIZE {
            return Err(PropertyError::Invalid("template too large"));
        }
        let (template, sources) = data.split_at(template_len);

        // Stop transmission while the template is inconsistent
        let config = self.regs.config();
        self.regs.set_config(config & !CFG_ENABLE);

        let mem = self.regs.window().region();
        mem.write_bytes(MEM_TEMPLATE_OFFSET, template);
        mem.write_bytes(MEM_SOURCE_OFFSET, sources);
        for i in template_len..MEM_SIZE {
            mem.write::<u8>(MEM_TEMPLATE_OFFSET + i, 0x00);
            mem.write::<u8>(MEM_SOURCE_OFFSET + i, SOURCE_PADDING);
        }
        self.template_name = value[..name_len].to_vec();
        self.template_size = template_len;

        self.regs.set_config(config);
        debug!(core = %self.name, size = template_len, "Frame template updated");
        Ok(())
    }

    fn template(&self) -> Vec<u8> {
        let mem = self.regs.window().region();
        let mut out = self.template_name.clone();
        out.push(0);
        out.extend(mem.read_bytes(MEM_TEMPLATE_OFFSET, self.template_size));
        out.extend(mem.read_bytes(MEM_SOURCE_OFFSET, self.template_size));
        out
    }
}

impl FromNode for TrafficGenerator {
    const COMPATIBLE: &'static str = "zbnt,traffic-generator";

    fn from_node(args: CoreArgs<'_>) -> anyhow::Result<Self> {
        let port: u8 = args.required("zbnt,ports")?;
        let regs = Registers::<TgenRegisters>::with_min_len(
            args.window,
            MEM_SOURCE_OFFSET + MEM_SIZE,
        )?;
        regs.set_fsize(60);
        regs.set_fdelay(12);
        regs.set_burst_time_on(100);
        regs.set_burst_time_off(100);
        info!(core = args.name, port, "Traffic generator connected");
        Ok(Self {
            name: KString::from_ref(args.name),
            index: args.index,
            port,
            regs,
            template_name: vec![],
            template_size: 0,
        })
    }
}

impl HardwareCore for TrafficGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CoreKind {
        CoreKind::TrafficGenerator
    }

    fn index(&self) -> u32 {
        self.index
    }

    fn ports(&self) -> u64 {
        u64::from(self.port)
    }

    fn announce(&self, out: &mut Vec<u8>) {
        #[allow(clippy::cast_possible_truncation)]
        let max_template = MEM_SIZE as u32;
        let mut rec = Announce::begin(out, self.index, self.kind());
        rec.property(PropertyId::Ports, &[self.port])
            .property(PropertyId::MaxTemplateSize, &max_template.to_le_bytes());
        rec.finish();
    }

    fn set_reset(&mut self, reset: bool) {
        self.regs.set_config(if reset { CFG_RESET } else { 0 });
    }

    fn set_property(&mut self, prop: PropertyId, value: &[u8]) -> PropertyResult<()> {
        let config = self.regs.config();
        match prop {
            PropertyId::Enable => {
                let enable = u32::from(arg::<u8>(value, 0)?) & CFG_ENABLE;
                self.regs.set_config((config & !CFG_ENABLE) | enable);
            }
            PropertyId::EnableBurst => {
                if flag(value)? {
                    self.regs.set_config(config | CFG_BURST);
                } else {
                    self.regs.set_config(config & !CFG_BURST);
                }
            }
            PropertyId::FrameSize => self.regs.set_fsize(arg::<u16>(value, 0)?.into()),
            PropertyId::FrameGap => self.regs.set_fdelay(arg(value, 0)?),
            PropertyId::BurstTimeOn => self.regs.set_burst_time_on(arg(value, 0)?),
            PropertyId::BurstTimeOff => self.regs.set_burst_time_off(arg(value, 0)?),
            PropertyId::PrngSeed => {
                self.regs.set_prng_seed_val(arg(value, 0)?);
                self.regs.set_config(config | CFG_SEED_REQ);
            }
            PropertyId::FrameTemplate => self.set_template(value)?,
            _ => return Err(PropertyError::Unsupported(prop)),
        }
        Ok(())
    }

    fn get_property(&self, prop: PropertyId, _params: &[u8]) -> PropertyResult<Vec<u8>> {
        let config = self.regs.config();
        match prop {
            #[allow(clippy::cast_possible_truncation)]
            PropertyId::Enable => reading(&((config & CFG_ENABLE) as u8)),
            PropertyId::EnableBurst => reading(&u8::from(config & CFG_BURST != 0)),
            #[allow(clippy::cast_possible_truncation)]
            PropertyId::FrameSize => reading(&(self.regs.fsize() as u16)),
            PropertyId::FrameGap => reading(&self.regs.fdelay()),
            PropertyId::BurstTimeOn => reading(&self.regs.burst_time_on()),
            PropertyId::BurstTimeOff => reading(&self.regs.burst_time_off()),
            PropertyId::PrngSeed => reading(&self.regs.prng_seed_val()),
            PropertyId::FrameTemplate => Ok(self.template()),
            _ => Err(PropertyError::Unsupported(prop)),
        }
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
    use paste::paste;

    const WINDOW: usize = MEM_SOURCE_OFFSET + MEM_SIZE;

    fn tgen() -> (TrafficGenerator, Region) {
        let blob = single_node(TrafficGenerator::COMPATIBLE, |w| {
            w.cells_property("zbnt,ports", &[1]);
        });
        build::<TrafficGenerator>(&blob, 0, WINDOW, None).unwrap()
    }

    #[test]
    fn test_defaults() {
        let (_, mem) = tgen();
        assert_eq!(mem.read::<u32>(TgenRegisters::FSIZE), 60);
        assert_eq!(mem.read::<u32>(TgenRegisters::FDELAY), 12);
        assert_eq!(mem.read::<u16>(TgenRegisters::BURST_TIME_ON), 100);
        assert_eq!(mem.read::<u16>(TgenRegisters::BURST_TIME_OFF), 100);
    }

    #[test]
    fn test_window_must_cover_template() {
        let blob = single_node(TrafficGenerator::COMPATIBLE, |w| {
            w.cells_property("zbnt,ports", &[1]);
        });
        assert!(build::<TrafficGenerator>(&blob, 0, 0x1000, None).is_err());
    }

    macro_rules! test_bool_prop {
        ($prop:ident) => {
            paste! {
                #[test]
                fn [<test_ $prop:snake _round_trip>]() {
                    let (mut core, _) = tgen();
                    for v in [1u8, 0, 1] {
                        core.set_property(PropertyId::$prop, &[v]).unwrap();
                        assert_eq!(core.get_property(PropertyId::$prop, &[]).unwrap(), [v]);
                    }
                    assert!(core.set_property(PropertyId::$prop, &[]).is_err());
                    assert_eq!(core.get_property(PropertyId::$prop, &[]).unwrap(), [1]);
                }
            }
        };
    }

    test_bool_prop!(Enable);
    test_bool_prop!(EnableBurst);

    #[test]
    fn test_frame_size_is_16_bits() {
        let (mut core, mem) = tgen();
        core.set_property(PropertyId::FrameSize, &[0xEE, 0x05, 0xFF])
            .unwrap();
        assert_eq!(mem.read::<u32>(TgenRegisters::FSIZE), 0x05EE);
        assert_eq!(
            core.get_property(PropertyId::FrameSize, &[]).unwrap(),
            [0xEE, 0x05]
        );
        assert!(core.set_property(PropertyId::FrameSize, &[1]).is_err());
    }

    #[test]
    fn test_seed_request() {
        let (mut core, mem) = tgen();
        core.set_property(PropertyId::PrngSeed, &[0x5A]).unwrap();
        assert_eq!(mem.read::<u8>(TgenRegisters::PRNG_SEED_VAL), 0x5A);
        assert_eq!(mem.read::<u32>(TgenRegisters::CONFIG) & CFG_SEED_REQ, CFG_SEED_REQ);
    }

    #[test]
    fn test_template() {
        let (mut core, mem) = tgen();
        core.set_property(PropertyId::Enable, &[1]).unwrap();
        let mut value = b"ping\0".to_vec();
        value.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0x00, 0x02, 0x03]);
        core.set_property(PropertyId::FrameTemplate, &value).unwrap();

        assert_eq!(mem.read_bytes(MEM_TEMPLATE_OFFSET, 4), [0xAA, 0xBB, 0xCC, 0]);
        assert_eq!(mem.read_bytes(MEM_SOURCE_OFFSET, 4), [0x00, 0x02, 0x03, 0x01]);
        assert_eq!(mem.read::<u8>(MEM_SOURCE_OFFSET + MEM_SIZE - 1), 0x01);
        // Enable is restored
        assert_eq!(mem.read::<u32>(TgenRegisters::CONFIG) & CFG_ENABLE, CFG_ENABLE);
        assert_eq!(
            core.get_property(PropertyId::FrameTemplate, &[]).unwrap(),
            value
        );
    }

    #[test]
    fn test_bad_templates() {
        let (mut core, mem) = tgen();
        for bad in [
            b"\0\x01\x02".as_slice(),
            b"name\0",
            b"name\0\x01\x02\x03",
            b"no terminator",
        ] {
            assert!(core.set_property(PropertyId::FrameTemplate, bad).is_err());
        }
        let mut huge = b"big\0".to_vec();
        huge.resize(4 + 2 * (MEM_SIZE + 1), 0xAB);
        assert!(core.set_property(PropertyId::FrameTemplate, &huge).is_err());
        assert_eq!(mem.read::<u8>(MEM_TEMPLATE_OFFSET), 0);
        assert_eq!(
            core.get_property(PropertyId::FrameTemplate, &[]).unwrap(),
            [0]
        );
    }

    #[test]
    fn test_announce() {
        let (core, _) = tgen();
        let mut out = vec![];
        core.announce(&mut out);
        assert_eq!(out, [0, 6, 13, 0, 23, 0, 1, 0, 1, 26, 0, 4, 0, 0, 8, 0, 0]);
    }
}
