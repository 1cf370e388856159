//! Ping-pong latency measurement between two ports

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
pub const CFG_BROADCAST: u16 = 16;

#[derive(RegisterBlock)]
#[repr(C)]
pub struct LatencyRegisters {
    config: u16,
    log_identifier: u16,
    mac_addr_a: [u8; 6],
    mac_addr_b: [u8; 6],
    ip_addr_a: u32,
    ip_addr_b: u32,
    padding: u32,
    delay: u32,
    timeout: u32,
    _reserved: u32,
    overflow_count: u64,
    ping_pong_good: u64,
    ping_latency: u32,
    pong_latency: u32,
    pings_lost: u64,
    pongs_lost: u64,
}

#[derive(Debug)]
pub struct LatencyMeasurer {
    name: KString,
    index: u32,
    ports: (u8, u8),
    regs: Registers<LatencyRegisters>,
}

impl LatencyMeasurer {
    fn set_config_bit(&self, bit: u16, on: bool) {
        let config = self.regs.config();
        self.regs
            .set_config(if on { config | bit } else { config & !bit });
    }
}

impl FromNode for LatencyMeasurer {
    const COMPATIBLE: &'static str = "zbnt,latency-measurer";

    fn from_node(args: CoreArgs<'_>) -> anyhow::Result<Self> {
        let ports: (u8, u8) = args.required("zbnt,ports")?;
        let regs = Registers::<LatencyRegisters>::new(args.window)?;
        regs.set_config(0);
        regs.set_padding(18);
        regs.set_timeout(125_000_000);
        regs.set_delay(12_500_000);
        regs.set_log_identifier(log_identifier(args.index));
        info!(
            core = args.name,
            port_a = ports.0,
            port_b = ports.1,
            "Latency measurer connected"
        );
        Ok(Self {
            name: KString::from_ref(args.name),
            index: args.index,
            ports,
            regs,
        })
    }
}

impl HardwareCore for LatencyMeasurer {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CoreKind {
        CoreKind::LatencyMeasurer
    }

    fn index(&self) -> u32 {
        self.index
    }

    fn ports(&self) -> u64 {
        (u64::from(self.ports.1) << 8) | u64::from(self.ports.0)
    }

    fn announce(&self, out: &mut Vec<u8>) {
        let mut rec = Announce::begin(out, self.index, self.kind());
        rec.property(PropertyId::Ports, &[self.ports.0, self.ports.1]);
        rec.finish();
    }

    fn set_reset(&mut self, reset: bool) {
        self.regs.set_config(if reset { CFG_RESET } else { 0 });
    }

    fn set_property(&mut self, prop: PropertyId, value: &[u8]) -> PropertyResult<()> {
        match prop {
            PropertyId::Enable => {
                let enable = u16::from(arg::<u8>(value, 0)?) & CFG_ENABLE;
                self.regs
                    .set_config((self.regs.config() & !CFG_ENABLE) | enable);
            }
            PropertyId::EnableLog => self.set_config_bit(CFG_LOG_ENABLE, flag(value)?),
            PropertyId::EnableBroadcast => self.set_config_bit(CFG_BROADCAST, flag(value)?),
            PropertyId::MacAddr => {
                let select = arg::<u8>(value, 0)? & 1;
                let mac: [u8; 6] = value
                    .get(1..7)
                    .and_then(|m| m.try_into().ok())
                    .ok_or(PropertyError::TooShort {
                        needed: 7,
                        got: value.len(),
                    })?;
                // The address must not be used half-written
                let config = self.regs.config();
                self.regs.set_config(config & !CFG_ENABLE);
                if select == 0 {
                    self.regs.set_mac_addr_a(mac);
                } else {
                    self.regs.set_mac_addr_b(mac);
                }
                self.regs.set_config(config);
            }
            PropertyId::IpAddr => {
                let select = arg::<u8>(value, 0)? & 1;
                let ip = arg::<u32>(value, 1)?;
                if select == 0 {
                    self.regs.set_ip_addr_a(ip);
                } else {
                    self.regs.set_ip_addr_b(ip);
                }
            }
            PropertyId::FramePadding => self.regs.set_padding(arg::<u16>(value, 0)?.into()),
            PropertyId::FrameGap => self.regs.set_delay(arg(value, 0)?),
            PropertyId::Timeout => self.regs.set_timeout(arg(value, 0)?),
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
            PropertyId::EnableBroadcast => reading(&u8::from(config & CFG_BROADCAST != 0)),
            PropertyId::MacAddr => {
                let mut out = self.regs.mac_addr_a().to_vec();
                out.extend_from_slice(&self.regs.mac_addr_b());
                Ok(out)
            }
            PropertyId::IpAddr => {
                let mut out = self.regs.ip_addr_a().to_le_bytes().to_vec();
                out.extend_from_slice(&self.regs.ip_addr_b().to_le_bytes());
                Ok(out)
            }
            #[allow(clippy::cast_possible_truncation)]
            PropertyId::FramePadding => reading(&(self.regs.padding() as u16)),
            PropertyId::FrameGap => reading(&self.regs.delay()),
            PropertyId::Timeout => reading(&self.regs.timeout()),
            PropertyId::OverflowCount => reading(&self.regs.overflow_count()),
            _ => Err(PropertyError::Unsupported(prop)),
        }
    }
}
