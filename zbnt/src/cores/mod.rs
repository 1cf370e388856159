//! The hardware cores a bitstream can contain and the property contract they share.
//!
//! Every core is built from a device tree node through [`FromNode`]. The set of cores is closed,
//! [`Core`] holds any of them and [`REGISTRY`] maps `compatible` strings to constructors.

pub mod dma;
pub mod frame_detector;
pub mod latency_measurer;
pub mod mdio;
pub mod pr_controller;
pub mod stats_collector;
pub mod timer;
pub mod traffic_generator;

pub use dma::AxiDma;
pub use frame_detector::FrameDetector;
pub use latency_measurer::LatencyMeasurer;
pub use mdio::AxiMdio;
pub use pr_controller::PrController;
pub use stats_collector::StatsCollector;
pub use timer::SimpleTimer;
pub use traffic_generator::TrafficGenerator;

use crate::{
    codec::{
        Decode,
        Encode,
    },
    dma_buffer::DmaBuffer,
    messages::{
        CoreKind,
        MessageId,
        PropertyId,
    },
    mmio::RegisterWindow,
};
use anyhow::anyhow;
use thiserror::Error;
use zbnt_utils::fdt::{
    Fdt,
    FromCells,
    NodeOffset,
};

/// Index reported by the DMA engine, which clients can't address
pub const DMA_INDEX: u32 = 0x100;
/// Index clients use to address the timer
pub const TIMER_INDEX: u32 = 0xFF;

/// Tag written to cores that emit measurements, marking their records in the DMA stream
#[must_use]
pub fn log_identifier(index: u32) -> u16 {
    #[allow(clippy::cast_possible_truncation)]
    let index = index as u16;
    index | MessageId::Measurement as u16
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PropertyError {
    #[error("Property {0:?} is not supported by this core")]
    Unsupported(PropertyId),
    #[error("Value needs at least {needed} bytes, got {got}")]
    TooShort { needed: usize, got: usize },
    #[error("Invalid value: {0}")]
    Invalid(&'static str),
}

pub type PropertyResult<T> = std::result::Result<T, PropertyError>;

/// The contract every core exposes to clients
pub trait HardwareCore {
    fn name(&self) -> &str;
    fn kind(&self) -> CoreKind;
    fn index(&self) -> u32;

    /// Ports this core is attached to, packed one per byte starting from the least significant
    fn ports(&self) -> u64 {
        0
    }

    /// Append the record describing this core to `out`
    fn announce(&self, out: &mut Vec<u8>);

    /// Hold the core in reset, or release it into its idle state
    fn set_reset(&mut self, reset: bool);

    /// Write a property. Nothing is written to hardware when this fails.
    /// # Errors
    /// Returns an error if the property is unknown to this core or `value` is malformed
    fn set_property(&mut self, prop: PropertyId, value: &[u8]) -> PropertyResult<()>;

    /// Read a property, `params` select the item for indexed properties
    /// # Errors
    /// Returns an error if the property is unknown to this core or `params` are malformed
    fn get_property(&self, prop: PropertyId, params: &[u8]) -> PropertyResult<Vec<u8>>;
}

/// Everything a core constructor gets to know about its node
#[derive(Debug)]
pub struct CoreArgs<'a> {
    pub name: &'a str,
    pub index: u32,
    pub window: RegisterWindow,
    pub fdt: Fdt<'a>,
    pub node: NodeOffset,
    pub dma_buffer: Option<&'a DmaBuffer>,
}

impl CoreArgs<'_> {
    /// Read a mandatory cell property of the node
    /// # Errors
    /// Returns an error if the property is missing or too short
    pub fn required<T: FromCells>(&self, key: &str) -> anyhow::Result<T> {
        self.fdt
            .array_property(self.node, key)
            .ok_or_else(|| anyhow!("Device tree lacks a valid value for {key}"))
    }
}

/// Cores that can be built from a device tree node
pub trait FromNode: Sized {
    /// The `compatible` string of the node
    const COMPATIBLE: &'static str;

    fn from_node(args: CoreArgs<'_>) -> anyhow::Result<Self>;
}

pub type Constructor = fn(CoreArgs<'_>) -> anyhow::Result<Core>;

fn construct<C: FromNode + Into<Core>>(args: CoreArgs<'_>) -> anyhow::Result<Core> {
    C::from_node(args).map(Into::into)
}

macro_rules! cores {
    ($($variant:ident),+ $(,)?) => {
        /// Any of the cores a bitstream may contain
        #[derive(Debug)]
        pub enum Core {
            $($variant($variant),)+
        }

        $(
            impl From<$variant> for Core {
                fn from(core: $variant) -> Self {
                    Core::$variant(core)
                }
            }
        )+

        /// Constructors keyed by `compatible` string
        pub const REGISTRY: &[(&str, Constructor)] = &[
            $(($variant::COMPATIBLE, construct::<$variant>),)+
        ];

        impl HardwareCore for Core {
            fn name(&self) -> &str {
                match self { $(Core::$variant(c) => c.name(),)+ }
            }

            fn kind(&self) -> CoreKind {
                match self { $(Core::$variant(c) => c.kind(),)+ }
            }

            fn index(&self) -> u32 {
                match self { $(Core::$variant(c) => c.index(),)+ }
            }

            fn ports(&self) -> u64 {
                match self { $(Core::$variant(c) => c.ports(),)+ }
            }

            fn announce(&self, out: &mut Vec<u8>) {
                match self { $(Core::$variant(c) => c.announce(out),)+ }
            }

            fn set_reset(&mut self, reset: bool) {
                match self { $(Core::$variant(c) => c.set_reset(reset),)+ }
            }

            fn set_property(&mut self, prop: PropertyId, value: &[u8]) -> PropertyResult<()> {
                match self { $(Core::$variant(c) => c.set_property(prop, value),)+ }
            }

            fn get_property(&self, prop: PropertyId, params: &[u8]) -> PropertyResult<Vec<u8>> {
                match self { $(Core::$variant(c) => c.get_property(prop, params),)+ }
            }
        }
    };
}

cores!(
    AxiDma,
    AxiMdio,
    FrameDetector,
    LatencyMeasurer,
    PrController,
    SimpleTimer,
    StatsCollector,
    TrafficGenerator,
);

/// Build the core registered for `compatible`, or `None` if no core type claims it
#[must_use]
pub fn create_core(compatible: &str, args: CoreArgs<'_>) -> Option<anyhow::Result<Core>> {
    REGISTRY
        .iter()
        .find(|(c, _)| *c == compatible)
        .map(|(_, ctor)| ctor(args))
}

/// Builder for the announce record of a core, `(index u8, kind u8, len u16)` followed by
/// `(property u16, len u16, value)` triples
pub struct Announce<'a> {
    out: &'a mut Vec<u8>,
    len_at: usize,
}

impl<'a> Announce<'a> {
    #[allow(clippy::cast_possible_truncation)]
    pub fn begin(out: &'a mut Vec<u8>, index: u32, kind: CoreKind) -> Self {
        (index as u8).encode(out);
        (kind as u8).encode(out);
        let len_at = out.len();
        0u16.encode(out);
        Self { out, len_at }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn property(&mut self, prop: PropertyId, value: &[u8]) -> &mut Self {
        (prop as u16).encode(self.out);
        (value.len() as u16).encode(self.out);
        value.encode(self.out);
        self
    }

    /// Patch in the payload length
    #[allow(clippy::cast_possible_truncation)]
    pub fn finish(self) {
        let len = (self.out.len() - self.len_at - 2) as u16;
        self.out[self.len_at..self.len_at + 2].copy_from_slice(&len.to_le_bytes());
    }
}

/// Decode an argument of a property value
pub(crate) fn arg<T: Decode>(value: &[u8], offset: usize) -> PropertyResult<T> {
    T::decode(value, offset).ok_or(PropertyError::TooShort {
        needed: offset + T::SIZE,
        got: value.len(),
    })
}

/// A boolean property value, any non-zero first byte is true
pub(crate) fn flag(value: &[u8]) -> PropertyResult<bool> {
    arg::<u8>(value, 0).map(|v| v != 0)
}

/// Encode a single value as a property reading
pub(crate) fn reading<T: Encode + ?Sized>(value: &T) -> PropertyResult<Vec<u8>> {
    let mut out = vec![];
    value.encode(&mut out);
    Ok(out)
}
