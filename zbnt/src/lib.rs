//! # ZBNT
//!
//! Device management for ZBNT FPGA network testers: loading bitstreams, discovering the hardware
//! cores they contain, and streaming measurements out of the DMA ring buffer to a client.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod codec;
pub mod cores;
pub mod device;
pub mod dma_buffer;
pub mod error;
pub mod logging;
pub mod messages;
pub mod mmio;
pub mod prelude;
pub mod server;
pub mod session;
pub mod settings;

pub use error::{
    Error,
    Result,
};
