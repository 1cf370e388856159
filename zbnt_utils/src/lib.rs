//! # ZBNT Utilities
//!
//! Hardware description parsing and firmware discovery for the ZBNT network tester daemon.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod fdt;
pub mod firmware;
