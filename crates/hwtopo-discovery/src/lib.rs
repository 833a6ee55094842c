//! hwtopo Discovery - Device enumeration backends
//!
//! This crate provides the enumeration-to-tree pipeline used by device-class
//! backends:
//! - An enumeration capability trait over drivers, devices and sub-devices
//! - A coprocessor backend folding devices, memory and fabric links into the tree
//! - Fabric connectivity resolution into a bandwidth matrix
//! - JSON fixtures standing in for a vendor runtime and for PCI discovery

pub mod coproc;
pub mod enumerate;
pub mod fabric;
pub mod fixture;

pub use coproc::{CoprocBackend, CoprocError, CoprocProfile};
pub use enumerate::{DeviceEnumerator, EnumError, EnumResult};
pub use fabric::{FabricError, PortRecord, PortRegistry};
pub use fixture::{FixtureEnumerator, PciFixtureBackend};
