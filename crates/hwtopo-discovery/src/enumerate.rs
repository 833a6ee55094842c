//! Enumeration capability consumed by device-class backends
//!
//! A vendor runtime exposes drivers, devices below each driver and
//! sub-devices below each device. Every query is independently fallible so
//! a backend can skip one item and keep going.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Placeholder runtimes report for properties they do not know
pub const UNKNOWN: &str = "Unknown";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnumError {
    /// The runtime is missing or refused to start
    #[error("Runtime initialization failed: {0}")]
    Init(String),
    /// One query failed, naming the runtime call
    #[error("{call} failed: {reason}")]
    Query { call: &'static str, reason: String },
}

impl EnumError {
    pub fn query(call: &'static str, reason: impl Into<String>) -> Self {
        EnumError::Query {
            call,
            reason: reason.into(),
        }
    }
}

pub type EnumResult<T> = Result<T, EnumError>;

/// Descriptive strings and sub-device count of one device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProperties {
    /// Vendor name, e.g. "Intel(R) Corporation"
    pub vendor_name: String,
    /// Marketing model name
    pub model_name: String,
    pub brand_name: String,
    pub serial_number: String,
    /// Board part number
    pub board_number: String,
    /// Number of sub-devices (tiles) the device declares
    pub num_subdevices: u32,
}

/// Value of a property, or `None` for the runtime's "unknown" placeholder
pub fn known(value: &str) -> Option<&str> {
    if value == UNKNOWN {
        None
    } else {
        Some(value)
    }
}

/// A command queue group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueGroup {
    /// Queues available in the group
    pub num_queues: u32,
    /// Capability flags as reported by the runtime
    pub flags: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Hbm,
    Ddr,
    Ddr3,
    Ddr4,
    Ddr5,
    Lpddr,
    Lpddr3,
    Lpddr4,
    Lpddr5,
    Sram,
    L1,
    L3,
    Grf,
    Slm,
    Gddr4,
    Gddr5,
    Gddr5x,
    Gddr6,
    Gddr6x,
    Gddr7,
}

/// Coarse memory family used for size reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryFamily {
    /// High-bandwidth memory
    Hbm,
    /// Conventional DRAM
    Dram,
}

impl MemoryFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryFamily::Hbm => "HBM",
            MemoryFamily::Dram => "DRAM",
        }
    }
}

impl MemoryType {
    /// Family this type is reported under, `None` for ignored types
    pub fn family(self) -> Option<MemoryFamily> {
        match self {
            MemoryType::Hbm => Some(MemoryFamily::Hbm),
            MemoryType::Ddr
            | MemoryType::Ddr3
            | MemoryType::Ddr4
            | MemoryType::Ddr5
            | MemoryType::Lpddr
            | MemoryType::Lpddr3
            | MemoryType::Lpddr4
            | MemoryType::Lpddr5 => Some(MemoryFamily::Dram),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryProperties {
    pub memory_type: MemoryType,
    /// Whether the module belongs to one sub-device rather than the device
    #[serde(default)]
    pub on_subdevice: bool,
    /// Owning sub-device, meaningful only when `on_subdevice` is set
    #[serde(default)]
    pub subdevice_id: u32,
    /// Size in bytes
    pub physical_size: u64,
}

/// PCI location of a device as reported by the runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciAddress {
    pub domain: u32,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

/// PCI properties of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciProperties {
    /// Address used to find the device's PCI parent
    pub address: PciAddress,
    /// Maximum link bandwidth in bytes/s, negative when unknown
    #[serde(default = "unknown_bandwidth")]
    pub max_bandwidth: i64,
}

fn unknown_bandwidth() -> i64 {
    -1
}

/// Identifier of one fabric port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FabricPortId {
    /// Fabric identifier of the device or sub-device
    pub fabric_id: u32,
    /// Attachment point within the device
    pub attach_id: u32,
    /// Port number on the attachment point
    pub port_number: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortStatus {
    #[default]
    Unknown,
    /// Link up and usable
    Healthy,
    /// Link up with reduced quality
    Degraded,
    Failed,
    /// Port turned off by configuration
    Disabled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSpeed {
    /// Bits per second, negative when unknown
    pub bit_rate: i64,
    /// Lane count, negative when unknown
    pub width: i32,
}

/// Static properties of a fabric port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortProperties {
    /// Link model, e.g. "XeLink"
    pub model: String,
    /// Whether the port belongs to one sub-device rather than the device
    #[serde(default)]
    pub on_subdevice: bool,
    /// Owning sub-device, meaningful only when `on_subdevice` is set
    #[serde(default)]
    pub subdevice_id: u32,
    /// Identifier remote ports use to refer to this one
    pub port_id: FabricPortId,
}

/// Dynamic state of a fabric port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortState {
    /// Link health
    pub status: PortStatus,
    /// Port at the other end of the link
    pub remote_port_id: FabricPortId,
    /// Receive speed, the one counted as link bandwidth
    pub rx_speed: LinkSpeed,
    /// Transmit speed
    pub tx_speed: LinkSpeed,
}

/// Result of a port state query.
///
/// Some runtimes report an error together with a usable state, so the state
/// is always returned alongside the query result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortStateReading {
    pub state: PortState,
    /// Outcome of the query that produced `state`
    pub result: EnumResult<()>,
}

/// Enumeration capability of a vendor runtime
pub trait DeviceEnumerator {
    type Driver;
    type Device;
    type MemoryModule;
    type Port;

    /// Prepare the runtime, failing when it is unavailable
    fn init(&mut self) -> EnumResult<()>;

    fn drivers(&self) -> EnumResult<Vec<Self::Driver>>;

    fn devices(&self, driver: &Self::Driver) -> EnumResult<Vec<Self::Device>>;

    fn subdevices(&self, device: &Self::Device) -> EnumResult<Vec<Self::Device>>;

    fn properties(&self, device: &Self::Device) -> EnumResult<DeviceProperties>;

    fn queue_groups(&self, device: &Self::Device) -> EnumResult<Vec<QueueGroup>>;

    fn memory_modules(&self, device: &Self::Device) -> EnumResult<Vec<Self::MemoryModule>>;

    fn memory_properties(&self, module: &Self::MemoryModule) -> EnumResult<MemoryProperties>;

    fn fabric_ports(&self, device: &Self::Device) -> EnumResult<Vec<Self::Port>>;

    fn port_properties(&self, port: &Self::Port) -> EnumResult<PortProperties>;

    fn port_state(&self, port: &Self::Port) -> PortStateReading;

    fn pci_properties(&self, device: &Self::Device) -> EnumResult<PciProperties>;
}
