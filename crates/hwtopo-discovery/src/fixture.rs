//! JSON fixtures standing in for a vendor runtime and for PCI discovery
//!
//! In an enumeration fixture a `null` entry makes the matching query fail,
//! while a missing entry means an empty successful answer (a missing `pci`
//! entry fails, since every real device has an address).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

use hwtopo_core::object::{BridgeAttr, BridgeUpstream, PciBusRange};
use hwtopo_core::{
    Backend, BackendError, DiscoveryPhase, DiscoveryStatus, ObjectAttr, ObjectId, ObjectType,
    PciBusId, PciDevAttr, Topology, TypeFilter,
};

use crate::enumerate::{
    DeviceEnumerator, DeviceProperties, EnumError, EnumResult, MemoryProperties, PciAddress,
    PciProperties, PortProperties, PortState, PortStateReading, QueueGroup,
};

fn present<T: Default>() -> Option<T> {
    Some(T::default())
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PortFixture {
    #[serde(default = "present")]
    pub properties: Option<PortProperties>,
    #[serde(default)]
    pub state: PortState,
    /// Error reported together with the state
    #[serde(default)]
    pub state_error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceFixture {
    #[serde(default = "present")]
    pub properties: Option<DeviceProperties>,
    #[serde(default = "present")]
    pub subdevices: Option<Vec<DeviceFixture>>,
    #[serde(default = "present")]
    pub queue_groups: Option<Vec<QueueGroup>>,
    #[serde(default = "present")]
    pub memory: Option<Vec<Option<MemoryProperties>>>,
    #[serde(default = "present")]
    pub ports: Option<Vec<PortFixture>>,
    #[serde(default)]
    pub pci: Option<PciProperties>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriverFixture {
    #[serde(default = "present")]
    pub devices: Option<Vec<DeviceFixture>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnumerationFixture {
    /// Makes runtime initialization fail when set
    #[serde(default)]
    pub init_error: Option<String>,
    #[serde(default = "present")]
    pub drivers: Option<Vec<DriverFixture>>,
}

/// Device handle: driver and device index, plus sub-device index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixtureDevice {
    pub driver: usize,
    pub device: usize,
    pub sub: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixtureItem {
    pub device: FixtureDevice,
    pub index: usize,
}

/// Enumeration capability backed by an [`EnumerationFixture`]
#[derive(Debug, Clone)]
pub struct FixtureEnumerator {
    fixture: EnumerationFixture,
    initialized: bool,
}

fn failed(call: &'static str) -> EnumError {
    EnumError::query(call, "not available")
}

impl FixtureEnumerator {
    pub fn new(fixture: EnumerationFixture) -> Self {
        Self {
            fixture,
            initialized: false,
        }
    }

    pub fn from_json(content: &str) -> serde_json::Result<Self> {
        Ok(Self::new(serde_json::from_str(content)?))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture {}", path.display()))?;
        let enumerator = Self::from_json(&content)
            .with_context(|| format!("Failed to parse fixture {}", path.display()))?;
        debug!(path = %path.display(), "Loaded enumeration fixture");
        Ok(enumerator)
    }

    fn device(&self, handle: &FixtureDevice) -> EnumResult<&DeviceFixture> {
        let devices = self
            .fixture
            .drivers
            .as_ref()
            .and_then(|drivers| drivers.get(handle.driver))
            .and_then(|driver| driver.devices.as_ref())
            .ok_or_else(|| failed("device lookup"))?;
        let device = devices
            .get(handle.device)
            .ok_or_else(|| failed("device lookup"))?;
        match handle.sub {
            None => Ok(device),
            Some(k) => device
                .subdevices
                .as_ref()
                .and_then(|subs| subs.get(k))
                .ok_or_else(|| failed("sub-device lookup")),
        }
    }

    fn port(&self, handle: &FixtureItem) -> EnumResult<&PortFixture> {
        self.device(&handle.device)?
            .ports
            .as_ref()
            .and_then(|ports| ports.get(handle.index))
            .ok_or_else(|| failed("port lookup"))
    }
}

impl DeviceEnumerator for FixtureEnumerator {
    type Driver = usize;
    type Device = FixtureDevice;
    type MemoryModule = FixtureItem;
    type Port = FixtureItem;

    fn init(&mut self) -> EnumResult<()> {
        if let Some(reason) = &self.fixture.init_error {
            return Err(EnumError::Init(reason.clone()));
        }
        self.initialized = true;
        Ok(())
    }

    fn drivers(&self) -> EnumResult<Vec<usize>> {
        if !self.initialized {
            return Err(EnumError::query("drivers", "runtime not initialized"));
        }
        let drivers = self.fixture.drivers.as_ref().ok_or_else(|| failed("drivers"))?;
        Ok((0..drivers.len()).collect())
    }

    fn devices(&self, driver: &usize) -> EnumResult<Vec<FixtureDevice>> {
        let devices = self
            .fixture
            .drivers
            .as_ref()
            .and_then(|drivers| drivers.get(*driver))
            .and_then(|d| d.devices.as_ref())
            .ok_or_else(|| failed("devices"))?;
        Ok((0..devices.len())
            .map(|device| FixtureDevice {
                driver: *driver,
                device,
                sub: None,
            })
            .collect())
    }

    fn subdevices(&self, device: &FixtureDevice) -> EnumResult<Vec<FixtureDevice>> {
        let subs = self
            .device(device)?
            .subdevices
            .as_ref()
            .ok_or_else(|| failed("subdevices"))?;
        Ok((0..subs.len())
            .map(|k| FixtureDevice {
                sub: Some(k),
                ..*device
            })
            .collect())
    }

    fn properties(&self, device: &FixtureDevice) -> EnumResult<DeviceProperties> {
        self.device(device)?
            .properties
            .clone()
            .ok_or_else(|| failed("device properties"))
    }

    fn queue_groups(&self, device: &FixtureDevice) -> EnumResult<Vec<QueueGroup>> {
        self.device(device)?
            .queue_groups
            .clone()
            .ok_or_else(|| failed("queue groups"))
    }

    fn memory_modules(&self, device: &FixtureDevice) -> EnumResult<Vec<FixtureItem>> {
        let modules = self
            .device(device)?
            .memory
            .as_ref()
            .ok_or_else(|| failed("memory modules"))?;
        Ok((0..modules.len())
            .map(|index| FixtureItem {
                device: *device,
                index,
            })
            .collect())
    }

    fn memory_properties(&self, module: &FixtureItem) -> EnumResult<MemoryProperties> {
        self.device(&module.device)?
            .memory
            .as_ref()
            .and_then(|modules| modules.get(module.index))
            .copied()
            .flatten()
            .ok_or_else(|| failed("memory properties"))
    }

    fn fabric_ports(&self, device: &FixtureDevice) -> EnumResult<Vec<FixtureItem>> {
        let ports = self
            .device(device)?
            .ports
            .as_ref()
            .ok_or_else(|| failed("fabric ports"))?;
        Ok((0..ports.len())
            .map(|index| FixtureItem {
                device: *device,
                index,
            })
            .collect())
    }

    fn port_properties(&self, port: &FixtureItem) -> EnumResult<PortProperties> {
        self.port(port)?
            .properties
            .clone()
            .ok_or_else(|| failed("port properties"))
    }

    fn port_state(&self, port: &FixtureItem) -> PortStateReading {
        match self.port(port) {
            Ok(fixture) => PortStateReading {
                state: fixture.state,
                result: match &fixture.state_error {
                    Some(reason) => Err(EnumError::query("port state", reason.clone())),
                    None => Ok(()),
                },
            },
            Err(e) => PortStateReading {
                state: PortState::default(),
                result: Err(e),
            },
        }
    }

    fn pci_properties(&self, device: &FixtureDevice) -> EnumResult<PciProperties> {
        self.device(device)?.pci.ok_or_else(|| failed("PCI properties"))
    }
}

/// One node of a PCI fixture tree
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PciNode {
    HostBridge {
        #[serde(default)]
        domain: u32,
        secondary_bus: u8,
        subordinate_bus: u8,
        #[serde(default)]
        children: Vec<PciNode>,
    },
    Bridge {
        address: PciAddress,
        secondary_bus: u8,
        subordinate_bus: u8,
        #[serde(default)]
        vendor_id: u16,
        #[serde(default)]
        device_id: u16,
        #[serde(default)]
        children: Vec<PciNode>,
    },
    Device {
        address: PciAddress,
        #[serde(default)]
        class_id: u16,
        #[serde(default)]
        vendor_id: u16,
        #[serde(default)]
        device_id: u16,
        #[serde(default)]
        subvendor_id: u16,
        #[serde(default)]
        subdevice_id: u16,
        #[serde(default)]
        revision: u8,
        #[serde(default)]
        children: Vec<PciNode>,
    },
}

fn busid(address: &PciAddress) -> PciBusId {
    PciBusId::new(address.domain, address.bus, address.device, address.function)
}

/// PCI-phase backend inserting a fixed bridge/device tree
#[derive(Debug, Clone, Default)]
pub struct PciFixtureBackend {
    roots: Vec<PciNode>,
}

impl PciFixtureBackend {
    pub fn new(roots: Vec<PciNode>) -> Self {
        Self { roots }
    }

    pub fn from_json(content: &str) -> serde_json::Result<Self> {
        Ok(Self::new(serde_json::from_str(content)?))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read PCI fixture {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse PCI fixture {}", path.display()))
    }

    /// Whether the PCI device filter keeps a device node
    fn keeps_device(topology: &Topology, node: &PciNode) -> bool {
        let PciNode::Device {
            class_id, children, ..
        } = node
        else {
            return true;
        };
        match topology.type_filter(ObjectType::PciDevice) {
            TypeFilter::KeepAll => true,
            TypeFilter::KeepNone => false,
            TypeFilter::KeepStructure => !children.is_empty(),
            TypeFilter::KeepImportant => PciDevAttr::is_important_class(*class_id),
        }
    }

    fn has_kept_device(topology: &Topology, node: &PciNode) -> bool {
        match node {
            PciNode::Device { .. } => Self::keeps_device(topology, node),
            PciNode::HostBridge { children, .. } | PciNode::Bridge { children, .. } => children
                .iter()
                .any(|child| Self::has_kept_device(topology, child)),
        }
    }

    fn insert(
        topology: &mut Topology,
        parent: ObjectId,
        node: &PciNode,
        depth: u32,
    ) -> Result<(), BackendError> {
        match node {
            PciNode::Device { .. } if !Self::keeps_device(topology, node) => return Ok(()),
            PciNode::HostBridge { children, .. } | PciNode::Bridge { children, .. } => {
                match topology.type_filter(ObjectType::Bridge) {
                    // devices attach to the nearest kept ancestor
                    TypeFilter::KeepNone => {
                        for child in children {
                            Self::insert(topology, parent, child, depth)?;
                        }
                        return Ok(());
                    }
                    TypeFilter::KeepStructure | TypeFilter::KeepImportant
                        if !Self::has_kept_device(topology, node) =>
                    {
                        return Ok(());
                    }
                    _ => {}
                }
            }
            PciNode::Device { .. } => {}
        }

        let (attr, object_type, children) = match node {
            PciNode::HostBridge {
                domain,
                secondary_bus,
                subordinate_bus,
                children,
            } => (
                ObjectAttr::Bridge(BridgeAttr {
                    upstream: BridgeUpstream::Host,
                    downstream: PciBusRange {
                        domain: *domain,
                        secondary_bus: *secondary_bus,
                        subordinate_bus: *subordinate_bus,
                    },
                    depth,
                }),
                ObjectType::Bridge,
                children,
            ),
            PciNode::Bridge {
                address,
                secondary_bus,
                subordinate_bus,
                vendor_id,
                device_id,
                children,
            } => (
                ObjectAttr::Bridge(BridgeAttr {
                    upstream: BridgeUpstream::Pci(PciDevAttr {
                        busid: busid(address),
                        class_id: 0x0604,
                        vendor_id: *vendor_id,
                        device_id: *device_id,
                        ..Default::default()
                    }),
                    downstream: PciBusRange {
                        domain: address.domain,
                        secondary_bus: *secondary_bus,
                        subordinate_bus: *subordinate_bus,
                    },
                    depth,
                }),
                ObjectType::Bridge,
                children,
            ),
            PciNode::Device {
                address,
                class_id,
                vendor_id,
                device_id,
                subvendor_id,
                subdevice_id,
                revision,
                children,
            } => (
                ObjectAttr::PciDev(PciDevAttr {
                    busid: busid(address),
                    class_id: *class_id,
                    vendor_id: *vendor_id,
                    device_id: *device_id,
                    subvendor_id: *subvendor_id,
                    subdevice_id: *subdevice_id,
                    revision: *revision,
                    linkspeed: 0.0,
                }),
                ObjectType::PciDevice,
                children,
            ),
        };

        let obj = topology.alloc_object(object_type, None).with_attr(attr);
        let id = topology.insert_by_parent(parent, obj)?;
        let child_depth = if object_type == ObjectType::Bridge {
            depth + 1
        } else {
            depth
        };
        for child in children {
            Self::insert(topology, id, child, child_depth)?;
        }
        Ok(())
    }
}

impl Backend for PciFixtureBackend {
    fn name(&self) -> &str {
        "pci"
    }

    fn phase(&self) -> DiscoveryPhase {
        DiscoveryPhase::Pci
    }

    fn contributes(&self) -> Option<ObjectType> {
        Some(ObjectType::PciDevice)
    }

    fn discover(
        &mut self,
        topology: &mut Topology,
        _status: &DiscoveryStatus,
    ) -> Result<(), BackendError> {
        let root = topology.root();
        for node in &self.roots {
            Self::insert(topology, root, node, 0)?;
        }
        debug!(
            devices = topology.pci_devices().len(),
            bridges = topology.bridges().len(),
            "Inserted PCI fixture tree"
        );
        Ok(())
    }
}
