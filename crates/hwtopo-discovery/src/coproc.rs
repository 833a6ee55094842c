//! Coprocessor discovery backend
//!
//! Walks drivers, devices and sub-devices of a vendor runtime and adds one
//! coprocessor OS device per device (and per sub-device) below its PCI
//! ancestor. Memory sizes, command queue groups and fabric links are
//! collected along the way.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use hwtopo_core::{
    Backend, BackendError, DiscoveryPhase, DiscoveryStatus, Object, ObjectAttr, ObjectId,
    ObjectType, OsDevKind, PhaseSet, Registry, Topology, TopologyError, TypeFilter,
};

use crate::enumerate::{known, DeviceEnumerator, EnumError, MemoryFamily};
use crate::fabric::{self, PortRecord, PortRegistry};

/// Runs after PCI discovery within the I/O phase
pub const COPROC_PRIORITY: i32 = 10;

/// Names written by a coprocessor backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoprocProfile {
    /// Backend name used for configuration and reports
    pub backend_name: String,
    /// Subtype, `Backend` info value and prefix of every other info key
    pub info_prefix: String,
    /// Device names are this prefix followed by a running index
    pub name_prefix: String,
    /// Only fabric links of this model are counted
    pub link_model: String,
    pub matrix_name: String,
    /// Diagonal of the bandwidth matrix, in MB/s
    pub local_bandwidth: u64,
}

impl Default for CoprocProfile {
    fn default() -> Self {
        Self {
            backend_name: "levelzero".to_string(),
            info_prefix: "LevelZero".to_string(),
            name_prefix: "ze".to_string(),
            link_model: "XeLink".to_string(),
            matrix_name: "XeLinkBandwidth".to_string(),
            // roughly the speed of on-package HBM
            local_bandwidth: 1_000_000,
        }
    }
}

impl CoprocProfile {
    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.info_prefix, suffix)
    }
}

#[derive(Error, Debug)]
pub enum CoprocError {
    /// Runtime unavailable, the backend contributes nothing
    #[error("Failed to initialize runtime: {0}")]
    Init(EnumError),
    /// Driver listing failed, the backend contributes nothing
    #[error("Failed to list drivers: {0}")]
    Drivers(EnumError),
    /// One driver skipped
    #[error("Failed to list devices of driver #{driver}: {source}")]
    Devices { driver: usize, source: EnumError },
    /// One device skipped, without consuming a device index
    #[error("Failed to get properties of device #{device} of driver #{driver}: {source}")]
    Properties {
        driver: usize,
        device: usize,
        source: EnumError,
    },
    /// Device kept without sub-devices
    #[error("Failed to list sub-devices of {name}: {source}")]
    SubDevices { name: String, source: EnumError },
    /// Memory module naming a sub-device the device does not have
    #[error("Ignoring memory of {name} on unexpected sub-device #{subdevice}")]
    UnexpectedSubdevice { name: String, subdevice: u32 },
    /// Connectivity abandoned, the devices stay
    #[error("Failed to resolve fabric links: {0}")]
    Fabric(#[from] fabric::FabricError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// Discovery backend for coprocessors exposed through a [`DeviceEnumerator`]
pub struct CoprocBackend<E> {
    enumerator: E,
    profile: CoprocProfile,
}

/// Per-pass scratch state
struct Pass {
    hide_errors: bool,
    next_index: u32,
    participants: Registry<ObjectId>,
    ports: PortRegistry,
}

fn report(hide_errors: bool, error: &CoprocError) {
    if hide_errors {
        debug!(error = %error, "Coprocessor discovery diagnostic");
    } else {
        warn!(error = %error, "Coprocessor discovery diagnostic");
    }
}

impl Pass {
    fn report(&self, error: &CoprocError) {
        report(self.hide_errors, error);
    }

    fn register(&mut self, id: ObjectId) {
        if let Err(e) = self.participants.push(id) {
            debug!(object = %id, error = %e, "Object left out of fabric participants");
        }
    }
}

impl<E: DeviceEnumerator> CoprocBackend<E> {
    pub fn new(enumerator: E) -> Self {
        Self::with_profile(enumerator, CoprocProfile::default())
    }

    pub fn with_profile(enumerator: E, profile: CoprocProfile) -> Self {
        Self {
            enumerator,
            profile,
        }
    }

    pub fn profile(&self) -> &CoprocProfile {
        &self.profile
    }

    fn new_osdev(&self, topology: &mut Topology, name: String) -> Object {
        let mut osdev = topology
            .alloc_object(ObjectType::OsDevice, None)
            .with_name(name)
            .with_attr(ObjectAttr::OsDev {
                kind: OsDevKind::Coproc,
            });
        osdev.subtype = Some(self.profile.info_prefix.clone());
        osdev.add_info("Backend", self.profile.info_prefix.as_str());
        osdev
    }

    fn collect_queue_groups(&self, device: &E::Device, osdev: &mut Object) {
        let groups = match self.enumerator.queue_groups(device) {
            Ok(groups) if !groups.is_empty() => groups,
            Ok(_) => return,
            Err(e) => {
                debug!(device = ?osdev.name, error = %e, "No command queue groups");
                return;
            }
        };
        osdev.add_info(self.profile.key("CQGroups"), groups.len().to_string());
        for (k, group) in groups.iter().enumerate() {
            osdev.add_info(
                self.profile.key(&format!("CQGroup{}", k)),
                format!("{}*0x{:x}", group.num_queues, group.flags),
            );
        }
    }

    /// Attach memory sizes in kB: per module on sub-devices right away, and
    /// per family totals on the root device once every module was seen.
    fn collect_memory(&self, pass: &Pass, device: &E::Device, root: &mut Object, subs: &mut [Object]) {
        let modules = match self.enumerator.memory_modules(device) {
            Ok(modules) => modules,
            Err(e) => {
                debug!(device = ?root.name, error = %e, "No memory modules");
                return;
            }
        };

        let mut hbm_kb = 0u64;
        let mut dram_kb = 0u64;
        for module in &modules {
            let props = match self.enumerator.memory_properties(module) {
                Ok(props) => props,
                Err(e) => {
                    debug!(device = ?root.name, error = %e, "Skipping memory module");
                    continue;
                }
            };
            let size_kb = props.physical_size >> 10;

            let family = props.memory_type.family();
            match family {
                Some(MemoryFamily::Hbm) => hbm_kb += size_kb,
                Some(MemoryFamily::Dram) => dram_kb += size_kb,
                None => {}
            }

            if !props.on_subdevice {
                continue;
            }
            let Some(sub) = subs.get_mut(props.subdevice_id as usize) else {
                pass.report(&CoprocError::UnexpectedSubdevice {
                    name: root.name.clone().unwrap_or_default(),
                    subdevice: props.subdevice_id,
                });
                continue;
            };
            if let Some(family) = family {
                if props.physical_size != 0 {
                    sub.add_info(
                        self.profile.key(&format!("{}Size", family.as_str())),
                        size_kb.to_string(),
                    );
                }
            }
        }

        if hbm_kb != 0 {
            root.add_info(self.profile.key("HBMSize"), hbm_kb.to_string());
        }
        if dram_kb != 0 {
            root.add_info(self.profile.key("DRAMSize"), dram_kb.to_string());
        }
    }

    fn collect_ports(&self, pass: &mut Pass, device: &E::Device, root: &Object, subs: &[Object]) {
        let handles = match self.enumerator.fabric_ports(device) {
            Ok(handles) if !handles.is_empty() => handles,
            Ok(_) => return,
            Err(e) => {
                debug!(device = ?root.name, error = %e, "No fabric ports");
                return;
            }
        };
        if !pass.ports.reserve(handles.len()) {
            return;
        }

        for handle in &handles {
            let properties = match self.enumerator.port_properties(handle) {
                Ok(properties) => properties,
                Err(e) => {
                    debug!(device = ?root.name, error = %e, "Skipping fabric port");
                    continue;
                }
            };
            let reading = self.enumerator.port_state(handle);
            if let Err(e) = &reading.result {
                // the state may still be meaningful, keep it
                debug!(device = ?root.name, error = %e, "Port state query reported an error");
            }
            let owner = if properties.on_subdevice {
                match subs.get(properties.subdevice_id as usize) {
                    Some(sub) => sub.gp_index(),
                    None => continue,
                }
            } else {
                root.gp_index()
            };
            pass.ports.push(PortRecord {
                owner,
                properties,
                state: reading.state,
            });
        }
    }

    fn add_device(
        &self,
        topology: &mut Topology,
        pass: &mut Pass,
        driver_index: usize,
        device_index: usize,
        device: &E::Device,
    ) -> Result<ObjectId, CoprocError> {
        let props = self
            .enumerator
            .properties(device)
            .map_err(|source| CoprocError::Properties {
                driver: driver_index,
                device: device_index,
                source,
            })?;

        let index = pass.next_index;
        let name = format!("{}{}", self.profile.name_prefix, index);
        let mut osdev = self.new_osdev(topology, name.clone());
        osdev.add_info(self.profile.key("DriverIndex"), driver_index.to_string());
        osdev.add_info(self.profile.key("DriverDeviceIndex"), device_index.to_string());
        if let Some(vendor) = known(&props.vendor_name) {
            osdev.add_info(self.profile.key("Vendor"), vendor);
        }
        // usually just the PCI device id
        if let Some(model) = known(&props.model_name) {
            osdev.add_info(self.profile.key("Model"), model);
        }
        if let Some(brand) = known(&props.brand_name) {
            osdev.add_info(self.profile.key("Brand"), brand);
        }
        if let Some(serial) = known(&props.serial_number) {
            osdev.add_info(self.profile.key("SerialNumber"), serial);
        }
        if let Some(board) = known(&props.board_number) {
            osdev.add_info(self.profile.key("BoardNumber"), board);
        }
        self.collect_queue_groups(device, &mut osdev);

        let mut subs = Vec::new();
        if props.num_subdevices > 0 {
            match self.enumerator.subdevices(device) {
                Ok(handles) => {
                    for (k, handle) in handles
                        .iter()
                        .take(props.num_subdevices as usize)
                        .enumerate()
                    {
                        let mut sub = self.new_osdev(topology, format!("{}.{}", name, k));
                        self.collect_queue_groups(handle, &mut sub);
                        subs.push(sub);
                    }
                }
                Err(source) => pass.report(&CoprocError::SubDevices {
                    name: name.clone(),
                    source,
                }),
            }
        }

        self.collect_memory(pass, device, &mut osdev, &mut subs);
        self.collect_ports(pass, device, &osdev, &subs);

        let mut parent = None;
        match self.enumerator.pci_properties(device) {
            Ok(pci) => {
                let addr = pci.address;
                parent = topology.find_parent_by_bus_address(
                    addr.domain,
                    addr.bus,
                    addr.device,
                    addr.function,
                );
                if let Some(attr) = parent
                    .and_then(|id| topology.get_mut(id))
                    .filter(|obj| obj.object_type == ObjectType::PciDevice)
                    .and_then(|obj| obj.pci_attr_mut())
                {
                    if pci.max_bandwidth > 0 {
                        attr.linkspeed = pci.max_bandwidth as f32 / 1e9;
                    }
                }
            }
            Err(e) => debug!(device = %name, error = %e, "No PCI properties"),
        }
        let parent = parent.unwrap_or_else(|| topology.root());

        let device_id = topology.insert_by_parent(parent, osdev)?;
        pass.register(device_id);
        for sub in subs {
            let sub_id = topology.insert_by_parent(device_id, sub)?;
            pass.register(sub_id);
        }
        pass.next_index += 1;

        debug!(device = %name, parent = %parent, "Added coprocessor");
        Ok(device_id)
    }
}

impl<E: DeviceEnumerator> Backend for CoprocBackend<E> {
    fn name(&self) -> &str {
        &self.profile.backend_name
    }

    fn phase(&self) -> DiscoveryPhase {
        DiscoveryPhase::Io
    }

    fn priority(&self) -> i32 {
        COPROC_PRIORITY
    }

    fn excludes(&self) -> PhaseSet {
        PhaseSet::GLOBAL
    }

    fn contributes(&self) -> Option<ObjectType> {
        Some(ObjectType::OsDevice)
    }

    fn discover(
        &mut self,
        topology: &mut Topology,
        _status: &DiscoveryStatus,
    ) -> Result<(), BackendError> {
        if topology.type_filter(ObjectType::OsDevice) == TypeFilter::KeepNone {
            return Ok(());
        }

        let mut pass = Pass {
            hide_errors: topology.hide_errors(),
            next_index: 0,
            participants: Registry::new(),
            ports: PortRegistry::new(),
        };

        if let Err(e) = self.enumerator.init() {
            pass.report(&CoprocError::Init(e));
            return Ok(());
        }
        let drivers = match self.enumerator.drivers() {
            Ok(drivers) => drivers,
            Err(e) => {
                pass.report(&CoprocError::Drivers(e));
                return Ok(());
            }
        };

        for (driver_index, driver) in drivers.iter().enumerate() {
            let devices = match self.enumerator.devices(driver) {
                Ok(devices) => devices,
                Err(source) => {
                    pass.report(&CoprocError::Devices {
                        driver: driver_index,
                        source,
                    });
                    continue;
                }
            };
            for (device_index, device) in devices.iter().enumerate() {
                if let Err(e) =
                    self.add_device(topology, &mut pass, driver_index, device_index, device)
                {
                    pass.report(&e);
                }
            }
        }

        let Pass {
            next_index,
            participants,
            ports,
            hide_errors,
        } = pass;
        let port_count = ports.len();
        match fabric::connect(
            topology,
            &self.profile.matrix_name,
            &self.profile.link_model,
            self.profile.local_bandwidth,
            participants,
            ports,
        ) {
            Ok(Some(id)) => debug!(matrix = ?id, ports = port_count, "Committed fabric bandwidth"),
            Ok(None) => {}
            Err(e) => report(hide_errors, &CoprocError::Fabric(e)),
        }

        info!(
            backend = %self.profile.backend_name,
            devices = next_index,
            ports = port_count,
            "Coprocessor discovery complete"
        );
        Ok(())
    }
}
