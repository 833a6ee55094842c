//! Topology objects: types, typed attributes, info pairs and userdata

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Handle of an object linked into a topology.
///
/// Handles are assigned when an object is inserted and stay valid for the
/// lifetime of the topology, objects are never removed individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub usize);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of hardware or software entity an object represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Machine,
    Package,
    Die,
    Core,
    Pu,
    NumaNode,
    L1Cache,
    L2Cache,
    L3Cache,
    L4Cache,
    L5Cache,
    L1iCache,
    L2iCache,
    L3iCache,
    Group,
    MemCache,
    Bridge,
    PciDevice,
    OsDevice,
    Misc,
}

/// Which of its parent's four child lists an object is linked into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildKind {
    /// Processor hierarchy
    Normal,
    /// NUMA-like memory attached below a compute object
    Memory,
    /// PCI devices, bridges and OS devices
    Io,
    /// Anything else
    Misc,
}

impl ObjectType {
    pub const ALL: [ObjectType; 20] = [
        ObjectType::Machine,
        ObjectType::Package,
        ObjectType::Die,
        ObjectType::Core,
        ObjectType::Pu,
        ObjectType::NumaNode,
        ObjectType::L1Cache,
        ObjectType::L2Cache,
        ObjectType::L3Cache,
        ObjectType::L4Cache,
        ObjectType::L5Cache,
        ObjectType::L1iCache,
        ObjectType::L2iCache,
        ObjectType::L3iCache,
        ObjectType::Group,
        ObjectType::MemCache,
        ObjectType::Bridge,
        ObjectType::PciDevice,
        ObjectType::OsDevice,
        ObjectType::Misc,
    ];

    /// Child list this type is linked into below its parent
    pub fn child_kind(self) -> ChildKind {
        match self {
            ObjectType::NumaNode | ObjectType::MemCache => ChildKind::Memory,
            ObjectType::Bridge | ObjectType::PciDevice | ObjectType::OsDevice => ChildKind::Io,
            ObjectType::Misc => ChildKind::Misc,
            _ => ChildKind::Normal,
        }
    }

    pub fn is_io(self) -> bool {
        self.child_kind() == ChildKind::Io
    }

    pub fn is_memory(self) -> bool {
        self.child_kind() == ChildKind::Memory
    }

    pub fn is_cache(self) -> bool {
        matches!(
            self,
            ObjectType::L1Cache
                | ObjectType::L2Cache
                | ObjectType::L3Cache
                | ObjectType::L4Cache
                | ObjectType::L5Cache
                | ObjectType::L1iCache
                | ObjectType::L2iCache
                | ObjectType::L3iCache
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectType::Machine => "Machine",
            ObjectType::Package => "Package",
            ObjectType::Die => "Die",
            ObjectType::Core => "Core",
            ObjectType::Pu => "PU",
            ObjectType::NumaNode => "NUMANode",
            ObjectType::L1Cache => "L1Cache",
            ObjectType::L2Cache => "L2Cache",
            ObjectType::L3Cache => "L3Cache",
            ObjectType::L4Cache => "L4Cache",
            ObjectType::L5Cache => "L5Cache",
            ObjectType::L1iCache => "L1iCache",
            ObjectType::L2iCache => "L2iCache",
            ObjectType::L3iCache => "L3iCache",
            ObjectType::Group => "Group",
            ObjectType::MemCache => "MemCache",
            ObjectType::Bridge => "Bridge",
            ObjectType::PciDevice => "PCIDev",
            ObjectType::OsDevice => "OSDev",
            ObjectType::Misc => "Misc",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown object type name
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown object type '{0}'")]
pub struct UnknownObjectType(pub String);

impl FromStr for ObjectType {
    type Err = UnknownObjectType;

    /// Accepts both display names ("PCIDev") and snake_case names ("pci_device"),
    /// case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.replace('_', "").to_ascii_lowercase();
        ObjectType::ALL
            .iter()
            .copied()
            .find(|t| {
                t.as_str().to_ascii_lowercase() == wanted
                    || format!("{:?}", t).to_ascii_lowercase() == wanted
            })
            .ok_or_else(|| UnknownObjectType(s.to_string()))
    }
}

/// PCI bus address (domain:bus:device.function)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PciBusId {
    pub domain: u32,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciBusId {
    pub fn new(domain: u32, bus: u8, device: u8, function: u8) -> Self {
        Self {
            domain,
            bus,
            device,
            function,
        }
    }
}

impl fmt::Display for PciBusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:01x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

/// PCI device attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PciDevAttr {
    pub busid: PciBusId,
    pub class_id: u16,
    pub vendor_id: u16,
    pub device_id: u16,
    pub subvendor_id: u16,
    pub subdevice_id: u16,
    pub revision: u8,
    /// Link speed in GB/s, 0 when unknown
    pub linkspeed: f32,
}

impl PciDevAttr {
    /// Whether a device class is kept when PCI devices are filtered with
    /// `keep_important`: storage, network, display, co-processors, fibre
    /// channel, InfiniBand and accelerators.
    pub fn is_important_class(class_id: u16) -> bool {
        matches!(class_id >> 8, 0x01 | 0x02 | 0x03 | 0x12)
            || matches!(class_id, 0x0b40 | 0x0c04 | 0x0c06)
    }

    pub fn is_important(&self) -> bool {
        Self::is_important_class(self.class_id)
    }
}

/// Range of PCI buses reachable below a bridge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciBusRange {
    pub domain: u32,
    pub secondary_bus: u8,
    pub subordinate_bus: u8,
}

impl PciBusRange {
    pub fn contains(&self, domain: u32, bus: u8) -> bool {
        self.domain == domain && self.secondary_bus <= bus && bus <= self.subordinate_bus
    }
}

/// Upstream side of a bridge
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BridgeUpstream {
    /// Host bridge, attached to the processor side
    Host,
    /// PCI-to-PCI bridge, with its own PCI function attributes
    Pci(PciDevAttr),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BridgeAttr {
    pub upstream: BridgeUpstream,
    pub downstream: PciBusRange,
    /// Number of bridges above this one
    pub depth: u32,
}

/// Class of device exposed by an OS device object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsDevKind {
    Storage,
    Gpu,
    Network,
    OpenFabrics,
    Dma,
    Coproc,
    Memory,
}

impl OsDevKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OsDevKind::Storage => "storage",
            OsDevKind::Gpu => "gpu",
            OsDevKind::Network => "network",
            OsDevKind::OpenFabrics => "openfabrics",
            OsDevKind::Dma => "dma",
            OsDevKind::Coproc => "coprocessor",
            OsDevKind::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheAttr {
    /// Size in bytes
    pub size: u64,
    pub depth: u32,
    pub linesize: u32,
    /// -1 for fully associative, 0 when unknown
    pub associativity: i32,
}

/// Type-specific attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectAttr {
    #[default]
    None,
    Cache(CacheAttr),
    Numa { local_memory: u64 },
    Group { depth: u32 },
    PciDev(PciDevAttr),
    Bridge(BridgeAttr),
    OsDev { kind: OsDevKind },
}

/// One descriptive key/value string pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoPair {
    pub name: String,
    pub value: String,
}

/// A consumer-owned record stacked on an object
pub struct UserdataRecord {
    owner: &'static str,
    payload: Box<dyn Any + Send + Sync>,
}

impl UserdataRecord {
    pub fn new<T: Any + Send + Sync>(owner: &'static str, payload: T) -> Self {
        Self {
            owner,
            payload: Box::new(payload),
        }
    }

    pub fn owner(&self) -> &'static str {
        self.owner
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.payload.downcast_mut()
    }

    /// Take the payload back out, or return the record untouched on type mismatch
    pub fn into_payload<T: Any>(self) -> Result<Box<T>, Self> {
        let owner = self.owner;
        self.payload
            .downcast()
            .map_err(|payload| Self { owner, payload })
    }
}

impl fmt::Debug for UserdataRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserdataRecord")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// A node of the topology tree
#[derive(Debug)]
pub struct Object {
    gp_index: u64,
    pub object_type: ObjectType,
    /// OS-visible index, `None` when unknown
    pub os_index: Option<u32>,
    pub name: Option<String>,
    pub subtype: Option<String>,
    pub attr: ObjectAttr,
    infos: Vec<InfoPair>,
    pub(crate) parent: Option<ObjectId>,
    pub(crate) children: Vec<ObjectId>,
    pub(crate) memory_children: Vec<ObjectId>,
    pub(crate) io_children: Vec<ObjectId>,
    pub(crate) misc_children: Vec<ObjectId>,
    /// Top of the stack is the last element
    userdata: Vec<UserdataRecord>,
}

impl Object {
    pub(crate) fn new(object_type: ObjectType, os_index: Option<u32>, gp_index: u64) -> Self {
        Self {
            gp_index,
            object_type,
            os_index,
            name: None,
            subtype: None,
            attr: ObjectAttr::None,
            infos: Vec::new(),
            parent: None,
            children: Vec::new(),
            memory_children: Vec::new(),
            io_children: Vec::new(),
            misc_children: Vec::new(),
            userdata: Vec::new(),
        }
    }

    /// Global persistent index, assigned at allocation
    pub fn gp_index(&self) -> u64 {
        self.gp_index
    }

    pub fn parent(&self) -> Option<ObjectId> {
        self.parent
    }

    pub fn children(&self) -> &[ObjectId] {
        &self.children
    }

    pub fn memory_children(&self) -> &[ObjectId] {
        &self.memory_children
    }

    pub fn io_children(&self) -> &[ObjectId] {
        &self.io_children
    }

    pub fn misc_children(&self) -> &[ObjectId] {
        &self.misc_children
    }

    pub fn children_of_kind(&self, kind: ChildKind) -> &[ObjectId] {
        match kind {
            ChildKind::Normal => &self.children,
            ChildKind::Memory => &self.memory_children,
            ChildKind::Io => &self.io_children,
            ChildKind::Misc => &self.misc_children,
        }
    }

    /// All children: normal, then memory, then I/O, then misc
    pub fn all_children(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.children
            .iter()
            .chain(&self.memory_children)
            .chain(&self.io_children)
            .chain(&self.misc_children)
            .copied()
    }

    pub fn has_children(&self) -> bool {
        !(self.children.is_empty()
            && self.memory_children.is_empty()
            && self.io_children.is_empty()
            && self.misc_children.is_empty())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_attr(mut self, attr: ObjectAttr) -> Self {
        self.attr = attr;
        self
    }

    /// Append an info pair. Existing pairs with the same name are kept.
    pub fn add_info(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.infos.push(InfoPair {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Value of the first info pair with this name
    pub fn info(&self, name: &str) -> Option<&str> {
        self.infos
            .iter()
            .find(|i| i.name == name)
            .map(|i| i.value.as_str())
    }

    /// Every value recorded under this name, in insertion order
    pub fn info_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.infos
            .iter()
            .filter(move |i| i.name == name)
            .map(|i| i.value.as_str())
    }

    pub fn infos(&self) -> &[InfoPair] {
        &self.infos
    }

    pub fn pci_attr(&self) -> Option<&PciDevAttr> {
        match &self.attr {
            ObjectAttr::PciDev(attr) => Some(attr),
            _ => None,
        }
    }

    pub fn pci_attr_mut(&mut self) -> Option<&mut PciDevAttr> {
        match &mut self.attr {
            ObjectAttr::PciDev(attr) => Some(attr),
            _ => None,
        }
    }

    pub fn bridge_attr(&self) -> Option<&BridgeAttr> {
        match &self.attr {
            ObjectAttr::Bridge(attr) => Some(attr),
            _ => None,
        }
    }

    pub fn osdev_kind(&self) -> Option<OsDevKind> {
        match self.attr {
            ObjectAttr::OsDev { kind } => Some(kind),
            _ => None,
        }
    }

    /// Attach a record on top of the userdata stack
    pub fn push_userdata(&mut self, record: UserdataRecord) {
        self.userdata.push(record);
    }

    /// Detach the most recently attached record
    pub fn pop_userdata(&mut self) -> Option<UserdataRecord> {
        self.userdata.pop()
    }

    pub fn top_userdata(&self) -> Option<&UserdataRecord> {
        self.userdata.last()
    }

    pub fn userdata_depth(&self) -> usize {
        self.userdata.len()
    }

    /// Innermost record of `owner` holding a `T`
    pub fn userdata<T: Any>(&self, owner: &str) -> Option<&T> {
        self.userdata
            .iter()
            .rev()
            .filter(|r| r.owner == owner)
            .find_map(|r| r.downcast_ref())
    }

    pub fn userdata_mut<T: Any>(&mut self, owner: &str) -> Option<&mut T> {
        self.userdata
            .iter_mut()
            .rev()
            .filter(|r| r.owner == owner)
            .find_map(|r| r.downcast_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_kind_by_type() {
        assert_eq!(ObjectType::Core.child_kind(), ChildKind::Normal);
        assert_eq!(ObjectType::L3Cache.child_kind(), ChildKind::Normal);
        assert_eq!(ObjectType::NumaNode.child_kind(), ChildKind::Memory);
        assert_eq!(ObjectType::MemCache.child_kind(), ChildKind::Memory);
        assert_eq!(ObjectType::PciDevice.child_kind(), ChildKind::Io);
        assert_eq!(ObjectType::OsDevice.child_kind(), ChildKind::Io);
        assert_eq!(ObjectType::Misc.child_kind(), ChildKind::Misc);
    }

    #[test]
    fn test_type_names_parse() {
        assert_eq!("PCIDev".parse::<ObjectType>().unwrap(), ObjectType::PciDevice);
        assert_eq!("os_device".parse::<ObjectType>().unwrap(), ObjectType::OsDevice);
        assert_eq!("numanode".parse::<ObjectType>().unwrap(), ObjectType::NumaNode);
        let err = "gizmo".parse::<ObjectType>().unwrap_err();
        assert_eq!(err, UnknownObjectType("gizmo".to_string()));
        assert_eq!(err.to_string(), "unknown object type 'gizmo'");
        let boxed: Box<dyn std::error::Error> = Box::new(err);
        assert!(boxed.source().is_none());
    }

    #[test]
    fn test_info_appends() {
        let mut obj = Object::new(ObjectType::OsDevice, None, 1);
        obj.add_info("Backend", "A");
        obj.add_info("Backend", "B");
        assert_eq!(obj.infos().len(), 2);
        assert_eq!(obj.info("Backend"), Some("A"));
        assert_eq!(obj.info_all("Backend").collect::<Vec<_>>(), vec!["A", "B"]);
        assert_eq!(obj.info("Missing"), None);
    }

    #[test]
    fn test_userdata_stack_order() {
        let mut obj = Object::new(ObjectType::Core, Some(0), 1);
        obj.push_userdata(UserdataRecord::new("outer", 1u32));
        obj.push_userdata(UserdataRecord::new("inner", "text"));

        assert_eq!(obj.userdata::<u32>("outer"), Some(&1));
        assert_eq!(obj.userdata::<&str>("inner"), Some(&"text"));
        assert_eq!(obj.userdata::<u32>("inner"), None);

        let top = obj.pop_userdata().unwrap();
        assert_eq!(top.owner(), "inner");
        let outer = obj.pop_userdata().unwrap();
        assert_eq!(*outer.into_payload::<u32>().unwrap(), 1);
        assert!(obj.pop_userdata().is_none());
    }

    #[test]
    fn test_bus_range() {
        let range = PciBusRange {
            domain: 0,
            secondary_bus: 2,
            subordinate_bus: 5,
        };
        assert!(range.contains(0, 2));
        assert!(range.contains(0, 5));
        assert!(!range.contains(0, 6));
        assert!(!range.contains(1, 3));
    }

    #[test]
    fn test_busid_display() {
        assert_eq!(PciBusId::new(0, 0x3b, 0, 1).to_string(), "0000:3b:00.1");
    }

    #[test]
    fn test_important_classes() {
        // VGA, ethernet, NVMe, InfiniBand, processing accelerator
        for class_id in [0x0300, 0x0200, 0x0108, 0x0c06, 0x1200] {
            assert!(PciDevAttr::is_important_class(class_id), "{:04x}", class_id);
        }
        // host bridge, USB, SMBus, audio
        for class_id in [0x0600, 0x0c03, 0x0c05, 0x0403] {
            assert!(!PciDevAttr::is_important_class(class_id), "{:04x}", class_id);
        }
    }
}
