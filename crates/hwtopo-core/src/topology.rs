//! Topology tree: object arena, insertion and traversal

use serde::{Deserialize, Serialize};
use std::ops::Index;
use thiserror::Error;
use tracing::trace;

use crate::config::{TopologyConfig, TypeFilter};
use crate::distances::Distances;
use crate::object::{ChildKind, InfoPair, Object, ObjectAttr, ObjectId, ObjectType, PciBusId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Parent object {0} does not exist")]
    InvalidParent(ObjectId),
}

/// The hardware model: a tree of objects rooted at a Machine, plus the
/// distance matrices committed during discovery.
#[derive(Debug)]
pub struct Topology {
    /// Linked objects, indexed by `ObjectId`
    objects: Vec<Object>,
    next_gp_index: u64,
    pub(crate) distances: Vec<Distances>,
    pub(crate) next_distances_id: u64,
    config: TopologyConfig,
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology {
    /// Create a topology holding only its root Machine object
    pub fn new() -> Self {
        Self::with_config(TopologyConfig::default())
    }

    pub fn with_config(config: TopologyConfig) -> Self {
        let root = Object::new(ObjectType::Machine, Some(0), 0);
        Self {
            objects: vec![root],
            next_gp_index: 1,
            distances: Vec::new(),
            next_distances_id: 0,
            config,
        }
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut TopologyConfig {
        &mut self.config
    }

    /// Whether advisory diagnostics should be kept out of the warning stream
    pub fn hide_errors(&self) -> bool {
        self.config.hide_errors
    }

    pub fn type_filter(&self, object_type: ObjectType) -> TypeFilter {
        self.config.type_filter(object_type)
    }

    pub fn root(&self) -> ObjectId {
        ObjectId(0)
    }

    pub fn root_object(&self) -> &Object {
        &self.objects[0]
    }

    /// Allocate a new unlinked object.
    ///
    /// The object gets its global persistent index now; it only becomes part
    /// of the tree once passed to [`Topology::insert_by_parent`]. Dropping it
    /// instead leaves no trace in the topology.
    pub fn alloc_object(&mut self, object_type: ObjectType, os_index: Option<u32>) -> Object {
        let gp_index = self.next_gp_index;
        self.next_gp_index += 1;
        Object::new(object_type, os_index, gp_index)
    }

    /// Link `object` below `parent`, in the child list matching its type.
    ///
    /// Siblings are neither reordered nor validated; callers sort before
    /// inserting when order matters.
    pub fn insert_by_parent(
        &mut self,
        parent: ObjectId,
        mut object: Object,
    ) -> Result<ObjectId, TopologyError> {
        if parent.0 >= self.objects.len() {
            return Err(TopologyError::InvalidParent(parent));
        }

        let id = ObjectId(self.objects.len());
        let kind = object.object_type.child_kind();
        object.parent = Some(parent);
        trace!(
            object = %id,
            parent = %parent,
            object_type = %object.object_type,
            "Inserting object"
        );
        self.objects.push(object);

        let parent_obj = &mut self.objects[parent.0];
        match kind {
            ChildKind::Normal => parent_obj.children.push(id),
            ChildKind::Memory => parent_obj.memory_children.push(id),
            ChildKind::Io => parent_obj.io_children.push(id),
            ChildKind::Misc => parent_obj.misc_children.push(id),
        }
        Ok(id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(id.0)
    }

    /// Mutable access, meant for discovery only
    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.objects.get_mut(id.0)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        id.0 < self.objects.len()
    }

    /// Number of linked objects, root included
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// All linked objects in insertion order
    pub fn objects(&self) -> impl Iterator<Item = (ObjectId, &Object)> {
        self.objects
            .iter()
            .enumerate()
            .map(|(i, obj)| (ObjectId(i), obj))
    }

    /// Depth-first pre-order walk over all four child relations
    pub fn depth_first(&self) -> Vec<ObjectId> {
        let mut order = Vec::with_capacity(self.objects.len());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            order.push(id);
            let obj = &self.objects[id.0];
            let before = stack.len();
            stack.extend(obj.all_children());
            stack[before..].reverse();
        }
        order
    }

    /// Objects of one type, in depth-first order
    pub fn objects_of_type(&self, object_type: ObjectType) -> Vec<ObjectId> {
        self.depth_first()
            .into_iter()
            .filter(|id| self.objects[id.0].object_type == object_type)
            .collect()
    }

    pub fn pci_devices(&self) -> Vec<ObjectId> {
        self.objects_of_type(ObjectType::PciDevice)
    }

    pub fn bridges(&self) -> Vec<ObjectId> {
        self.objects_of_type(ObjectType::Bridge)
    }

    /// Number of ancestors between this object and the root
    pub fn depth_of(&self, id: ObjectId) -> Option<usize> {
        let mut depth = 0;
        let mut current = self.get(id)?.parent;
        while let Some(parent) = current {
            depth += 1;
            current = self.objects[parent.0].parent;
        }
        Some(depth)
    }

    /// PCI device with exactly this bus address
    pub fn find_pci_device(&self, busid: PciBusId) -> Option<ObjectId> {
        self.objects().find_map(|(id, obj)| match obj.pci_attr() {
            Some(attr) if obj.object_type == ObjectType::PciDevice && attr.busid == busid => {
                Some(id)
            }
            _ => None,
        })
    }

    /// Find where a device at this PCI address belongs.
    ///
    /// Returns the PCI device with exactly this address if one exists,
    /// otherwise the deepest bridge whose downstream bus range holds the
    /// address, or `None` when no I/O object covers it.
    pub fn find_parent_by_bus_address(
        &self,
        domain: u32,
        bus: u8,
        device: u8,
        function: u8,
    ) -> Option<ObjectId> {
        let busid = PciBusId::new(domain, bus, device, function);
        if let Some(id) = self.find_pci_device(busid) {
            return Some(id);
        }

        self.objects()
            .filter_map(|(id, obj)| match obj.bridge_attr() {
                Some(bridge) if bridge.downstream.contains(domain, bus) => {
                    self.depth_of(id).map(|depth| (depth, id))
                }
                _ => None,
            })
            .max_by_key(|(depth, _)| *depth)
            .map(|(_, id)| id)
    }

    /// Serializable view of the tree and its distance matrices
    pub fn snapshot(&self) -> TopologySnapshot {
        TopologySnapshot {
            root: self.root(),
            objects: self
                .objects()
                .map(|(id, obj)| ObjectSnapshot {
                    id,
                    gp_index: obj.gp_index(),
                    object_type: obj.object_type,
                    os_index: obj.os_index,
                    name: obj.name.clone(),
                    subtype: obj.subtype.clone(),
                    attr: obj.attr,
                    infos: obj.infos().to_vec(),
                    parent: obj.parent(),
                    children: obj.children().to_vec(),
                    memory_children: obj.memory_children().to_vec(),
                    io_children: obj.io_children().to_vec(),
                    misc_children: obj.misc_children().to_vec(),
                })
                .collect(),
            distances: self.distances.clone(),
        }
    }
}

impl Index<ObjectId> for Topology {
    type Output = Object;

    fn index(&self, id: ObjectId) -> &Object {
        &self.objects[id.0]
    }
}

/// One object of a [`TopologySnapshot`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    pub id: ObjectId,
    pub gp_index: u64,
    pub object_type: ObjectType,
    pub os_index: Option<u32>,
    pub name: Option<String>,
    pub subtype: Option<String>,
    pub attr: ObjectAttr,
    pub infos: Vec<InfoPair>,
    pub parent: Option<ObjectId>,
    pub children: Vec<ObjectId>,
    pub memory_children: Vec<ObjectId>,
    pub io_children: Vec<ObjectId>,
    pub misc_children: Vec<ObjectId>,
}

/// Serializable topology for exporters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub root: ObjectId,
    pub objects: Vec<ObjectSnapshot>,
    pub distances: Vec<Distances>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{BridgeAttr, BridgeUpstream, OsDevKind, PciBusRange, PciDevAttr};
    use std::collections::HashSet;

    fn host_bridge(topology: &mut Topology, parent: ObjectId, domain: u32, buses: (u8, u8)) -> ObjectId {
        let bridge = topology
            .alloc_object(ObjectType::Bridge, None)
            .with_attr(ObjectAttr::Bridge(BridgeAttr {
                upstream: BridgeUpstream::Host,
                downstream: PciBusRange {
                    domain,
                    secondary_bus: buses.0,
                    subordinate_bus: buses.1,
                },
                depth: 0,
            }));
        topology.insert_by_parent(parent, bridge).unwrap()
    }

    fn pci_bridge(topology: &mut Topology, parent: ObjectId, busid: PciBusId, buses: (u8, u8)) -> ObjectId {
        let bridge = topology
            .alloc_object(ObjectType::Bridge, None)
            .with_attr(ObjectAttr::Bridge(BridgeAttr {
                upstream: BridgeUpstream::Pci(PciDevAttr {
                    busid,
                    ..Default::default()
                }),
                downstream: PciBusRange {
                    domain: busid.domain,
                    secondary_bus: buses.0,
                    subordinate_bus: buses.1,
                },
                depth: 1,
            }));
        topology.insert_by_parent(parent, bridge).unwrap()
    }

    fn pci_device(topology: &mut Topology, parent: ObjectId, busid: PciBusId) -> ObjectId {
        let dev = topology
            .alloc_object(ObjectType::PciDevice, None)
            .with_attr(ObjectAttr::PciDev(PciDevAttr {
                busid,
                vendor_id: 0x8086,
                device_id: 0x0bd5,
                ..Default::default()
            }));
        topology.insert_by_parent(parent, dev).unwrap()
    }

    #[test]
    fn test_insert_routes_by_type() {
        let mut topology = Topology::new();
        let root = topology.root();

        let package = topology.alloc_object(ObjectType::Package, Some(0));
        let package = topology.insert_by_parent(root, package).unwrap();
        let numa = topology.alloc_object(ObjectType::NumaNode, Some(0));
        let numa = topology.insert_by_parent(package, numa).unwrap();
        let osdev = topology
            .alloc_object(ObjectType::OsDevice, None)
            .with_attr(ObjectAttr::OsDev { kind: OsDevKind::Coproc });
        let osdev = topology.insert_by_parent(package, osdev).unwrap();
        let misc = topology.alloc_object(ObjectType::Misc, None);
        let misc = topology.insert_by_parent(package, misc).unwrap();

        let pkg = &topology[package];
        assert_eq!(topology[root].children(), &[package]);
        assert_eq!(pkg.memory_children(), &[numa]);
        assert_eq!(pkg.io_children(), &[osdev]);
        assert_eq!(pkg.misc_children(), &[misc]);
        assert_eq!(topology[numa].parent(), Some(package));
    }

    #[test]
    fn test_insert_invalid_parent() {
        let mut topology = Topology::new();
        let obj = topology.alloc_object(ObjectType::Misc, None);
        let err = topology.insert_by_parent(ObjectId(42), obj).unwrap_err();
        assert_eq!(err, TopologyError::InvalidParent(ObjectId(42)));
        assert_eq!(topology.object_count(), 1);
    }

    #[test]
    fn test_dropped_allocation_leaves_no_trace() {
        let mut topology = Topology::new();
        let first = topology.alloc_object(ObjectType::Core, Some(0));
        let second = topology.alloc_object(ObjectType::Core, Some(1));
        assert_ne!(first.gp_index(), second.gp_index());
        drop(first);
        let second = topology.insert_by_parent(topology.root(), second).unwrap();
        assert_eq!(topology.object_count(), 2);
        assert_eq!(topology.depth_first(), vec![topology.root(), second]);
    }

    #[test]
    fn test_tree_well_formed() {
        let mut topology = Topology::new();
        let root = topology.root();
        let package = topology.alloc_object(ObjectType::Package, Some(0));
        let package = topology.insert_by_parent(root, package).unwrap();
        for i in 0..2 {
            let core = topology.alloc_object(ObjectType::Core, Some(i));
            let core = topology.insert_by_parent(package, core).unwrap();
            let pu = topology.alloc_object(ObjectType::Pu, Some(i));
            topology.insert_by_parent(core, pu).unwrap();
        }
        let numa = topology.alloc_object(ObjectType::NumaNode, Some(0));
        topology.insert_by_parent(package, numa).unwrap();
        let bridge = host_bridge(&mut topology, package, 0, (0, 4));
        pci_device(&mut topology, bridge, PciBusId::new(0, 1, 0, 0));
        let misc = topology.alloc_object(ObjectType::Misc, None);
        topology.insert_by_parent(root, misc).unwrap();

        let order = topology.depth_first();
        let unique: HashSet<_> = order.iter().copied().collect();
        assert_eq!(order.len(), topology.object_count());
        assert_eq!(unique.len(), order.len());

        for (id, obj) in topology.objects() {
            if id == root {
                assert!(obj.parent().is_none());
                continue;
            }
            let parent = &topology[obj.parent().unwrap()];
            let memberships = [
                parent.children(),
                parent.memory_children(),
                parent.io_children(),
                parent.misc_children(),
            ]
            .iter()
            .map(|list| list.iter().filter(|c| **c == id).count())
            .sum::<usize>();
            assert_eq!(memberships, 1, "object {} linked {} times", id, memberships);
        }
    }

    #[test]
    fn test_depth_first_order() {
        let mut topology = Topology::new();
        let root = topology.root();
        let a = topology.alloc_object(ObjectType::Package, Some(0));
        let a = topology.insert_by_parent(root, a).unwrap();
        let b = topology.alloc_object(ObjectType::Package, Some(1));
        let b = topology.insert_by_parent(root, b).unwrap();
        let a_core = topology.alloc_object(ObjectType::Core, Some(0));
        let a_core = topology.insert_by_parent(a, a_core).unwrap();
        let io = host_bridge(&mut topology, root, 0, (0, 1));

        assert_eq!(topology.depth_first(), vec![root, a, a_core, b, io]);
        assert_eq!(topology.objects_of_type(ObjectType::Package), vec![a, b]);
        assert_eq!(topology.depth_of(a_core), Some(2));
    }

    #[test]
    fn test_find_parent_by_bus_address() {
        let mut topology = Topology::new();
        let root = topology.root();
        let host = host_bridge(&mut topology, root, 0, (0, 0x10));
        let switch = pci_bridge(&mut topology, host, PciBusId::new(0, 0, 1, 0), (0x3a, 0x3c));
        let gpu = pci_device(&mut topology, switch, PciBusId::new(0, 0x3b, 0, 0));

        // exact device match wins
        assert_eq!(topology.find_parent_by_bus_address(0, 0x3b, 0, 0), Some(gpu));
        // deepest covering bridge otherwise
        assert_eq!(topology.find_parent_by_bus_address(0, 0x3c, 0, 0), Some(switch));
        assert_eq!(topology.find_parent_by_bus_address(0, 0x05, 0, 0), Some(host));
        // nothing covers another domain
        assert_eq!(topology.find_parent_by_bus_address(1, 0x3b, 0, 0), None);
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut topology = Topology::new();
        let mut dev = topology.alloc_object(ObjectType::OsDevice, None).with_name("ze0");
        dev.add_info("Backend", "LevelZero");
        topology.insert_by_parent(topology.root(), dev).unwrap();

        let snapshot = topology.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"ze0\""));
        assert!(json.contains("LevelZero"));
        assert_eq!(snapshot.objects[0].io_children, vec![ObjectId(1)]);
    }
}
