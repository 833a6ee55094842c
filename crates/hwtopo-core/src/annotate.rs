//! Display annotations attached to every object for tree-wide passes
//!
//! Annotations live on each object's userdata stack under
//! [`ANNOTATION_OWNER`], so other consumers can keep their own records on the
//! same objects.

use std::collections::HashMap;
use std::ops::Deref;
use tracing::debug;

use crate::object::{BridgeUpstream, ObjectId, ObjectType, PciDevAttr, UserdataRecord};
use crate::topology::Topology;

/// Userdata owner tag of [`DisplayAnnotation`] records
pub const ANNOTATION_OWNER: &str = "hwtopo-display";

/// Per-object state used by display passes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayAnnotation {
    /// Collapse count: 0 when not collapsed, n > 1 for the first object of a
    /// run of n identical devices, -1 for the others
    pub pci_collapsed: i32,
}

/// Push a fresh annotation onto every object reachable from the root
pub fn attach_annotations(topology: &mut Topology) -> usize {
    let ids = topology.depth_first();
    for &id in &ids {
        if let Some(obj) = topology.get_mut(id) {
            obj.push_userdata(UserdataRecord::new(ANNOTATION_OWNER, DisplayAnnotation::default()));
        }
    }
    debug!(objects = ids.len(), "Attached display annotations");
    ids.len()
}

/// Pop the annotation from every object reachable from the root.
///
/// Only a record owned by [`ANNOTATION_OWNER`] on top of the stack is
/// removed; objects without one are left alone.
pub fn detach_annotations(topology: &mut Topology) -> usize {
    let mut detached = 0;
    for id in topology.depth_first() {
        let Some(obj) = topology.get_mut(id) else {
            continue;
        };
        if obj
            .top_userdata()
            .is_some_and(|record| record.owner() == ANNOTATION_OWNER)
        {
            obj.pop_userdata();
            detached += 1;
        }
    }
    debug!(objects = detached, "Detached display annotations");
    detached
}

/// Collapse count of an object, 0 when it carries no annotation
pub fn collapsed(topology: &Topology, id: ObjectId) -> i32 {
    topology
        .get(id)
        .and_then(|obj| obj.userdata::<DisplayAnnotation>(ANNOTATION_OWNER))
        .map(|a| a.pci_collapsed)
        .unwrap_or(0)
}

fn set_collapsed(topology: &mut Topology, id: ObjectId, value: i32) {
    if let Some(annotation) = topology
        .get_mut(id)
        .and_then(|obj| obj.userdata_mut::<DisplayAnnotation>(ANNOTATION_OWNER))
    {
        annotation.pci_collapsed = value;
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct CollapseKey {
    parent: Option<ObjectId>,
    vendor_id: u16,
    device_id: u16,
    subvendor_id: u16,
    subdevice_id: u16,
}

impl CollapseKey {
    fn new(parent: Option<ObjectId>, attr: &PciDevAttr) -> Self {
        Self {
            parent,
            vendor_id: attr.vendor_id,
            device_id: attr.device_id,
            subvendor_id: attr.subvendor_id,
            subdevice_id: attr.subdevice_id,
        }
    }
}

/// Runs of two or more identical childless PCI devices under one parent
fn collapse_runs(topology: &Topology) -> Vec<Vec<ObjectId>> {
    let mut runs: Vec<Vec<ObjectId>> = Vec::new();
    let mut current: Vec<ObjectId> = Vec::new();
    let mut current_key: Option<CollapseKey> = None;

    for id in topology.pci_devices() {
        let obj = &topology[id];
        let key = match obj.pci_attr() {
            Some(attr) if !obj.has_children() => CollapseKey::new(obj.parent(), attr),
            _ => {
                runs.push(std::mem::take(&mut current));
                current_key = None;
                continue;
            }
        };

        if current_key != Some(key) {
            runs.push(std::mem::take(&mut current));
            current_key = Some(key);
        }
        current.push(id);
    }
    runs.push(current);
    runs.retain(|run| run.len() >= 2);
    runs
}

/// Collapse counts of every collapsed device, computed without annotating
/// the topology.
///
/// Objects missing from the map are not collapsed. Any number of exports
/// may compute these over a shared topology at the same time.
pub fn collapse_counts(topology: &Topology) -> HashMap<ObjectId, i32> {
    let mut counts = HashMap::new();
    for run in collapse_runs(topology) {
        counts.insert(run[0], i32::try_from(run.len()).unwrap_or(i32::MAX));
        for &id in &run[1..] {
            counts.insert(id, -1);
        }
    }
    counts
}

/// Mark runs of identical childless PCI devices for compact display.
///
/// Requires annotations to be attached. Objects are never moved or removed.
/// Returns the number of runs found.
pub fn collapse_identical_pci(topology: &mut Topology) -> usize {
    let runs = collapse_runs(topology);
    for run in &runs {
        let count = i32::try_from(run.len()).unwrap_or(i32::MAX);
        set_collapsed(topology, run[0], count);
        for &id in &run[1..] {
            set_collapsed(topology, id, -1);
        }
    }
    debug!(runs = runs.len(), "Collapsed identical PCI devices");
    runs.len()
}

/// Whether displays must print PCI domains
pub fn needs_pci_domain(topology: &Topology) -> bool {
    topology.objects().any(|(_, obj)| match obj.object_type {
        ObjectType::PciDevice => obj.pci_attr().is_some_and(|a| a.busid.domain != 0),
        ObjectType::Bridge => obj.bridge_attr().is_some_and(|b| match b.upstream {
            BridgeUpstream::Pci(attr) => attr.busid.domain != 0,
            BridgeUpstream::Host => false,
        }),
        _ => false,
    })
}

/// Annotations scoped to a borrow of the topology, detached on drop
pub struct AnnotationScope<'a> {
    topology: &'a mut Topology,
}

impl<'a> AnnotationScope<'a> {
    /// Attach annotations and optionally compute PCI collapsing
    pub fn prepare(topology: &'a mut Topology, collapse: bool) -> Self {
        attach_annotations(topology);
        if collapse {
            collapse_identical_pci(topology);
        }
        Self { topology }
    }

    pub fn topology(&self) -> &Topology {
        self.topology
    }

    pub fn collapsed(&self, id: ObjectId) -> i32 {
        collapsed(self.topology, id)
    }
}

impl Deref for AnnotationScope<'_> {
    type Target = Topology;

    fn deref(&self) -> &Topology {
        self.topology
    }
}

impl Drop for AnnotationScope<'_> {
    fn drop(&mut self) {
        detach_annotations(self.topology);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{BridgeAttr, ObjectAttr, PciBusId, PciBusRange};

    fn bridge(topology: &mut Topology) -> ObjectId {
        let obj = topology
            .alloc_object(ObjectType::Bridge, None)
            .with_attr(ObjectAttr::Bridge(BridgeAttr {
                upstream: BridgeUpstream::Host,
                downstream: PciBusRange {
                    domain: 0,
                    secondary_bus: 0,
                    subordinate_bus: 0xff,
                },
                depth: 0,
            }));
        topology.insert_by_parent(topology.root(), obj).unwrap()
    }

    fn nic(topology: &mut Topology, parent: ObjectId, function: u8, device_id: u16) -> ObjectId {
        let obj = topology
            .alloc_object(ObjectType::PciDevice, None)
            .with_attr(ObjectAttr::PciDev(PciDevAttr {
                busid: PciBusId::new(0, 3, 0, function),
                vendor_id: 0x8086,
                device_id,
                subvendor_id: 0x8086,
                subdevice_id: 1,
                ..Default::default()
            }));
        topology.insert_by_parent(parent, obj).unwrap()
    }

    #[test]
    fn test_collapse_run_of_three() {
        let mut topology = Topology::new();
        let host = bridge(&mut topology);
        let a = nic(&mut topology, host, 0, 0x1521);
        let b = nic(&mut topology, host, 1, 0x1521);
        let c = nic(&mut topology, host, 2, 0x1521);
        let d = nic(&mut topology, host, 3, 0x1533);

        let scope = AnnotationScope::prepare(&mut topology, true);
        assert_eq!(scope.collapsed(a), 3);
        assert_eq!(scope.collapsed(b), -1);
        assert_eq!(scope.collapsed(c), -1);
        assert_eq!(scope.collapsed(d), 0);
        assert_eq!(scope.object_count(), 6);
    }

    #[test]
    fn test_collapse_counts_match_annotations() {
        let mut topology = Topology::new();
        let host = bridge(&mut topology);
        let a = nic(&mut topology, host, 0, 0x1521);
        let b = nic(&mut topology, host, 1, 0x1521);
        let d = nic(&mut topology, host, 2, 0x1533);

        let counts = collapse_counts(&topology);
        assert_eq!(counts.get(&a), Some(&2));
        assert_eq!(counts.get(&b), Some(&-1));
        assert_eq!(counts.get(&d), None);
        assert_eq!(topology[a].userdata_depth(), 0);

        let scope = AnnotationScope::prepare(&mut topology, true);
        for id in [a, b, d] {
            assert_eq!(scope.collapsed(id), counts.get(&id).copied().unwrap_or(0));
        }
    }

    #[test]
    fn test_child_breaks_run() {
        let mut topology = Topology::new();
        let host = bridge(&mut topology);
        let a = nic(&mut topology, host, 0, 0x1521);
        let b = nic(&mut topology, host, 1, 0x1521);
        let c = nic(&mut topology, host, 2, 0x1521);
        let osdev = topology.alloc_object(ObjectType::OsDevice, None).with_name("eth1");
        topology.insert_by_parent(b, osdev).unwrap();

        let scope = AnnotationScope::prepare(&mut topology, true);
        assert_eq!(scope.collapsed(a), 0);
        assert_eq!(scope.collapsed(b), 0);
        assert_eq!(scope.collapsed(c), 0);
    }

    #[test]
    fn test_scope_detaches_only_its_records() {
        let mut topology = Topology::new();
        let host = bridge(&mut topology);
        topology
            .get_mut(host)
            .unwrap()
            .push_userdata(UserdataRecord::new("exporter", 42u32));

        {
            let scope = AnnotationScope::prepare(&mut topology, false);
            assert_eq!(scope[host].userdata_depth(), 2);
        }

        assert_eq!(topology[host].userdata_depth(), 1);
        assert_eq!(topology[host].userdata::<u32>("exporter"), Some(&42));
        assert_eq!(topology.root_object().userdata_depth(), 0);
        // a second detach finds nothing of ours
        assert_eq!(detach_annotations(&mut topology), 0);
    }

    #[test]
    fn test_needs_pci_domain() {
        let mut topology = Topology::new();
        let host = bridge(&mut topology);
        nic(&mut topology, host, 0, 0x1521);
        assert!(!needs_pci_domain(&topology));

        let far = topology
            .alloc_object(ObjectType::PciDevice, None)
            .with_attr(ObjectAttr::PciDev(PciDevAttr {
                busid: PciBusId::new(1, 0, 0, 0),
                ..Default::default()
            }));
        topology.insert_by_parent(topology.root(), far).unwrap();
        assert!(needs_pci_domain(&topology));
    }
}
