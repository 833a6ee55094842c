//! Text labels of topology objects

use hwtopo_core::object::BridgeUpstream;
use hwtopo_core::{ObjectId, ObjectType, PciBusId, Topology};

fn pci_address(busid: &PciBusId, show_domain: bool) -> String {
    if show_domain {
        busid.to_string()
    } else {
        format!("{:02x}:{:02x}.{:01x}", busid.bus, busid.device, busid.function)
    }
}

/// Label of an object, or `None` when it is collapsed into a previous one.
///
/// `collapsed` is the object's collapse count. The first object of a
/// collapsed run is prefixed with the run length, as in `"4 x PCI 03:00.0"`.
pub fn object_label(
    topology: &Topology,
    id: ObjectId,
    collapsed: i32,
    show_domain: bool,
) -> Option<String> {
    let obj = topology.get(id)?;
    if collapsed < 0 {
        return None;
    }

    let base = match obj.object_type {
        ObjectType::PciDevice => match obj.pci_attr() {
            Some(attr) => format!("PCI {}", pci_address(&attr.busid, show_domain)),
            None => "PCI".to_string(),
        },
        ObjectType::Bridge => match obj.bridge_attr().map(|b| b.upstream) {
            Some(BridgeUpstream::Pci(attr)) => {
                format!("PCIBridge {}", pci_address(&attr.busid, show_domain))
            }
            _ => "HostBridge".to_string(),
        },
        ObjectType::OsDevice => obj
            .name
            .clone()
            .unwrap_or_else(|| obj.object_type.as_str().to_string()),
        t => match (&obj.name, obj.os_index) {
            (Some(name), _) => format!("{} {}", t.as_str(), name),
            (None, Some(index)) if t != ObjectType::Machine => format!("{} P#{}", t.as_str(), index),
            _ => t.as_str().to_string(),
        },
    };

    if collapsed > 1 {
        Some(format!("{} x {}", collapsed, base))
    } else {
        Some(base)
    }
}
