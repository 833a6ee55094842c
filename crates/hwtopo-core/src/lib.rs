//! hwtopo Core - Hardware topology tree, distance matrices and discovery orchestration
//!
//! This crate provides the engine shared by every discovery backend:
//! - Object tree with typed attributes, info pairs and userdata stacks
//! - Two-phase distance matrix construction
//! - Phase/priority ordered backend orchestration
//! - Display annotations such as collapsing of identical PCI devices

pub mod annotate;
pub mod backend;
pub mod config;
pub mod distances;
pub mod object;
pub mod registry;
pub mod topology;

pub use annotate::{AnnotationScope, DisplayAnnotation, ANNOTATION_OWNER};
pub use backend::{
    Backend, BackendError, BackendOutcome, BackendReport, Discovery, DiscoveryPhase,
    DiscoveryReport, DiscoveryStatus, PhaseSet,
};
pub use config::{ConfigError, TopologyConfig, TypeFilter};
pub use distances::{
    Distances, DistancesBuilder, DistancesError, DistancesId, DistancesKind, Grouping,
};
pub use object::{
    ChildKind, InfoPair, Object, ObjectAttr, ObjectId, ObjectType, OsDevKind, PciBusId,
    PciDevAttr, UserdataRecord,
};
pub use registry::{Registry, RegistryError};
pub use topology::{Topology, TopologyError, TopologySnapshot};
