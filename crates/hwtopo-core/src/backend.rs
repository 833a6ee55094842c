//! Discovery backends and the orchestrator that runs them
//!
//! Backends run strictly one after another: phases in their fixed order,
//! and within a phase by ascending priority. Which backends run at all is
//! settled before the first one starts.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::TypeFilter;
use crate::object::ObjectType;
use crate::topology::{Topology, TopologyError};

/// Coarse ordered stage of discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryPhase {
    /// Backends building the whole tree at once
    Global,
    Cpu,
    Memory,
    Pci,
    Io,
    Misc,
    /// Annotating existing objects
    Annotate,
    Tweak,
}

impl DiscoveryPhase {
    pub const ALL: [DiscoveryPhase; 8] = [
        DiscoveryPhase::Global,
        DiscoveryPhase::Cpu,
        DiscoveryPhase::Memory,
        DiscoveryPhase::Pci,
        DiscoveryPhase::Io,
        DiscoveryPhase::Misc,
        DiscoveryPhase::Annotate,
        DiscoveryPhase::Tweak,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DiscoveryPhase::Global => "global",
            DiscoveryPhase::Cpu => "cpu",
            DiscoveryPhase::Memory => "memory",
            DiscoveryPhase::Pci => "pci",
            DiscoveryPhase::Io => "io",
            DiscoveryPhase::Misc => "misc",
            DiscoveryPhase::Annotate => "annotate",
            DiscoveryPhase::Tweak => "tweak",
        }
    }
}

bitflags! {
    /// Set of discovery phases
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PhaseSet: u32 {
        const GLOBAL = 1 << 0;
        const CPU = 1 << 1;
        const MEMORY = 1 << 2;
        const PCI = 1 << 3;
        const IO = 1 << 4;
        const MISC = 1 << 5;
        const ANNOTATE = 1 << 6;
        const TWEAK = 1 << 7;
    }
}

impl From<DiscoveryPhase> for PhaseSet {
    fn from(phase: DiscoveryPhase) -> Self {
        match phase {
            DiscoveryPhase::Global => PhaseSet::GLOBAL,
            DiscoveryPhase::Cpu => PhaseSet::CPU,
            DiscoveryPhase::Memory => PhaseSet::MEMORY,
            DiscoveryPhase::Pci => PhaseSet::PCI,
            DiscoveryPhase::Io => PhaseSet::IO,
            DiscoveryPhase::Misc => PhaseSet::MISC,
            DiscoveryPhase::Annotate => PhaseSet::ANNOTATE,
            DiscoveryPhase::Tweak => PhaseSet::TWEAK,
        }
    }
}

/// State handed to a backend when it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryStatus {
    pub phase: DiscoveryPhase,
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Backend runtime unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// A pluggable discovery module
pub trait Backend {
    fn name(&self) -> &str;

    fn phase(&self) -> DiscoveryPhase;

    /// Order within the phase, lower runs first
    fn priority(&self) -> i32 {
        0
    }

    /// Phases whose backends must not run alongside this one, whether they
    /// come before or after it
    fn excludes(&self) -> PhaseSet {
        PhaseSet::empty()
    }

    /// Object type this backend creates, used for type filtering
    fn contributes(&self) -> Option<ObjectType> {
        None
    }

    /// Add this backend's objects to the topology.
    ///
    /// Contributing nothing is a success: a missing runtime only removes this
    /// backend's objects from the result.
    fn discover(
        &mut self,
        topology: &mut Topology,
        status: &DiscoveryStatus,
    ) -> Result<(), BackendError>;
}

/// What happened to one backend during a discovery run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "lowercase")]
pub enum BackendOutcome {
    Completed,
    /// Skipped because its object type is filtered out
    Filtered,
    /// Skipped by configuration
    Disabled,
    /// Skipped because another backend excluded its phase
    Excluded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendReport {
    pub name: String,
    pub phase: DiscoveryPhase,
    pub priority: i32,
    pub outcome: BackendOutcome,
    pub objects_added: usize,
}

/// Per-backend results of [`Discovery::run`], in execution order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub backends: Vec<BackendReport>,
}

impl DiscoveryReport {
    pub fn get(&self, name: &str) -> Option<&BackendReport> {
        self.backends.iter().find(|b| b.name == name)
    }

    pub fn outcome(&self, name: &str) -> Option<&BackendOutcome> {
        self.get(name).map(|b| &b.outcome)
    }

    pub fn objects_added(&self) -> usize {
        self.backends.iter().map(|b| b.objects_added).sum()
    }
}

/// Orchestrates registered backends over one topology
#[derive(Default)]
pub struct Discovery {
    backends: Vec<Box<dyn Backend>>,
}

impl Discovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Box<dyn Backend>) {
        debug!(
            backend = backend.name(),
            phase = backend.phase().as_str(),
            priority = backend.priority(),
            "Registered discovery backend"
        );
        self.backends.push(backend);
    }

    pub fn with_backend(mut self, backend: impl Backend + 'static) -> Self {
        self.register(Box::new(backend));
        self
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Decide which backends are skipped, before any of them runs.
    ///
    /// Disabled and filtered backends drop out first. The remaining ones
    /// claim their exclusions by descending priority, ties in registration
    /// order, and a backend whose phase is already claimed is excluded and
    /// claims nothing.
    fn plan(&self, topology: &Topology) -> Vec<Option<BackendOutcome>> {
        let mut skipped: Vec<Option<BackendOutcome>> = self
            .backends
            .iter()
            .map(|backend| {
                if topology.config().is_backend_disabled(backend.name()) {
                    debug!(backend = backend.name(), "Backend disabled by configuration");
                    Some(BackendOutcome::Disabled)
                } else if backend
                    .contributes()
                    .is_some_and(|t| topology.type_filter(t) == TypeFilter::KeepNone)
                {
                    debug!(backend = backend.name(), "Backend objects filtered out");
                    Some(BackendOutcome::Filtered)
                } else {
                    None
                }
            })
            .collect();

        let mut claims: Vec<usize> = (0..self.backends.len())
            .filter(|&i| skipped[i].is_none())
            .collect();
        claims.sort_by_key(|&i| Reverse(self.backends[i].priority()));

        let mut excluded = PhaseSet::empty();
        for i in claims {
            let backend = &self.backends[i];
            let phase = backend.phase();
            if excluded.contains(PhaseSet::from(phase)) {
                debug!(backend = backend.name(), phase = phase.as_str(), "Backend phase excluded");
                skipped[i] = Some(BackendOutcome::Excluded);
            } else {
                excluded |= backend.excludes();
            }
        }
        skipped
    }

    /// Run every backend once over `topology`
    pub fn run(&mut self, topology: &mut Topology) -> DiscoveryReport {
        let mut order: Vec<usize> = (0..self.backends.len()).collect();
        order.sort_by_key(|&i| (self.backends[i].phase(), self.backends[i].priority()));
        let mut skipped = self.plan(topology);

        let mut report = DiscoveryReport::default();

        info!(backends = order.len(), "Starting topology discovery");

        for i in order {
            let backend = &mut self.backends[i];
            let name = backend.name().to_string();
            let phase = backend.phase();
            let priority = backend.priority();
            let before = topology.object_count();

            let outcome = match skipped[i].take() {
                Some(outcome) => outcome,
                None => {
                    debug!(backend = %name, phase = phase.as_str(), "Running backend");
                    match backend.discover(topology, &DiscoveryStatus { phase }) {
                        Ok(()) => BackendOutcome::Completed,
                        Err(e) => {
                            if topology.hide_errors() {
                                debug!(backend = %name, error = %e, "Backend discovery failed");
                            } else {
                                warn!(backend = %name, error = %e, "Backend discovery failed");
                            }
                            BackendOutcome::Failed(e.to_string())
                        }
                    }
                }
            };

            let objects_added = topology.object_count() - before;
            report.backends.push(BackendReport {
                name,
                phase,
                priority,
                outcome,
                objects_added,
            });
        }

        info!(
            objects = topology.object_count(),
            distances = topology.distances().len(),
            "Topology discovery complete"
        );
        report
    }
}
