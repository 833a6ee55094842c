//! Fabric port collection and bandwidth matrix resolution
//!
//! Ports of every device are gathered into one registry during a discovery
//! pass. Links can only be matched once every device's ports are known, so
//! resolution runs once at the end.

use std::collections::TryReserveError;
use thiserror::Error;
use tracing::debug;

use hwtopo_core::{
    DistancesBuilder, DistancesError, DistancesId, DistancesKind, Grouping, ObjectId, Registry,
    RegistryError, Topology,
};

use crate::enumerate::{PortProperties, PortState, PortStatus};

#[derive(Error, Debug)]
pub enum FabricError {
    #[error("Port registry could not grow, fabric links abandoned: {0}")]
    PortsAbandoned(RegistryError),
    #[error("Failed to allocate bandwidth matrix: {0}")]
    Allocation(#[from] TryReserveError),
    #[error(transparent)]
    Distances(#[from] DistancesError),
}

/// One port with the object owning it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRecord {
    /// `gp_index` of the owning device or sub-device
    pub owner: u64,
    pub properties: PortProperties,
    pub state: PortState,
}

/// Ports shared by all devices of one discovery pass.
///
/// Once growing fails the registry is abandoned: further pushes are ignored
/// and resolution reports the failure instead of building a partial matrix.
#[derive(Debug, Default)]
pub struct PortRegistry {
    ports: Registry<PortRecord>,
    abandoned: Option<RegistryError>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make room for `additional` ports, abandoning the registry on failure
    pub fn reserve(&mut self, additional: usize) -> bool {
        if self.abandoned.is_some() {
            return false;
        }
        match self.ports.reserve(additional) {
            Ok(()) => true,
            Err(e) => {
                self.abandoned = Some(e);
                false
            }
        }
    }

    pub fn push(&mut self, record: PortRecord) {
        if self.abandoned.is_some() {
            return;
        }
        if let Err(e) = self.ports.push(record) {
            self.abandoned = Some(e);
        }
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.is_some()
    }

    pub fn as_slice(&self) -> &[PortRecord] {
        self.ports.as_slice()
    }
}

/// Sum receive bandwidth of healthy links into an `owners.len()` square
/// matrix, in MB/s.
///
/// A link from port `i` to port `j` counts when `i` is healthy, `i`'s remote
/// id equals `j`'s own id and `j` uses `link_model`. Parallel links between
/// the same owners add up. Returns `None` when no link matched, otherwise the
/// matrix with `local_bandwidth` on its diagonal.
pub fn bandwidth_matrix(
    ports: &[PortRecord],
    owners: &[u64],
    link_model: &str,
    local_bandwidth: u64,
) -> Result<Option<Vec<u64>>, TryReserveError> {
    let n = owners.len();
    let mut values = Vec::new();
    values.try_reserve_exact(n * n)?;
    values.resize(n * n, 0u64);

    let mut matched = 0usize;
    for (i, local) in ports.iter().enumerate() {
        if local.state.status != PortStatus::Healthy {
            continue;
        }
        for (j, remote) in ports.iter().enumerate() {
            if i == j || local.state.remote_port_id != remote.properties.port_id {
                continue;
            }
            debug!(
                model = %remote.properties.model,
                bit_rate = local.state.rx_speed.bit_rate,
                from = local.owner,
                to = remote.owner,
                "Found fabric link"
            );
            if remote.properties.model != link_model {
                continue;
            }
            let (Some(row), Some(col)) = (
                owners.iter().position(|o| *o == local.owner),
                owners.iter().position(|o| *o == remote.owner),
            ) else {
                continue;
            };
            let bit_rate = u64::try_from(local.state.rx_speed.bit_rate).unwrap_or(0);
            values[row * n + col] += bit_rate >> 20;
            matched += 1;
        }
    }

    if matched == 0 {
        return Ok(None);
    }
    for i in 0..n {
        values[i * n + i] = local_bandwidth;
    }
    Ok(Some(values))
}

/// Resolve links between registered ports and commit the bandwidth matrix.
///
/// Returns `Ok(None)` when there is nothing to commit.
pub fn connect(
    topology: &mut Topology,
    matrix_name: &str,
    link_model: &str,
    local_bandwidth: u64,
    participants: Registry<ObjectId>,
    ports: PortRegistry,
) -> Result<Option<DistancesId>, FabricError> {
    let PortRegistry { ports, abandoned } = ports;
    if let Some(e) = abandoned {
        return Err(FabricError::PortsAbandoned(e));
    }
    if ports.is_empty() || participants.is_empty() {
        return Ok(None);
    }

    let objects = participants.into_vec();
    let owners: Vec<u64> = objects.iter().map(|id| topology[*id].gp_index()).collect();
    let Some(values) = bandwidth_matrix(ports.as_slice(), &owners, link_model, local_bandwidth)?
    else {
        debug!(ports = ports.len(), "No fabric link matched");
        return Ok(None);
    };

    let mut builder = DistancesBuilder::create(
        Some(matrix_name),
        DistancesKind::FROM_OS | DistancesKind::MEANS_BANDWIDTH,
    );
    builder.add_values(objects, values)?;
    let id = topology.distances_commit(builder, Grouping::Disabled)?;
    Ok(Some(id))
}
