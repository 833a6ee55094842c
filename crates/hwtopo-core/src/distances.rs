//! Distance matrices between topology objects
//!
//! Matrices are built in two steps so that readers never see a partially
//! filled one: a [`DistancesBuilder`] collects the participants and values,
//! then [`Topology::distances_commit`] validates and attaches the result.
//! A builder that is dropped or fails to commit leaves the topology untouched.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info};

use crate::object::ObjectId;
use crate::topology::Topology;

bitflags! {
    /// What a matrix measures and where its values come from
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DistancesKind: u32 {
        /// Values reported by the operating system or a vendor runtime
        const FROM_OS = 1 << 0;
        /// Values provided by the user
        const FROM_USER = 1 << 1;
        /// Lower values are better
        const MEANS_LATENCY = 1 << 2;
        /// Higher values are better
        const MEANS_BANDWIDTH = 1 << 3;
        /// Participants are not all of the same object type
        const HETEROGENEOUS_TYPES = 1 << 4;
    }
}

impl DistancesKind {
    fn is_valid(self) -> bool {
        let from = self & (DistancesKind::FROM_OS | DistancesKind::FROM_USER);
        let means = self & (DistancesKind::MEANS_LATENCY | DistancesKind::MEANS_BANDWIDTH);
        from.bits().count_ones() == 1 && means.bits().count_ones() == 1
    }
}

/// Whether commit may infer clusters among participants
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Grouping {
    #[default]
    Disabled,
    Enabled,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DistancesError {
    #[error("Distances kind {0:?} must name exactly one source and one meaning")]
    InvalidKind(DistancesKind),
    #[error("Distances need at least one participant")]
    NoParticipants,
    #[error("Values were already attached to this distances handle")]
    ValuesAlreadySet,
    #[error("Expected {expected} values for {participants} participants, got {actual}")]
    SizeMismatch {
        participants: usize,
        expected: usize,
        actual: usize,
    },
    #[error("Object {0} appears more than once in the participants")]
    DuplicateParticipant(ObjectId),
    #[error("Object {0} is not part of the topology")]
    UnknownParticipant(ObjectId),
    #[error("Distances handle has no values")]
    NoValues,
}

/// Identifier of a committed matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DistancesId(pub u64);

/// Pending matrix, not yet visible in the topology
#[derive(Debug)]
pub struct DistancesBuilder {
    name: Option<String>,
    kind: DistancesKind,
    participants: Vec<ObjectId>,
    values: Vec<u64>,
}

impl DistancesBuilder {
    pub fn create(name: Option<&str>, kind: DistancesKind) -> Self {
        Self {
            name: name.map(str::to_string),
            kind,
            participants: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Hand over the participants and their row-major `n*n` values.
    ///
    /// Both buffers belong to the builder afterwards. On error they are
    /// dropped and the builder stays as it was, so it may be retried.
    pub fn add_values(
        &mut self,
        participants: Vec<ObjectId>,
        values: Vec<u64>,
    ) -> Result<(), DistancesError> {
        if !self.participants.is_empty() {
            return Err(DistancesError::ValuesAlreadySet);
        }
        if participants.is_empty() {
            return Err(DistancesError::NoParticipants);
        }
        let n = participants.len();
        if values.len() != n * n {
            return Err(DistancesError::SizeMismatch {
                participants: n,
                expected: n * n,
                actual: values.len(),
            });
        }
        self.participants = participants;
        self.values = values;
        Ok(())
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn kind(&self) -> DistancesKind {
        self.kind
    }
}

/// A committed N×N matrix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distances {
    id: DistancesId,
    name: Option<String>,
    kind: DistancesKind,
    participants: Vec<ObjectId>,
    values: Vec<u64>,
    /// Min-distance clusters inferred at commit time, when grouping was allowed
    clusters: Vec<Vec<ObjectId>>,
}

impl Distances {
    pub fn id(&self) -> DistancesId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn kind(&self) -> DistancesKind {
        self.kind
    }

    pub fn participants(&self) -> &[ObjectId] {
        &self.participants
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Row-major values
    pub fn values(&self) -> &[u64] {
        &self.values
    }

    pub fn value(&self, row: usize, col: usize) -> Option<u64> {
        let n = self.len();
        if row < n && col < n {
            Some(self.values[row * n + col])
        } else {
            None
        }
    }

    pub fn index_of(&self, obj: ObjectId) -> Option<usize> {
        self.participants.iter().position(|p| *p == obj)
    }

    /// Value from `from` to `to`
    pub fn between(&self, from: ObjectId, to: ObjectId) -> Option<u64> {
        self.value(self.index_of(from)?, self.index_of(to)?)
    }

    pub fn clusters(&self) -> &[Vec<ObjectId>] {
        &self.clusters
    }
}

impl Topology {
    /// Validate a builder and attach its matrix to the topology
    pub fn distances_commit(
        &mut self,
        builder: DistancesBuilder,
        grouping: Grouping,
    ) -> Result<DistancesId, DistancesError> {
        let DistancesBuilder {
            name,
            mut kind,
            participants,
            values,
        } = builder;

        if !kind.is_valid() {
            return Err(DistancesError::InvalidKind(kind));
        }
        if participants.is_empty() {
            return Err(DistancesError::NoValues);
        }
        let n = participants.len();
        if values.len() != n * n {
            return Err(DistancesError::SizeMismatch {
                participants: n,
                expected: n * n,
                actual: values.len(),
            });
        }
        let mut seen = HashSet::with_capacity(n);
        for &obj in &participants {
            if !self.contains(obj) {
                return Err(DistancesError::UnknownParticipant(obj));
            }
            if !seen.insert(obj) {
                return Err(DistancesError::DuplicateParticipant(obj));
            }
        }

        let first_type = self[participants[0]].object_type;
        if participants.iter().any(|p| self[*p].object_type != first_type) {
            kind |= DistancesKind::HETEROGENEOUS_TYPES;
        }

        let clusters = if grouping == Grouping::Enabled
            && kind.contains(DistancesKind::MEANS_LATENCY)
            && !kind.contains(DistancesKind::HETEROGENEOUS_TYPES)
        {
            find_clusters(&participants, &values)
        } else {
            Vec::new()
        };
        if !clusters.is_empty() {
            debug!(
                name = name.as_deref().unwrap_or("(unnamed)"),
                clusters = clusters.len(),
                "Inferred participant clusters"
            );
        }

        let id = DistancesId(self.next_distances_id);
        self.next_distances_id += 1;
        info!(
            name = name.as_deref().unwrap_or("(unnamed)"),
            participants = n,
            kind = ?kind,
            "Committed distance matrix"
        );
        self.distances.push(Distances {
            id,
            name,
            kind,
            participants,
            values,
            clusters,
        });
        Ok(id)
    }

    pub fn distances(&self) -> &[Distances] {
        &self.distances
    }

    pub fn distances_by_id(&self, id: DistancesId) -> Option<&Distances> {
        self.distances.iter().find(|d| d.id == id)
    }

    pub fn distances_by_name<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Distances> + 'a {
        self.distances
            .iter()
            .filter(move |d| d.name.as_deref() == Some(name))
    }

    /// Matrices whose kind contains every flag of `kind`
    pub fn distances_by_kind(&self, kind: DistancesKind) -> impl Iterator<Item = &Distances> + '_ {
        self.distances.iter().filter(move |d| d.kind.contains(kind))
    }
}

/// Group participants transitively linked by the matrix's minimal
/// off-diagonal value. Returns nothing unless that yields 2..n-1 clusters.
fn find_clusters(participants: &[ObjectId], values: &[u64]) -> Vec<Vec<ObjectId>> {
    let n = participants.len();
    if n < 3 {
        return Vec::new();
    }

    let min = (0..n)
        .flat_map(|i| (0..n).filter(move |j| *j != i).map(move |j| (i, j)))
        .map(|(i, j)| values[i * n + j])
        .min();
    let Some(min) = min else {
        return Vec::new();
    };

    let mut leader: Vec<usize> = (0..n).collect();
    fn root(leader: &mut [usize], mut i: usize) -> usize {
        while leader[i] != i {
            leader[i] = leader[leader[i]];
            i = leader[i];
        }
        i
    }
    for i in 0..n {
        for j in (i + 1)..n {
            if values[i * n + j] == min || values[j * n + i] == min {
                let (a, b) = (root(&mut leader, i), root(&mut leader, j));
                if a != b {
                    leader[b.max(a)] = a.min(b);
                }
            }
        }
    }

    let mut clusters: Vec<(usize, Vec<ObjectId>)> = Vec::new();
    for (i, obj) in participants.iter().enumerate() {
        let r = root(&mut leader, i);
        match clusters.iter_mut().find(|(first, _)| *first == r) {
            Some((_, members)) => members.push(*obj),
            None => clusters.push((r, vec![*obj])),
        }
    }

    if clusters.len() <= 1 || clusters.len() >= n {
        return Vec::new();
    }
    clusters.into_iter().map(|(_, members)| members).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectType;

    fn topology_with(count: usize, object_type: ObjectType) -> (Topology, Vec<ObjectId>) {
        let mut topology = Topology::new();
        let root = topology.root();
        let ids = (0..count)
            .map(|i| {
                let obj = topology.alloc_object(object_type, Some(i as u32));
                topology.insert_by_parent(root, obj).unwrap()
            })
            .collect();
        (topology, ids)
    }

    fn bandwidth() -> DistancesKind {
        DistancesKind::FROM_OS | DistancesKind::MEANS_BANDWIDTH
    }

    #[test]
    fn test_commit_three_by_three() {
        let (mut topology, ids) = topology_with(3, ObjectType::OsDevice);
        let values: Vec<u64> = (1..=9).collect();

        let mut builder = DistancesBuilder::create(Some("Bandwidth"), bandwidth());
        builder.add_values(ids.clone(), values.clone()).unwrap();
        let id = topology.distances_commit(builder, Grouping::Disabled).unwrap();

        let dist = topology.distances_by_id(id).unwrap();
        assert_eq!(dist.name(), Some("Bandwidth"));
        assert_eq!(dist.participants(), ids.as_slice());
        assert_eq!(dist.values(), values.as_slice());
        assert_eq!(dist.value(1, 2), Some(6));
        assert_eq!(dist.between(ids[2], ids[0]), Some(7));
        assert!(!dist.kind().contains(DistancesKind::HETEROGENEOUS_TYPES));
        assert_eq!(topology.distances_by_name("Bandwidth").count(), 1);
    }

    #[test]
    fn test_empty_participants_rejected() {
        let (topology, _) = topology_with(2, ObjectType::OsDevice);
        let mut builder = DistancesBuilder::create(Some("Empty"), bandwidth());
        assert_eq!(
            builder.add_values(Vec::new(), Vec::new()),
            Err(DistancesError::NoParticipants)
        );
        assert!(topology.distances().is_empty());
    }

    #[test]
    fn test_failed_commit_leaves_no_matrix() {
        let (mut topology, ids) = topology_with(2, ObjectType::OsDevice);

        // never given values
        let builder = DistancesBuilder::create(Some("Nothing"), bandwidth());
        assert_eq!(
            topology.distances_commit(builder, Grouping::Disabled),
            Err(DistancesError::NoValues)
        );

        // bad kind
        let mut builder = DistancesBuilder::create(Some("Kindless"), DistancesKind::FROM_OS);
        builder.add_values(ids.clone(), vec![0; 4]).unwrap();
        assert!(matches!(
            topology.distances_commit(builder, Grouping::Disabled),
            Err(DistancesError::InvalidKind(_))
        ));

        // duplicated participant
        let mut builder = DistancesBuilder::create(Some("Dup"), bandwidth());
        builder.add_values(vec![ids[0], ids[0]], vec![0; 4]).unwrap();
        assert_eq!(
            topology.distances_commit(builder, Grouping::Disabled),
            Err(DistancesError::DuplicateParticipant(ids[0]))
        );

        // unknown participant
        let mut builder = DistancesBuilder::create(Some("Ghost"), bandwidth());
        builder.add_values(vec![ids[0], ObjectId(99)], vec![0; 4]).unwrap();
        assert_eq!(
            topology.distances_commit(builder, Grouping::Disabled),
            Err(DistancesError::UnknownParticipant(ObjectId(99)))
        );

        assert!(topology.distances().is_empty());
    }

    #[test]
    fn test_add_values_size_mismatch_allows_retry() {
        let (mut topology, ids) = topology_with(2, ObjectType::OsDevice);
        let mut builder = DistancesBuilder::create(None, bandwidth());
        assert_eq!(
            builder.add_values(ids.clone(), vec![1, 2, 3]),
            Err(DistancesError::SizeMismatch {
                participants: 2,
                expected: 4,
                actual: 3
            })
        );
        builder.add_values(ids.clone(), vec![1, 2, 3, 4]).unwrap();
        assert_eq!(
            builder.add_values(ids, vec![1, 2, 3, 4]),
            Err(DistancesError::ValuesAlreadySet)
        );
        topology.distances_commit(builder, Grouping::Disabled).unwrap();
        assert_eq!(topology.distances().len(), 1);
    }

    #[test]
    fn test_heterogeneous_flag() {
        let mut topology = Topology::new();
        let root = topology.root();
        let core = topology.alloc_object(ObjectType::Core, Some(0));
        let core = topology.insert_by_parent(root, core).unwrap();
        let numa = topology.alloc_object(ObjectType::NumaNode, Some(0));
        let numa = topology.insert_by_parent(root, numa).unwrap();

        let mut builder = DistancesBuilder::create(None, DistancesKind::FROM_USER | DistancesKind::MEANS_LATENCY);
        builder.add_values(vec![core, numa], vec![10, 20, 20, 10]).unwrap();
        let id = topology.distances_commit(builder, Grouping::Enabled).unwrap();
        let dist = topology.distances_by_id(id).unwrap();
        assert!(dist.kind().contains(DistancesKind::HETEROGENEOUS_TYPES));
        assert!(dist.clusters().is_empty());
        assert_eq!(topology.distances_by_kind(DistancesKind::MEANS_LATENCY).count(), 1);
    }

    #[test]
    fn test_grouping_finds_clusters() {
        let (mut topology, ids) = topology_with(4, ObjectType::NumaNode);
        #[rustfmt::skip]
        let values = vec![
            10, 11, 20, 20,
            11, 10, 20, 20,
            20, 20, 10, 11,
            20, 20, 11, 10,
        ];
        let kind = DistancesKind::FROM_OS | DistancesKind::MEANS_LATENCY;

        let mut builder = DistancesBuilder::create(Some("NUMALatency"), kind);
        builder.add_values(ids.clone(), values.clone()).unwrap();
        let id = topology.distances_commit(builder, Grouping::Enabled).unwrap();
        assert_eq!(
            topology.distances_by_id(id).unwrap().clusters(),
            &[vec![ids[0], ids[1]], vec![ids[2], ids[3]]]
        );

        let mut builder = DistancesBuilder::create(Some("NUMALatency"), kind);
        builder.add_values(ids, values).unwrap();
        let id = topology.distances_commit(builder, Grouping::Disabled).unwrap();
        assert!(topology.distances_by_id(id).unwrap().clusters().is_empty());
    }
}
