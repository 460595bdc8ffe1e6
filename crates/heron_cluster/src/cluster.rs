//! Cluster topology.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cluster-layer errors.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("cluster has no coordinator segment (content id -1)")]
    NoCoordinator,

    #[error("duplicate content id {0} in cluster configuration")]
    DuplicateContent(i32),

    #[error("{verb} failed on {count} segment(s): contents [{contents}]")]
    PartialFailure {
        verb: String,
        count: usize,
        contents: String,
    },
}

/// One node of the cluster. The coordinator carries content id -1;
/// content-bearing segments are numbered from 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentConfig {
    pub content_id: i32,
    pub hostname: String,
    pub data_dir: PathBuf,
    pub port: u16,
}

impl SegmentConfig {
    pub fn is_coordinator(&self) -> bool {
        self.content_id == -1
    }
}

/// Which nodes a fan-out targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Coordinator,
    Segments,
    SegmentsAndCoordinator,
}

/// The full cluster topology, coordinator included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    coordinator: SegmentConfig,
    segments: Vec<SegmentConfig>,
}

impl Cluster {
    /// Build a cluster from a flat segment list. Exactly one entry must
    /// carry content id -1; content ids must be unique.
    pub fn new(mut all: Vec<SegmentConfig>) -> Result<Self, ClusterError> {
        all.sort_by_key(|s| s.content_id);
        for pair in all.windows(2) {
            if pair[0].content_id == pair[1].content_id {
                return Err(ClusterError::DuplicateContent(pair[0].content_id));
            }
        }
        let coordinator_idx = all
            .iter()
            .position(SegmentConfig::is_coordinator)
            .ok_or(ClusterError::NoCoordinator)?;
        let coordinator = all.remove(coordinator_idx);
        Ok(Self {
            coordinator,
            segments: all,
        })
    }

    pub fn coordinator(&self) -> &SegmentConfig {
        &self.coordinator
    }

    pub fn segments(&self) -> &[SegmentConfig] {
        &self.segments
    }

    /// Number of content-bearing segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// The nodes a fan-out with the given scope targets, content-ascending.
    pub fn targets(&self, scope: Scope) -> Vec<&SegmentConfig> {
        match scope {
            Scope::Coordinator => vec![&self.coordinator],
            Scope::Segments => self.segments.iter().collect(),
            Scope::SegmentsAndCoordinator => std::iter::once(&self.coordinator)
                .chain(self.segments.iter())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(content_id: i32) -> SegmentConfig {
        SegmentConfig {
            content_id,
            hostname: "localhost".to_string(),
            data_dir: PathBuf::from(format!("/data/seg{}", content_id)),
            port: 6000 + (content_id + 1) as u16,
        }
    }

    #[test]
    fn test_new_requires_coordinator() {
        let err = Cluster::new(vec![seg(0), seg(1)]).unwrap_err();
        assert!(matches!(err, ClusterError::NoCoordinator));
    }

    #[test]
    fn test_new_rejects_duplicate_contents() {
        let err = Cluster::new(vec![seg(-1), seg(0), seg(0)]).unwrap_err();
        assert!(matches!(err, ClusterError::DuplicateContent(0)));
    }

    #[test]
    fn test_targets_by_scope() {
        let cluster = Cluster::new(vec![seg(1), seg(-1), seg(0)]).unwrap();

        let contents = |scope| {
            cluster
                .targets(scope)
                .iter()
                .map(|s| s.content_id)
                .collect::<Vec<_>>()
        };
        assert_eq!(contents(Scope::Coordinator), vec![-1]);
        assert_eq!(contents(Scope::Segments), vec![0, 1]);
        assert_eq!(contents(Scope::SegmentsAndCoordinator), vec![-1, 0, 1]);
    }
}
