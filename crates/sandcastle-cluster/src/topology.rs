//! Node topology derived from a cluster spec

use sandcastle_common::{ClusterSpec, NodeDescriptor, NodeRole};

/// Ordered node lists for one cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    spec: ClusterSpec,
    controlplanes: Vec<NodeDescriptor>,
    workers: Vec<NodeDescriptor>,
}

/// Derive the node list from `spec`.
///
/// Pure and deterministic: control planes `1..=C` then workers `1..=W`.
/// `ClusterSpec` is validated at construction, so this cannot fail.
pub fn build_topology(spec: &ClusterSpec) -> Topology {
    let nodes = |role: NodeRole, count: u32| {
        (1..=count)
            .map(|index| NodeDescriptor::new(spec, role, index))
            .collect::<Vec<_>>()
    };

    Topology {
        spec: spec.clone(),
        controlplanes: nodes(NodeRole::ControlPlane, spec.controlplanes()),
        workers: nodes(NodeRole::Worker, spec.workers()),
    }
}

impl Topology {
    /// The cluster spec this topology was derived from
    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    /// Control planes in index order
    pub fn controlplanes(&self) -> &[NodeDescriptor] {
        &self.controlplanes
    }

    /// Workers in index order
    pub fn workers(&self) -> &[NodeDescriptor] {
        &self.workers
    }

    /// The single node that receives the consensus bootstrap command
    pub fn bootstrap_node(&self) -> &NodeDescriptor {
        // A ClusterSpec always has at least one control plane.
        &self.controlplanes[0]
    }

    /// Every node, control planes first
    pub fn all(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.controlplanes.iter().chain(self.workers.iter())
    }

    /// Total node count
    pub fn len(&self) -> usize {
        self.controlplanes.len() + self.workers.len()
    }

    /// Whether there are no nodes (never true for a valid spec)
    pub fn is_empty(&self) -> bool {
        self.controlplanes.is_empty() && self.workers.is_empty()
    }

    /// The topology with one more node of `role` appended
    pub fn with_added(&self, role: NodeRole) -> Topology {
        let mut next = self.clone();
        let list = match role {
            NodeRole::ControlPlane => &mut next.controlplanes,
            NodeRole::Worker => &mut next.workers,
        };
        let index = list.len() as u32 + 1;
        list.push(NodeDescriptor::new(&self.spec, role, index));
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn spec(cp: i64, workers: i64) -> ClusterSpec {
        ClusterSpec::new("t1", "v1.8.3", cp, workers, "10.87.13.37").unwrap()
    }

    #[test]
    fn produces_requested_counts_with_unique_hostnames() {
        for (cp, w) in [(1, 0), (1, 1), (3, 2), (5, 7)] {
            let topology = build_topology(&spec(cp, w));
            assert_eq!(topology.controlplanes().len(), cp as usize);
            assert_eq!(topology.workers().len(), w as usize);
            assert_eq!(topology.len(), (cp + w) as usize);

            let names: HashSet<_> = topology.all().map(|n| n.hostname()).collect();
            assert_eq!(names.len(), topology.len());
        }
    }

    #[test]
    fn hostnames_are_one_indexed_and_role_prefixed() {
        let topology = build_topology(&spec(2, 2));
        let names: Vec<_> = topology.all().map(|n| n.hostname().to_string()).collect();
        assert_eq!(
            names,
            vec![
                "t1-controlplane-1",
                "t1-controlplane-2",
                "t1-worker-1",
                "t1-worker-2",
            ]
        );
    }

    #[test]
    fn first_control_plane_is_bootstrap_node() {
        let topology = build_topology(&spec(3, 1));
        assert_eq!(topology.bootstrap_node().hostname(), "t1-controlplane-1");
        assert_eq!(topology.all().filter(|n| n.is_bootstrap_node()).count(), 1);
    }

    #[test]
    fn is_deterministic() {
        assert_eq!(build_topology(&spec(2, 3)), build_topology(&spec(2, 3)));
    }

    #[test]
    fn with_added_appends_next_index() {
        let topology = build_topology(&spec(1, 1));
        let grown = topology
            .with_added(NodeRole::ControlPlane)
            .with_added(NodeRole::Worker);

        assert_eq!(grown.controlplanes()[1].hostname(), "t1-controlplane-2");
        assert_eq!(grown.workers()[1].hostname(), "t1-worker-2");
        assert_eq!(grown.len(), 4);
        assert_eq!(topology.len(), 2);
    }
}
