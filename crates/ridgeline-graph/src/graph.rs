//! Dependency graph and topological ordering.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use ridge_core::{DependencyEdge, Resource, ResourceId};
use tracing::debug;

use crate::error::{GraphError, GraphResult};

/// A directed acyclic graph over resource ids.
///
/// Nodes are indexed by declaration order; the index doubles as the
/// tie-breaker when several resources are ready at once.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    ids: Vec<ResourceId>,
    index: HashMap<ResourceId, usize>,
    /// node → the nodes it depends on.
    producers: Vec<BTreeSet<usize>>,
    /// node → the nodes that depend on it.
    consumers: Vec<BTreeSet<usize>>,
    edges: Vec<DependencyEdge>,
}

impl DependencyGraph {
    /// Build a graph, rejecting duplicate ids and dependencies on resources
    /// that are not part of the same graph.
    pub fn build<'a, I>(resources: I) -> GraphResult<Self>
    where
        I: IntoIterator<Item = &'a Resource>,
    {
        Self::build_inner(resources, true)
    }

    /// Build a graph, silently dropping edges to resources outside it.
    ///
    /// Used for subsets of persisted state, where a record may point at a
    /// producer that lives in a different part of the plan.
    pub fn build_allowing_missing<'a, I>(resources: I) -> GraphResult<Self>
    where
        I: IntoIterator<Item = &'a Resource>,
    {
        Self::build_inner(resources, false)
    }

    fn build_inner<'a, I>(resources: I, strict: bool) -> GraphResult<Self>
    where
        I: IntoIterator<Item = &'a Resource>,
    {
        let resources: Vec<&Resource> = resources.into_iter().collect();

        let mut ids = Vec::with_capacity(resources.len());
        let mut index = HashMap::with_capacity(resources.len());
        for r in &resources {
            if index.insert(r.id.clone(), ids.len()).is_some() {
                return Err(GraphError::DuplicateId(r.id.clone()));
            }
            ids.push(r.id.clone());
        }

        let mut producers = vec![BTreeSet::new(); ids.len()];
        let mut consumers = vec![BTreeSet::new(); ids.len()];
        let mut edges = Vec::new();

        for r in &resources {
            let consumer = index[&r.id];
            for edge in r.edges() {
                let Some(&producer) = index.get(&edge.producer) else {
                    if strict {
                        return Err(GraphError::UnknownDependency {
                            consumer: edge.consumer,
                            producer: edge.producer,
                        });
                    }
                    debug!(
                        consumer = %edge.consumer,
                        producer = %edge.producer,
                        "dropping edge to resource outside graph"
                    );
                    continue;
                };
                producers[consumer].insert(producer);
                consumers[producer].insert(consumer);
                edges.push(edge);
            }
        }

        Ok(Self {
            ids,
            index,
            producers,
            consumers,
            edges,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Ids in declaration order.
    pub fn ids(&self) -> &[ResourceId] {
        &self.ids
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    /// Direct producers of `id`, in declaration order.
    pub fn producers_of(&self, id: &str) -> Vec<&str> {
        self.neighbours(id, &self.producers)
    }

    /// Direct consumers of `id`, in declaration order.
    pub fn consumers_of(&self, id: &str) -> Vec<&str> {
        self.neighbours(id, &self.consumers)
    }

    fn neighbours<'a>(&'a self, id: &str, adjacency: &'a [BTreeSet<usize>]) -> Vec<&'a str> {
        self.index
            .get(id)
            .map(|&i| adjacency[i].iter().map(|&j| self.ids[j].as_str()).collect())
            .unwrap_or_default()
    }

    /// Everything that directly or indirectly depends on `id`.
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<ResourceId> {
        let mut out = BTreeSet::new();
        let Some(&start) = self.index.get(id) else {
            return out;
        };
        let mut queue = VecDeque::from([start]);
        let mut seen = HashSet::from([start]);
        while let Some(node) = queue.pop_front() {
            for &c in &self.consumers[node] {
                if seen.insert(c) {
                    out.insert(self.ids[c].clone());
                    queue.push_back(c);
                }
            }
        }
        out
    }

    /// Creation order: every producer precedes its consumers, ties broken
    /// by declaration order.
    pub fn creation_order(&self) -> GraphResult<Vec<ResourceId>> {
        let mut in_degree: Vec<usize> = self.producers.iter().map(BTreeSet::len).collect();
        let mut ready: BTreeSet<usize> = (0..self.ids.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.ids.len());

        while let Some(node) = ready.pop_first() {
            order.push(node);
            for &c in &self.consumers[node] {
                in_degree[c] -= 1;
                if in_degree[c] == 0 {
                    ready.insert(c);
                }
            }
        }

        if order.len() < self.ids.len() {
            let placed: HashSet<usize> = order.iter().copied().collect();
            let cycle = self.find_cycle(&placed);
            return Err(GraphError::CycleDetected { cycle });
        }

        Ok(order.into_iter().map(|i| self.ids[i].clone()).collect())
    }

    /// Teardown order: the reverse of [`creation_order`](Self::creation_order),
    /// recomputed on every call.
    pub fn teardown_order(&self) -> GraphResult<Vec<ResourceId>> {
        let mut order = self.creation_order()?;
        order.reverse();
        Ok(order)
    }

    /// Walk producer edges among the nodes Kahn's algorithm could not place.
    ///
    /// Every such node still has an unplaced producer, so the walk must
    /// revisit a node; the path from that node onward is the cycle.
    fn find_cycle(&self, placed: &HashSet<usize>) -> Vec<ResourceId> {
        let Some(start) = (0..self.ids.len()).find(|i| !placed.contains(i)) else {
            return Vec::new();
        };
        let mut path: Vec<usize> = Vec::new();
        let mut position: HashMap<usize, usize> = HashMap::new();
        let mut current = start;

        loop {
            if let Some(&pos) = position.get(&current) {
                let mut cycle: Vec<ResourceId> =
                    path[pos..].iter().map(|&i| self.ids[i].clone()).collect();
                cycle.push(self.ids[current].clone());
                return cycle;
            }
            position.insert(current, path.len());
            path.push(current);
            match self.producers[current]
                .iter()
                .copied()
                .find(|p| !placed.contains(p))
            {
                Some(next) => current = next,
                None => return path.iter().map(|&i| self.ids[i].clone()).collect(),
            }
        }
    }
}
