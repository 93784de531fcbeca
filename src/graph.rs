//! Dependency edges between cached handles.
//!
//! An edge `dependent -> dependency` is recorded whenever building one handle
//! reads another cached handle, e.g. a schema reading its store connection.
//! Invalidating the dependency must also invalidate everything built on it.

use crate::key::{RecordId, ResourceKey, ResourceKind};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Default)]
struct Edges {
    /// dependency -> keys built from it
    dependents: HashMap<ResourceKey, HashSet<ResourceKey>>,
    /// dependent -> keys it was built from
    dependencies: HashMap<ResourceKey, HashSet<ResourceKey>>,
}

impl Edges {
    fn unlink(&mut self, dependent: &ResourceKey) {
        let Some(dependencies) = self.dependencies.remove(dependent) else {
            return;
        };
        for dependency in dependencies {
            if let Some(dependents) = self.dependents.get_mut(&dependency) {
                dependents.remove(dependent);
                if dependents.is_empty() {
                    self.dependents.remove(&dependency);
                }
            }
        }
    }
}

/// Directed dependency graph used to cascade invalidation.
#[derive(Default)]
pub struct DependencyGraph {
    edges: Mutex<Edges>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `dependent` was built from `dependency`.
    pub fn record(&self, dependent: &ResourceKey, dependency: &ResourceKey) {
        let mut edges = self.edges.lock();
        edges
            .dependents
            .entry(dependency.clone())
            .or_default()
            .insert(dependent.clone());
        edges
            .dependencies
            .entry(dependent.clone())
            .or_default()
            .insert(dependency.clone());
    }

    /// Drop the outgoing edges of `dependent` before it is rebuilt.
    pub fn reset(&self, dependent: &ResourceKey) {
        self.edges.lock().unlink(dependent);
    }

    /// Every key transitively built from any variant of `root`'s record.
    ///
    /// The root itself is not included. Keys come back in breadth-first order
    /// so direct dependents are cleared before their own dependents.
    pub fn dependents_of(&self, root: &ResourceKey) -> Vec<ResourceKey> {
        let edges = self.edges.lock();

        let mut visited: HashSet<ResourceKey> = HashSet::new();
        let mut queue: VecDeque<ResourceKey> = edges
            .dependents
            .keys()
            .filter(|key| key.same_record(root))
            .cloned()
            .collect();
        visited.extend(queue.iter().cloned());

        let mut found = Vec::new();
        while let Some(key) = queue.pop_front() {
            let Some(dependents) = edges.dependents.get(&key) else {
                continue;
            };
            for dependent in dependents {
                if visited.insert(dependent.clone()) {
                    found.push(dependent.clone());
                    queue.push_back(dependent.clone());
                }
            }
        }
        found
    }

    /// Remove every edge touching any variant of the given record.
    pub fn forget(&self, kind: ResourceKind, identity: &RecordId) {
        let root = ResourceKey::new(kind, identity.clone());
        let mut edges = self.edges.lock();

        let as_dependent: Vec<ResourceKey> = edges
            .dependencies
            .keys()
            .filter(|key| key.same_record(&root))
            .cloned()
            .collect();
        for key in &as_dependent {
            edges.unlink(key);
        }

        let as_dependency: Vec<ResourceKey> = edges
            .dependents
            .keys()
            .filter(|key| key.same_record(&root))
            .cloned()
            .collect();
        for key in as_dependency {
            if let Some(dependents) = edges.dependents.remove(&key) {
                for dependent in dependents {
                    if let Some(dependencies) = edges.dependencies.get_mut(&dependent) {
                        dependencies.remove(&key);
                        if dependencies.is_empty() {
                            edges.dependencies.remove(&dependent);
                        }
                    }
                }
            }
        }
    }

    /// Remove all edges.
    pub fn clear(&self) {
        let mut edges = self.edges.lock();
        edges.dependents.clear();
        edges.dependencies.clear();
    }

    /// Number of recorded edges.
    pub fn len(&self) -> usize {
        self.edges.lock().dependencies.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
