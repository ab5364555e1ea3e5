use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use super::NodeKey;

/// Which running entries are waiting on which others, across all requests.
///
/// An edge is only added if it doesn't close a cycle, so two requests
/// entering a cycle from different ends can't wait on each other forever.
#[derive(Default)]
pub(crate) struct WaitGraph {
    edges: Mutex<HashMap<NodeKey, Vec<NodeKey>>>,
}

/// Removes its edge from the [WaitGraph] when dropped.
pub(crate) struct Waiting<'a> {
    graph: &'a WaitGraph,
    from: NodeKey,
    to: NodeKey,
}

impl WaitGraph {
    /// Records that `from` waits on `to`. Returns None if `to` already waits
    /// on `from`, directly or transitively.
    pub(crate) fn wait(&self, from: &NodeKey, to: &NodeKey) -> Option<Waiting<'_>> {
        let mut edges = self.edges.lock();
        if reaches(&edges, to, from) {
            return None;
        }
        edges.entry(from.clone()).or_default().push(to.clone());

        Some(Waiting {
            graph: self,
            from: from.clone(),
            to: to.clone(),
        })
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.edges.lock().is_empty()
    }
}

fn reaches(edges: &HashMap<NodeKey, Vec<NodeKey>>, start: &NodeKey, target: &NodeKey) -> bool {
    let mut seen: HashSet<&NodeKey> = HashSet::new();
    let mut worklist = vec![start];
    while let Some(key) = worklist.pop() {
        if key == target {
            return true;
        }
        if !seen.insert(key) {
            continue;
        }
        if let Some(next) = edges.get(key) {
            worklist.extend(next.iter());
        }
    }
    false
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        let mut edges = self.graph.edges.lock();
        if let Some(targets) = edges.get_mut(&self.from) {
            if let Some(pos) = targets.iter().position(|t| t == &self.to) {
                targets.swap_remove(pos);
            }
            if targets.is_empty() {
                edges.remove(&self.from);
            }
        }
    }
}
