//! Configuration diffing
//!
//! Computes which nodes a redeploy has to touch. The engine is pure: it
//! never looks at running state, only at two node arrays.

use crate::{DiffError, FlowConfig, FlowId, NodeConfig, NodeId};
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Node ids grouped by how they differ between two configurations.
///
/// The five node categories are pairwise disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffResult {
    pub added: BTreeSet<NodeId>,
    pub changed: BTreeSet<NodeId>,
    pub removed: BTreeSet<NodeId>,
    pub rewired: BTreeSet<NodeId>,
    pub linked: BTreeSet<NodeId>,
    /// Tabs whose own properties changed
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub flows_changed: BTreeSet<FlowId>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.changed.is_empty()
            && self.removed.is_empty()
            && self.rewired.is_empty()
            && self.linked.is_empty()
    }

    /// Whether the node has to be (re)created by a deploy
    pub fn needs_start(&self, id: &str) -> bool {
        self.added.contains(id) || self.changed.contains(id)
    }

    /// Whether a running instance of the node has to be closed
    pub fn needs_stop(&self, id: &str) -> bool {
        self.changed.contains(id) || self.removed.contains(id)
    }

    /// Whether the node keeps running but must refresh its routing
    pub fn needs_rewire(&self, id: &str) -> bool {
        self.rewired.contains(id) || self.linked.contains(id)
    }

    /// Any node id the deploy touches in some way
    pub fn touches(&self, id: &str) -> bool {
        self.needs_start(id) || self.needs_stop(id) || self.needs_rewire(id)
    }

    /// Reclassify nodes as changed. Ids that are added or removed are left
    /// alone, which keeps the categories disjoint.
    pub fn promote_changed<'a>(&mut self, ids: impl IntoIterator<Item = &'a NodeId>) {
        for id in ids {
            if self.added.contains(id) || self.removed.contains(id) {
                continue;
            }
            self.rewired.remove(id);
            self.linked.remove(id);
            self.changed.insert(id.clone());
        }
    }

    /// Ids present in both configurations that are neither changed nor rewired
    pub fn unchanged(&self, old: &[NodeConfig], new: &[NodeConfig]) -> BTreeSet<NodeId> {
        let old_ids: BTreeSet<&NodeId> = old.iter().map(|n| &n.id).collect();
        new.iter()
            .map(|n| &n.id)
            .filter(|id| old_ids.contains(id))
            .filter(|id| !self.changed.contains(*id) && !self.rewired.contains(*id))
            .cloned()
            .collect()
    }
}

impl fmt::Display for DiffResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "added={} changed={} removed={} rewired={} linked={}",
            self.added.len(),
            self.changed.len(),
            self.removed.len(),
            self.rewired.len(),
            self.linked.len()
        )
    }
}

/// Diff two node arrays.
///
/// A node whose only difference is its `wires` is `rewired`; any other
/// difference (metadata included) makes it `changed`. Nodes one wiring hop
/// away from any touched node are `linked`.
pub fn diff(old: &[NodeConfig], new: &[NodeConfig]) -> Result<DiffResult, DiffError> {
    let old_map = index(old)?;
    let new_map = index(new)?;
    let mut result = classify(&old_map, &new_map);
    link(&mut result, &old_map, &new_map);
    Ok(result)
}

/// Diff two parsed configurations, propagating changes through subflow
/// templates and config-node references.
pub fn diff_config(old: &FlowConfig, new: &FlowConfig) -> DiffResult {
    // parse() already rejected missing and duplicate ids
    let old_map: HashMap<&str, &NodeConfig> =
        old.nodes().iter().map(|n| (n.id.as_str(), n)).collect();
    let new_map: HashMap<&str, &NodeConfig> =
        new.nodes().iter().map(|n| (n.id.as_str(), n)).collect();

    let mut result = classify(&old_map, &new_map);

    for id in &result.changed {
        if new.flows.contains_key(id) {
            result.flows_changed.insert(id.clone());
        }
    }

    propagate_subflows(&mut result, old, new);
    propagate_references(&mut result, new);
    link(&mut result, &old_map, &new_map);
    result
}

fn index(nodes: &[NodeConfig]) -> Result<HashMap<&str, &NodeConfig>, DiffError> {
    let mut map = HashMap::with_capacity(nodes.len());
    for (i, node) in nodes.iter().enumerate() {
        if node.id.is_empty() {
            return Err(DiffError::MissingId { index: i });
        }
        if map.insert(node.id.as_str(), node).is_some() {
            return Err(DiffError::DuplicateId(node.id.clone()));
        }
    }
    Ok(map)
}

fn classify(
    old: &HashMap<&str, &NodeConfig>,
    new: &HashMap<&str, &NodeConfig>,
) -> DiffResult {
    let mut result = DiffResult::default();

    for (id, new_node) in new {
        match old.get(id) {
            None => {
                result.added.insert(id.to_string());
            }
            Some(old_node) => {
                if !same_body(old_node, new_node) {
                    result.changed.insert(id.to_string());
                } else if old_node.wires != new_node.wires {
                    result.rewired.insert(id.to_string());
                }
            }
        }
    }
    for id in old.keys() {
        if !new.contains_key(id) {
            result.removed.insert(id.to_string());
        }
    }
    result
}

/// Compare everything except `wires`
fn same_body(a: &NodeConfig, b: &NodeConfig) -> bool {
    a.node_type == b.node_type
        && a.z == b.z
        && a.disabled == b.disabled
        && a.credentials == b.credentials
        && a.env == b.env
        && a.props == b.props
}

/// A template counts as changed when the template node or anything inside
/// it changed; every instance of it then has to be rebuilt.
fn propagate_subflows(result: &mut DiffResult, old: &FlowConfig, new: &FlowConfig) {
    let mut changed_templates = BTreeSet::new();
    for (id, template) in &new.subflows {
        if !old.subflows.contains_key(id) {
            continue;
        }
        let template_touched = result.changed.contains(id)
            || template.nodes.iter().any(|n| {
                result.added.contains(&n.id)
                    || result.changed.contains(&n.id)
                    || result.rewired.contains(&n.id)
            })
            || old.subflows[id]
                .nodes
                .iter()
                .any(|n| result.removed.contains(&n.id));
        if template_touched {
            changed_templates.insert(id.clone());
        }
    }
    if changed_templates.is_empty() {
        return;
    }

    let instances: Vec<NodeId> = new
        .nodes()
        .iter()
        .filter(|n| {
            n.subflow_template()
                .map(|t| changed_templates.contains(t))
                .unwrap_or(false)
        })
        .map(|n| n.id.clone())
        .collect();
    result.promote_changed(changed_templates.iter());
    result.promote_changed(instances.iter());
}

/// Nodes that point at a changed or removed node by id (config nodes) are
/// changed too. Repeats until no new node is pulled in.
fn propagate_references(result: &mut DiffResult, new: &FlowConfig) {
    let mut frontier: Vec<NodeId> = result
        .changed
        .iter()
        .chain(result.removed.iter())
        .cloned()
        .collect();

    while let Some(target) = frontier.pop() {
        let dependents: Vec<NodeId> = new
            .nodes()
            .iter()
            .filter(|n| n.id != target && n.references(&target))
            .filter(|n| !result.added.contains(&n.id) && !result.changed.contains(&n.id))
            .map(|n| n.id.clone())
            .collect();
        for id in dependents {
            result.promote_changed(std::iter::once(&id));
            frontier.push(id);
        }
    }
}

fn link(
    result: &mut DiffResult,
    old: &HashMap<&str, &NodeConfig>,
    new: &HashMap<&str, &NodeConfig>,
) {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for nodes in [old, new] {
        for node in nodes.values() {
            graph.add_node(node.id.as_str());
            for target in node.wired_to() {
                graph.add_edge(node.id.as_str(), target.as_str(), ());
            }
        }
    }

    let seeds: BTreeSet<&str> = result
        .added
        .iter()
        .chain(&result.changed)
        .chain(&result.removed)
        .chain(&result.rewired)
        .map(String::as_str)
        .collect();

    let mut linked = BTreeSet::new();
    for &seed in &seeds {
        if !graph.contains_node(seed) {
            continue;
        }
        let neighbours = graph
            .neighbors_directed(seed, Direction::Outgoing)
            .chain(graph.neighbors_directed(seed, Direction::Incoming));
        for n in neighbours {
            if new.contains_key(n) && !seeds.contains(&n) {
                linked.insert(n.to_string());
            }
        }
    }
    result.linked = linked;
}
