// crates/flowcore/tests/diff_test.rs

use flowcore::{diff, diff_config, DiffError, FlowConfig, NodeConfig};
use proptest::prelude::*;
use std::collections::BTreeSet;

fn ids(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_removed_neighbour_leaves_rewired_source() {
    let old = vec![
        NodeConfig::new("n1", "inject").with_wires(vec![vec!["n2"]]),
        NodeConfig::new("n2", "debug"),
    ];
    let new = vec![NodeConfig::new("n1", "inject").with_wires(vec![vec![]])];

    let result = diff(&old, &new).unwrap();

    assert_eq!(result.removed, ids(&["n2"]));
    assert_eq!(result.rewired, ids(&["n1"]));
    assert!(result.added.is_empty());
    assert!(result.changed.is_empty());
    assert!(result.linked.is_empty(), "rewired wins over linked");
}

#[test]
fn test_metadata_change_counts_as_changed() {
    let old = vec![NodeConfig::new("n1", "debug").with_prop("x", 100)];
    let new = vec![NodeConfig::new("n1", "debug").with_prop("x", 140)];

    let result = diff(&old, &new).unwrap();
    assert_eq!(result.changed, ids(&["n1"]));
}

#[test]
fn test_added_node_links_upstream() {
    let old = vec![NodeConfig::new("a", "inject"), NodeConfig::new("b", "debug")];
    let new = vec![
        NodeConfig::new("a", "inject"),
        NodeConfig::new("b", "debug"),
        NodeConfig::new("c", "function").with_wires(vec![vec!["b"]]),
    ];

    let result = diff(&old, &new).unwrap();
    assert_eq!(result.added, ids(&["c"]));
    assert_eq!(result.linked, ids(&["b"]));
    assert!(!result.linked.contains("a"));
}

#[test]
fn test_missing_id_fails_whole_diff() {
    let old = vec![NodeConfig::new("a", "inject")];
    let bad: NodeConfig = serde_json::from_str(r#"{"type":"debug","wires":[]}"#).unwrap();
    let new = vec![NodeConfig::new("a", "inject"), bad];

    assert_eq!(diff(&old, &new), Err(DiffError::MissingId { index: 1 }));
}

#[test]
fn test_identical_configs_produce_empty_diff() {
    let nodes = vec![
        NodeConfig::new("a", "inject").with_wires(vec![vec!["b"]]),
        NodeConfig::new("b", "debug"),
    ];
    assert!(diff(&nodes, &nodes).unwrap().is_empty());
}

#[test]
fn test_subflow_template_change_restarts_instances() {
    let old = FlowConfig::parse(vec![
        NodeConfig::tab("t1", "Main"),
        NodeConfig::new("sf", "subflow"),
        NodeConfig::new("inner", "delay").in_flow("sf").with_prop("pause", 1),
        NodeConfig::new("inst", "subflow:sf").in_flow("t1"),
        NodeConfig::new("other", "debug").in_flow("t1"),
    ])
    .unwrap();
    let new = FlowConfig::parse(vec![
        NodeConfig::tab("t1", "Main"),
        NodeConfig::new("sf", "subflow"),
        NodeConfig::new("inner", "delay").in_flow("sf").with_prop("pause", 2),
        NodeConfig::new("inst", "subflow:sf").in_flow("t1"),
        NodeConfig::new("other", "debug").in_flow("t1"),
    ])
    .unwrap();

    let result = diff_config(&old, &new);
    assert!(result.changed.contains("inner"));
    assert!(result.changed.contains("sf"));
    assert!(result.changed.contains("inst"));
    assert!(!result.changed.contains("other"));
}

#[test]
fn test_config_node_change_restarts_users() {
    let old = FlowConfig::parse(vec![
        NodeConfig::tab("t1", "Main"),
        NodeConfig::new("broker", "api-credentials").with_prop("host", "a"),
        NodeConfig::new("client", "debug").in_flow("t1").with_prop("broker", "broker"),
        NodeConfig::new("bystander", "debug").in_flow("t1"),
    ])
    .unwrap();
    let new = FlowConfig::parse(vec![
        NodeConfig::tab("t1", "Main"),
        NodeConfig::new("broker", "api-credentials").with_prop("host", "b"),
        NodeConfig::new("client", "debug").in_flow("t1").with_prop("broker", "broker"),
        NodeConfig::new("bystander", "debug").in_flow("t1"),
    ])
    .unwrap();

    let result = diff_config(&old, &new);
    assert_eq!(result.changed, ids(&["broker", "client"]));
}

#[test]
fn test_tab_property_change_is_reported() {
    let old = FlowConfig::parse(vec![NodeConfig::tab("t1", "Main")]).unwrap();
    let new = FlowConfig::parse(vec![NodeConfig::tab("t1", "Renamed")]).unwrap();

    let result = diff_config(&old, &new);
    assert_eq!(result.flows_changed, ids(&["t1"]));
}

const POOL: [&str; 6] = ["n0", "n1", "n2", "n3", "n4", "n5"];

type NodeSketch = Option<(u8, Vec<usize>)>;

fn build(sketch: &[NodeSketch]) -> Vec<NodeConfig> {
    sketch
        .iter()
        .enumerate()
        .filter_map(|(i, entry)| {
            entry.as_ref().map(|(kind, targets)| {
                let wires: Vec<&str> = targets.iter().map(|t| POOL[*t]).collect();
                NodeConfig::new(POOL[i], if *kind == 0 { "inject" } else { "debug" })
                    .with_wires(vec![wires])
            })
        })
        .collect()
}

fn sketch_strategy() -> impl Strategy<Value = Vec<NodeSketch>> {
    prop::collection::vec(
        prop::option::of((0..2u8, prop::collection::vec(0..POOL.len(), 0..3))),
        POOL.len(),
    )
}

proptest! {
    #[test]
    fn prop_categories_are_disjoint_and_cover_all_ids(
        old_sketch in sketch_strategy(),
        new_sketch in sketch_strategy(),
    ) {
        let old = build(&old_sketch);
        let new = build(&new_sketch);
        let result = diff(&old, &new).unwrap();
        let unchanged = result.unchanged(&old, &new);

        let categories = [
            &result.added,
            &result.changed,
            &result.removed,
            &result.rewired,
            &unchanged,
        ];
        for (i, a) in categories.iter().enumerate() {
            for b in categories.iter().skip(i + 1) {
                prop_assert!(a.is_disjoint(b));
            }
        }

        let covered: BTreeSet<String> = categories.iter().flat_map(|s| s.iter().cloned()).collect();
        let all: BTreeSet<String> = old.iter().chain(new.iter()).map(|n| n.id.clone()).collect();
        prop_assert_eq!(covered, all);

        prop_assert!(result.linked.is_subset(&unchanged));
    }
}
