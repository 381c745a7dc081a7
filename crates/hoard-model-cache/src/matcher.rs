//! Node-group membership resolution
//!
//! A CacheNodeGroup declares its member nodes through the node affinity on
//! its PersistentVolume template. Matching follows node-selector semantics:
//! terms are ORed, the expressions inside a term are ANDed, and a group with
//! no affinity (or no terms) matches every node in the cluster.

use k8s_openapi::api::core::v1::{Node, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm};
use std::collections::BTreeMap;

use hoard_common::crd::CacheNodeGroupSpec;
use hoard_common::kube_utils::is_node_ready;

/// Does this node belong to the group?
///
/// Pure predicate over the node's current labels and name; no API calls.
pub fn node_matches_group(group: &CacheNodeGroupSpec, node: &Node) -> bool {
    let selector = group
        .persistent_volume
        .node_affinity
        .as_ref()
        .and_then(|a| a.required.as_ref());

    match selector {
        Some(selector) => matches_selector(selector, node),
        None => true,
    }
}

/// Split a node list into the group's (ready, not-ready) members.
///
/// Nodes outside the group are dropped. Readiness is the standard node
/// `Ready` condition.
pub fn partition_group_nodes<'a>(
    group: &CacheNodeGroupSpec,
    nodes: &'a [Node],
) -> (Vec<&'a Node>, Vec<&'a Node>) {
    nodes
        .iter()
        .filter(|n| node_matches_group(group, n))
        .partition(|n| is_node_ready(n))
}

fn matches_selector(selector: &NodeSelector, node: &Node) -> bool {
    // No terms means no constraint at all.
    if selector.node_selector_terms.is_empty() {
        return true;
    }
    selector
        .node_selector_terms
        .iter()
        .any(|term| matches_term(term, node))
}

fn matches_term(term: &NodeSelectorTerm, node: &Node) -> bool {
    let empty = BTreeMap::new();
    let labels = node.metadata.labels.as_ref().unwrap_or(&empty);

    let expressions_ok = term
        .match_expressions
        .iter()
        .flatten()
        .all(|req| matches_requirement(req, labels.get(&req.key).map(String::as_str)));

    // The only supported field selector is metadata.name, same as upstream
    // scheduling semantics.
    let fields_ok = term.match_fields.iter().flatten().all(|req| {
        let value = match req.key.as_str() {
            "metadata.name" => node.metadata.name.as_deref(),
            _ => None,
        };
        matches_requirement(req, value)
    });

    expressions_ok && fields_ok
}

fn matches_requirement(req: &NodeSelectorRequirement, value: Option<&str>) -> bool {
    let values = req.values.as_deref().unwrap_or(&[]);
    match req.operator.as_str() {
        "In" => value.is_some_and(|v| values.iter().any(|x| x == v)),
        "NotIn" => value.is_none_or(|v| !values.iter().any(|x| x == v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        "Gt" => compare_numeric(value, values, |node, bound| node > bound),
        "Lt" => compare_numeric(value, values, |node, bound| node < bound),
        _ => false,
    }
}

fn compare_numeric(value: Option<&str>, values: &[String], cmp: fn(i64, i64) -> bool) -> bool {
    let (Some(value), [bound]) = (value, values) else {
        return false;
    };
    match (value.parse::<i64>(), bound.parse::<i64>()) {
        (Ok(v), Ok(b)) => cmp(v, b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        NodeCondition, NodeStatus, PersistentVolumeClaimSpec, PersistentVolumeSpec,
        VolumeNodeAffinity,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn node(name: &str, labels: &[(&str, &str)], ready: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn group_with_selector(selector: Option<NodeSelector>) -> CacheNodeGroupSpec {
        CacheNodeGroupSpec {
            storage_limit: "1Ti".to_string(),
            persistent_volume: PersistentVolumeSpec {
                node_affinity: selector.map(|s| VolumeNodeAffinity { required: Some(s) }),
                ..Default::default()
            },
            persistent_volume_claim: PersistentVolumeClaimSpec::default(),
        }
    }

    fn requirement(key: &str, operator: &str, values: &[&str]) -> NodeSelectorRequirement {
        NodeSelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    fn selector_of(expressions: Vec<NodeSelectorRequirement>) -> NodeSelector {
        NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(expressions),
                match_fields: None,
            }],
        }
    }

    #[test]
    fn absent_affinity_matches_every_node() {
        let group = group_with_selector(None);
        assert!(node_matches_group(&group, &node("n1", &[], true)));
    }

    #[test]
    fn empty_term_list_matches_every_node() {
        let group = group_with_selector(Some(NodeSelector {
            node_selector_terms: vec![],
        }));
        assert!(node_matches_group(&group, &node("n1", &[], true)));
    }

    #[test]
    fn in_operator_requires_listed_value() {
        let group = group_with_selector(Some(selector_of(vec![requirement(
            "zone",
            "In",
            &["a", "b"],
        )])));
        assert!(node_matches_group(&group, &node("n1", &[("zone", "a")], true)));
        assert!(!node_matches_group(&group, &node("n2", &[("zone", "c")], true)));
        assert!(!node_matches_group(&group, &node("n3", &[], true)));
    }

    #[test]
    fn not_in_matches_absent_label() {
        let group =
            group_with_selector(Some(selector_of(vec![requirement("zone", "NotIn", &["a"])])));
        assert!(node_matches_group(&group, &node("n1", &[], true)));
        assert!(node_matches_group(&group, &node("n2", &[("zone", "b")], true)));
        assert!(!node_matches_group(&group, &node("n3", &[("zone", "a")], true)));
    }

    #[test]
    fn exists_and_does_not_exist() {
        let gpu = group_with_selector(Some(selector_of(vec![requirement("gpu", "Exists", &[])])));
        assert!(node_matches_group(&gpu, &node("n1", &[("gpu", "a100")], true)));
        assert!(!node_matches_group(&gpu, &node("n2", &[], true)));

        let no_gpu =
            group_with_selector(Some(selector_of(vec![requirement("gpu", "DoesNotExist", &[])])));
        assert!(node_matches_group(&no_gpu, &node("n3", &[], true)));
        assert!(!node_matches_group(&no_gpu, &node("n4", &[("gpu", "a100")], true)));
    }

    #[test]
    fn gt_and_lt_parse_numeric_labels() {
        let group =
            group_with_selector(Some(selector_of(vec![requirement("gpus", "Gt", &["2"])])));
        assert!(node_matches_group(&group, &node("n1", &[("gpus", "4")], true)));
        assert!(!node_matches_group(&group, &node("n2", &[("gpus", "2")], true)));
        assert!(!node_matches_group(&group, &node("n3", &[("gpus", "many")], true)));

        let lt = group_with_selector(Some(selector_of(vec![requirement("gpus", "Lt", &["2"])])));
        assert!(node_matches_group(&lt, &node("n4", &[("gpus", "1")], true)));
        assert!(!node_matches_group(&lt, &node("n5", &[], true)));
    }

    #[test]
    fn expressions_in_a_term_are_anded() {
        let group = group_with_selector(Some(selector_of(vec![
            requirement("zone", "In", &["a"]),
            requirement("gpu", "Exists", &[]),
        ])));
        assert!(node_matches_group(
            &group,
            &node("n1", &[("zone", "a"), ("gpu", "a100")], true)
        ));
        assert!(!node_matches_group(&group, &node("n2", &[("zone", "a")], true)));
    }

    #[test]
    fn terms_are_ored() {
        let group = group_with_selector(Some(NodeSelector {
            node_selector_terms: vec![
                NodeSelectorTerm {
                    match_expressions: Some(vec![requirement("zone", "In", &["a"])]),
                    match_fields: None,
                },
                NodeSelectorTerm {
                    match_expressions: Some(vec![requirement("zone", "In", &["b"])]),
                    match_fields: None,
                },
            ],
        }));
        assert!(node_matches_group(&group, &node("n1", &[("zone", "a")], true)));
        assert!(node_matches_group(&group, &node("n2", &[("zone", "b")], true)));
        assert!(!node_matches_group(&group, &node("n3", &[("zone", "c")], true)));
    }

    #[test]
    fn match_fields_select_by_node_name() {
        let group = group_with_selector(Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: None,
                match_fields: Some(vec![requirement("metadata.name", "In", &["n1"])]),
            }],
        }));
        assert!(node_matches_group(&group, &node("n1", &[], true)));
        assert!(!node_matches_group(&group, &node("n2", &[], true)));
    }

    #[test]
    fn partition_separates_ready_from_not_ready() {
        let group =
            group_with_selector(Some(selector_of(vec![requirement("zone", "In", &["a"])])));
        let nodes = vec![
            node("n1", &[("zone", "a")], true),
            node("n2", &[("zone", "a")], false),
            node("n3", &[("zone", "b")], true),
        ];
        let (ready, not_ready) = partition_group_nodes(&group, &nodes);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].metadata.name.as_deref(), Some("n1"));
        assert_eq!(not_ready.len(), 1);
        assert_eq!(not_ready[0].metadata.name.as_deref(), Some("n2"));
    }
}
