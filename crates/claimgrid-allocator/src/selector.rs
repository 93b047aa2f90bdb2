//! Node selector matching.
//!
//! Terms are ORed, requirements within a term are ANDed. A selector with
//! no terms matches no node; an absent selector (on an allocation) matches
//! every node.

use claimgrid_state::{
    NODE_NAME_FIELD, Node, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    SelectorOperator,
};

/// Whether `node` satisfies `selector`.
pub fn node_matches(selector: &NodeSelector, node: &Node) -> bool {
    selector.terms.iter().any(|term| term_matches(term, node))
}

/// Whether `node` satisfies an optional allocation constraint.
pub fn allocation_available_on(selector: Option<&NodeSelector>, node: &Node) -> bool {
    selector.is_none_or(|s| node_matches(s, node))
}

fn term_matches(term: &NodeSelectorTerm, node: &Node) -> bool {
    if term.match_labels.is_empty() && term.match_fields.is_empty() {
        return false;
    }
    let labels_ok = term
        .match_labels
        .iter()
        .all(|req| requirement_matches(req, node.labels.get(&req.key).map(String::as_str)));
    let fields_ok = term.match_fields.iter().all(|req| {
        let value = (req.key == NODE_NAME_FIELD).then_some(node.name.as_str());
        // Unknown field keys never match.
        req.key == NODE_NAME_FIELD && requirement_matches(req, value)
    });
    labels_ok && fields_ok
}

fn requirement_matches(req: &NodeSelectorRequirement, value: Option<&str>) -> bool {
    match req.operator {
        SelectorOperator::In => value.is_some_and(|v| req.values.iter().any(|x| x == v)),
        SelectorOperator::NotIn => value.is_none_or(|v| req.values.iter().all(|x| x != v)),
        SelectorOperator::Exists => value.is_some(),
        SelectorOperator::DoesNotExist => value.is_none(),
    }
}
