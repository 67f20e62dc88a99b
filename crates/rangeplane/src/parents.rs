//! Ancestry payloads for Prepare: the transitive closure of a range's parent
//! ranges, with the address and state of each of their placements, so a
//! preparing node knows every predecessor it may need to pull data from.

use std::collections::BTreeSet;

use crate::keyspace::Catalog;
use crate::range::{NodeId, PlacementState, RangeId, RangeMeta};
use crate::roster::Roster;

/// One ancestor range and where its data lives.
#[derive(Clone, Debug)]
pub struct ParentInfo {
    pub meta: RangeMeta,
    /// `(node address, placement state)` for each placement. The address is
    /// empty when the node is no longer in the roster.
    pub placements: Vec<(String, PlacementState)>,
}

/// Compute the parent closure of `id`, starting with the range itself.
pub fn parents_payload(cat: &Catalog, roster: &Roster, id: RangeId) -> Vec<ParentInfo> {
    let mut out = Vec::new();
    let mut seen = BTreeSet::new();
    add_parents(cat, roster, id, &mut out, &mut seen);
    out
}

fn add_parents(
    cat: &Catalog,
    roster: &Roster,
    id: RangeId,
    out: &mut Vec<ParentInfo>,
    seen: &mut BTreeSet<RangeId>,
) {
    if !seen.insert(id) {
        return;
    }
    let Ok(r) = cat.get(id) else { return };

    out.push(ParentInfo {
        meta: r.meta.clone(),
        placements: r
            .placements
            .iter()
            .map(|p| (resolve_addr(roster, &p.node), p.state))
            .collect(),
    });

    for &parent in &r.parents {
        add_parents(cat, roster, parent, out, seen);
    }
}

fn resolve_addr(roster: &Roster, node: &NodeId) -> String {
    roster.addr_of(node).unwrap_or_default()
}
