//! The operation coordinator: gates placement transitions during a split or
//! join so the keyspace cover never develops a hole or a double-active key.
//!
//! Operations are not stored; they are reconstructed each tick from the
//! parent/child links of Subsuming ranges. Direction is derived too: an
//! operation runs forward (parents relinquish to children) until a child
//! placement exhausts its activation budget, at which point it is inverted
//! (children relinquish back to parents) until the failed placement has been
//! dropped and destroyed.

use std::collections::BTreeMap;

use crate::keyspace::Catalog;
use crate::range::{Action, PlacementState, RangeId, RangeState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Split,
    Join,
}

/// One in-flight split or join.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operation {
    pub kind: OpKind,
    pub parents: Vec<RangeId>,
    pub children: Vec<RangeId>,
    pub inverted: bool,
}

impl Operation {
    /// Reconstruct the in-flight operations from the catalog: one per group
    /// of Subsuming parents sharing the same children.
    pub fn list(cat: &Catalog, max_failures: u8) -> Vec<Operation> {
        let mut by_children: BTreeMap<Vec<RangeId>, Operation> = BTreeMap::new();

        for r in cat.ranges() {
            if r.state != RangeState::Subsuming {
                continue;
            }
            let entry = by_children
                .entry(r.children.clone())
                .or_insert_with(|| Operation {
                    kind: OpKind::Split,
                    parents: Vec::new(),
                    children: r.children.clone(),
                    inverted: false,
                });
            entry.parents.push(r.id());
        }

        let mut ops: Vec<Operation> = by_children.into_values().collect();
        for op in &mut ops {
            op.parents.sort_unstable();
            op.kind = if op.children.len() > 1 {
                OpKind::Split
            } else {
                OpKind::Join
            };
            op.inverted = op.children.iter().any(|&c| {
                cat.get(c)
                    .map(|r| {
                        r.placements
                            .iter()
                            .any(|p| p.failed(Action::Activate, max_failures))
                    })
                    .unwrap_or(false)
            });
        }
        ops.sort_by(|a, b| a.parents.cmp(&b.parents));
        ops
    }

    /// Participant ranges, parents first.
    pub fn ranges(&self) -> Vec<RangeId> {
        let mut out = self.parents.clone();
        out.extend_from_slice(&self.children);
        out
    }

    /// If every parent placement has been dropped and destroyed and every
    /// child serves, retire the parents and resolve the operator handle.
    /// Returns whether the operation completed.
    pub fn check_complete(&self, cat: &mut Catalog) -> bool {
        let parents_clear = self
            .parents
            .iter()
            .all(|&id| cat.get(id).map(|r| r.placements.is_empty()).unwrap_or(false));
        let children_serving = self.children.iter().all(|&id| {
            cat.get(id)
                .map(|r| r.has_placement_in(PlacementState::Active))
                .unwrap_or(false)
        });
        if !parents_clear || !children_serving {
            return false;
        }

        for &id in &self.parents {
            if let Err(e) = cat.range_to_state(id, RangeState::Obsolete) {
                tracing::warn!(range = id, error = %e, "could not retire parent range");
                return false;
            }
        }
        for &id in &self.parents {
            if let Ok(r) = cat.get_mut(id) {
                if let Some(done) = r.done.take() {
                    done.resolve(Ok(()));
                }
            }
        }
        tracing::info!(op = %self.log_string(), "operation complete");
        true
    }

    /// `{Split 1 -> 2,3}`, or `{Split 1 <- 2,3}` while inverted.
    pub fn log_string(&self) -> String {
        let kind = match self.kind {
            OpKind::Split => "Split",
            OpKind::Join => "Join",
        };
        let arrow = if self.inverted { "<-" } else { "->" };
        let parents = self
            .parents
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let children = self
            .children
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!("{{{kind} {parents} {arrow} {children}}}")
    }
}

/// Render all in-flight operations, for logs and tests.
pub fn ops_string(cat: &Catalog, max_failures: u8) -> String {
    Operation::list(cat, max_failures)
        .iter()
        .map(|op| op.log_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// May this placement activate without creating a second authority for any
/// of its keys?
pub fn may_activate(
    op: Option<&Operation>,
    cat: &Catalog,
    id: RangeId,
    idx: usize,
    max_failures: u8,
) -> bool {
    let Ok(r) = cat.get(id) else { return false };
    let Some(p) = r.placements.get(idx) else {
        return false;
    };

    if p.failed(Action::Activate, max_failures) {
        return false;
    }
    // Only one placement of a range serves at a time.
    if r.placements
        .iter()
        .enumerate()
        .any(|(i, q)| i != idx && q.state == PlacementState::Active)
    {
        return false;
    }
    // A replacement waits for the placement it replaces to step down.
    if let Some(src) = &p.replacing {
        if r.placements
            .iter()
            .any(|q| &q.node == src && q.state == PlacementState::Active)
        {
            return false;
        }
    }
    // A placement being replaced stays down; it only reclaims its range if
    // the replacement has given up.
    if let Some(replacement) = r.placements.iter().enumerate().find_map(|(i, q)| {
        (i != idx && q.replacing.as_deref() == Some(p.node.as_str())).then_some(q)
    }) {
        let replacement_dead = replacement.failed(Action::Activate, max_failures)
            || matches!(
                replacement.state,
                PlacementState::Missing | PlacementState::Dropped | PlacementState::GiveUp
            );
        if !replacement_dead {
            return false;
        }
    }

    match op {
        None => true,
        Some(op) if !op.inverted && op.children.contains(&id) => {
            // Every predecessor must have relinquished first.
            none_active(cat, &op.parents)
        }
        Some(op) if op.inverted && op.parents.contains(&id) => {
            // Restoring the predecessor: successors must have relinquished.
            none_active(cat, &op.children)
        }
        Some(_) => false,
    }
}

/// May this placement stop serving without leaving a coverage hole?
pub fn may_deactivate(
    op: Option<&Operation>,
    cat: &Catalog,
    id: RangeId,
    idx: usize,
    _max_failures: u8,
) -> bool {
    let Ok(r) = cat.get(id) else { return false };
    let Some(p) = r.placements.get(idx) else {
        return false;
    };

    match op {
        None => {
            // Only step down for a replacement that is prepared to take over.
            r.placements.iter().any(|q| {
                q.replacing.as_deref() == Some(p.node.as_str())
                    && matches!(q.state, PlacementState::Inactive | PlacementState::Active)
            })
        }
        Some(op) if !op.inverted && op.parents.contains(&id) => {
            all_prepared(cat, &op.children)
        }
        Some(op) if op.inverted && op.children.contains(&id) => {
            all_prepared(cat, &op.parents)
        }
        Some(_) => false,
    }
}

/// May this placement be dropped (its data discarded from the node)?
pub fn may_drop(
    op: Option<&Operation>,
    cat: &Catalog,
    id: RangeId,
    idx: usize,
    max_failures: u8,
) -> bool {
    let Ok(r) = cat.get(id) else { return false };
    let Some(p) = r.placements.get(idx) else {
        return false;
    };

    match op {
        None => {
            // Replaced and the replacement serves: the move is done.
            let superseded = r.placements.iter().any(|q| {
                q.replacing.as_deref() == Some(p.node.as_str())
                    && q.state == PlacementState::Active
            });
            // Or this is a replacement whose source refuses to step down:
            // the move is abandoned and the prepared copy discarded.
            let abandoned = p.replacing.as_ref().is_some_and(|src| {
                r.placements
                    .iter()
                    .any(|q| &q.node == src && q.failed(Action::Deactivate, max_failures))
            });
            // Or activation was exhausted: discard so the range can be
            // placed somewhere else.
            let gave_up = p.failed(Action::Activate, max_failures);
            superseded || abandoned || gave_up
        }
        Some(op) if !op.inverted && op.parents.contains(&id) => {
            // Parents drop once every successor serves.
            all_serving(cat, &op.children)
        }
        Some(op) if op.inverted && op.children.contains(&id) => {
            // Only the placement that failed to activate is discarded, and
            // only after the predecessors serve again.
            p.failed(Action::Activate, max_failures) && all_serving(cat, &op.parents)
        }
        Some(_) => false,
    }
}

fn none_active(cat: &Catalog, ids: &[RangeId]) -> bool {
    ids.iter().all(|&id| {
        cat.get(id)
            .map(|r| !r.has_placement_in(PlacementState::Active))
            .unwrap_or(false)
    })
}

fn all_prepared(cat: &Catalog, ids: &[RangeId]) -> bool {
    ids.iter().all(|&id| {
        cat.get(id)
            .map(|r| {
                r.placements.iter().any(|p| {
                    matches!(p.state, PlacementState::Inactive | PlacementState::Active)
                })
            })
            .unwrap_or(false)
    })
}

fn all_serving(cat: &Catalog, ids: &[RangeId]) -> bool {
    ids.iter().all(|&id| {
        cat.get(id)
            .map(|r| r.has_placement_in(PlacementState::Active))
            .unwrap_or(false)
    })
}
