//! The range catalog: an ordered set of ranges covering the whole keyspace.
//!
//! All catalog mutations are validated, applied in memory, and written
//! through to the persister before returning. If the write fails the
//! in-memory change is rolled back and the caller sees an error; the next
//! tick re-attempts from unchanged state.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::Error;
use crate::persister::{Persister, RangeRecord};
use crate::placement::Placement;
use crate::range::{Key, NodeId, PlacementState, Range, RangeId, RangeMeta, RangeState};

/// Owner of the catalog lock. The orchestrator tick holds the lock for its
/// entire duration so every decision within a tick sees one snapshot.
pub struct Keyspace {
    catalog: Mutex<Catalog>,
}

impl Keyspace {
    /// Load the catalog from the persister, or bootstrap a single range
    /// covering the whole keyspace if the store is empty.
    pub fn open(persister: Arc<dyn Persister>) -> anyhow::Result<Self> {
        let records = persister.get_ranges()?;
        let mut catalog = Catalog {
            ranges: Vec::new(),
            next_id: 1,
            persister,
        };

        if records.is_empty() {
            let meta = RangeMeta {
                id: catalog.allocate_id(),
                start: Key::unbounded(),
                end: Key::unbounded(),
            };
            catalog.ranges.push(Range::new(meta));
            catalog.persist(&[1]).map_err(|e| anyhow::anyhow!("{e}"))?;
            tracing::info!("bootstrapped catalog with a single full-keyspace range");
        } else {
            for rec in records {
                catalog.next_id = catalog.next_id.max(rec.id + 1);
                catalog.ranges.push(range_from_record(rec));
            }
            catalog.ranges.sort_by_key(|r| r.id());
            tracing::info!(ranges = catalog.ranges.len(), "restored catalog");
        }

        Ok(Self {
            catalog: Mutex::new(catalog),
        })
    }

    /// Lock-scoped view of the catalog. Reads during a tick hold this lock.
    pub fn lock(&self) -> MutexGuard<'_, Catalog> {
        self.catalog.lock().unwrap()
    }
}

pub struct Catalog {
    ranges: Vec<Range>,
    next_id: RangeId,
    persister: Arc<dyn Persister>,
}

impl Catalog {
    fn allocate_id(&mut self) -> RangeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    pub fn range_ids(&self) -> Vec<RangeId> {
        self.ranges.iter().map(|r| r.id()).collect()
    }

    pub fn get(&self, id: RangeId) -> Result<&Range, Error> {
        self.ranges
            .iter()
            .find(|r| r.id() == id)
            .ok_or_else(|| Error::NotFound(format!("range {id}")))
    }

    pub fn get_mut(&mut self, id: RangeId) -> Result<&mut Range, Error> {
        self.ranges
            .iter_mut()
            .find(|r| r.id() == id)
            .ok_or_else(|| Error::NotFound(format!("range {id}")))
    }

    /// Split `id` at `key` into two child ranges.
    ///
    /// Requires the range to be Active with every placement Active, and the
    /// key to fall strictly inside the interval. On success the parent is
    /// Subsuming and two Active children (no placements yet) exist.
    pub fn split(&mut self, id: RangeId, key: &Key) -> Result<(RangeId, RangeId), Error> {
        if key.is_unbounded() {
            return Err(Error::TransitionRejected(
                "cannot split on the sentinel key".to_string(),
            ));
        }

        let r = self.get(id)?;
        if r.state != RangeState::Active {
            return Err(Error::TransitionRejected(format!(
                "cannot split range {id} in state {}",
                r.state
            )));
        }
        if !r.children.is_empty() {
            return Err(Error::TransitionRejected(format!(
                "range {id} already has children"
            )));
        }
        if r.placements
            .iter()
            .any(|p| p.state != PlacementState::Active)
        {
            return Err(Error::TransitionRejected(format!(
                "range {id} has non-active placements"
            )));
        }
        if !r.meta.contains(key) || (!r.meta.start.is_unbounded() && key <= &r.meta.start) {
            return Err(Error::TransitionRejected(format!(
                "split key does not fall inside range {id}"
            )));
        }

        let (start, end, policy) = {
            let r = self.get(id)?;
            (r.meta.start.clone(), r.meta.end.clone(), r.policy)
        };

        let saved_next_id = self.next_id;
        let left_id = self.allocate_id();
        let right_id = self.allocate_id();

        let mut left = Range::new(RangeMeta {
            id: left_id,
            start,
            end: key.clone(),
        });
        left.parents = vec![id];
        left.policy = policy;

        let mut right = Range::new(RangeMeta {
            id: right_id,
            start: key.clone(),
            end,
        });
        right.parents = vec![id];
        right.policy = policy;

        {
            let parent = self.get_mut(id)?;
            parent.state = RangeState::Subsuming;
            parent.children = vec![left_id, right_id];
        }
        self.ranges.push(left);
        self.ranges.push(right);

        if let Err(e) = self.persist(&[id, left_id, right_id]) {
            // Roll back: drop the children, restore the parent.
            self.ranges.retain(|r| r.id() != left_id && r.id() != right_id);
            self.next_id = saved_next_id;
            let parent = self.get_mut(id)?;
            parent.state = RangeState::Active;
            parent.children.clear();
            return Err(e);
        }

        tracing::info!(
            range = id,
            left = left_id,
            right = right_id,
            key = ?key,
            "split range"
        );
        Ok((left_id, right_id))
    }

    /// Join two adjacent Active ranges into one child.
    pub fn join(&mut self, left: RangeId, right: RangeId) -> Result<RangeId, Error> {
        for id in [left, right] {
            let r = self.get(id)?;
            if r.state != RangeState::Active {
                return Err(Error::TransitionRejected(format!(
                    "cannot join range {id} in state {}",
                    r.state
                )));
            }
            if !r.children.is_empty() {
                return Err(Error::TransitionRejected(format!(
                    "range {id} already has children"
                )));
            }
        }
        let (l_start, l_end) = {
            let r = self.get(left)?;
            (r.meta.start.clone(), r.meta.end.clone())
        };
        let (r_start, r_end, policy) = {
            let r = self.get(right)?;
            (r.meta.start.clone(), r.meta.end.clone(), r.policy)
        };
        if l_end.is_unbounded() || l_end != r_start {
            return Err(Error::TransitionRejected(format!(
                "ranges {left} and {right} are not adjacent"
            )));
        }

        let saved_next_id = self.next_id;
        let child_id = self.allocate_id();
        let mut child = Range::new(RangeMeta {
            id: child_id,
            start: l_start,
            end: r_end,
        });
        child.parents = vec![left, right];
        child.policy = policy;

        for id in [left, right] {
            let parent = self.get_mut(id)?;
            parent.state = RangeState::Subsuming;
            parent.children = vec![child_id];
        }
        self.ranges.push(child);

        if let Err(e) = self.persist(&[left, right, child_id]) {
            self.ranges.retain(|r| r.id() != child_id);
            self.next_id = saved_next_id;
            for id in [left, right] {
                let parent = self.get_mut(id)?;
                parent.state = RangeState::Active;
                parent.children.clear();
            }
            return Err(e);
        }

        tracing::info!(left, right, child = child_id, "joined ranges");
        Ok(child_id)
    }

    /// Create a Pending placement of `id` on `node`.
    pub fn add_placement(&mut self, id: RangeId, placement: Placement) -> Result<(), Error> {
        let node = placement.node.clone();
        self.get_mut(id)?.placements.push(placement);
        if let Err(e) = self.persist(&[id]) {
            self.get_mut(id)?.placements.pop();
            return Err(e);
        }
        tracing::info!(range = id, node = %node, "created placement");
        Ok(())
    }

    /// Validated placement state transition, persisted write-through.
    pub fn placement_to_state(
        &mut self,
        id: RangeId,
        idx: usize,
        new: PlacementState,
    ) -> Result<(), Error> {
        let old = {
            let p = self.placement(id, idx)?;
            p.state
        };

        use crate::range::PlacementState::*;
        let ok = matches!(
            (old, new),
            (Pending, Inactive)
                | (Pending, Missing)
                | (Pending, GiveUp)
                | (Inactive, Active)
                | (Inactive, Dropped)
                | (Inactive, Missing)
                | (Active, Inactive)
                | (Active, Missing)
                | (Missing, Dropped)
        );
        if !ok {
            return Err(Error::TransitionRejected(format!(
                "placement {old} -> {new}"
            )));
        }

        let old_desired = {
            let p = self.placement_mut(id, idx)?;
            let old_desired = p.desired;
            p.state = new;
            // Don't keep asking for a state we have already left behind.
            if p.desired == old {
                p.desired = new;
            }
            old_desired
        };
        if let Err(e) = self.persist(&[id]) {
            let p = self.placement_mut(id, idx)?;
            p.state = old;
            p.desired = old_desired;
            return Err(e);
        }

        {
            let p = self.placement_mut(id, idx)?;
            if new == Active {
                if let Some(done) = p.done.take() {
                    done.resolve(Ok(()));
                }
            }
            tracing::info!(range = id, node = %p.node, %old, %new, "placement transition");
        }
        Ok(())
    }

    /// Set the desired state the actuator should drive this placement toward.
    pub fn set_desired(
        &mut self,
        id: RangeId,
        idx: usize,
        desired: PlacementState,
    ) -> Result<(), Error> {
        let old = self.placement(id, idx)?.desired;
        if old == desired {
            return Ok(());
        }
        self.placement_mut(id, idx)?.desired = desired;
        if let Err(e) = self.persist(&[id]) {
            self.placement_mut(id, idx)?.desired = old;
            return Err(e);
        }
        Ok(())
    }

    /// Clear a stale `replacing` annotation once the replaced placement is
    /// gone from the range.
    pub fn clear_replacing(&mut self, id: RangeId, idx: usize) -> Result<(), Error> {
        let old = self.placement_mut(id, idx)?.replacing.take();
        if old.is_none() {
            return Ok(());
        }
        if let Err(e) = self.persist(&[id]) {
            self.placement_mut(id, idx)?.replacing = old;
            return Err(e);
        }
        Ok(())
    }

    /// Remove a placement that has reached a terminal state.
    pub fn destroy_placement(&mut self, id: RangeId, idx: usize) -> Result<(), Error> {
        let removed = {
            let r = self.get_mut(id)?;
            if idx >= r.placements.len() {
                return Err(Error::NotFound(format!("placement {idx} of range {id}")));
            }
            r.placements.remove(idx)
        };
        if let Err(e) = self.persist(&[id]) {
            self.get_mut(id)?.placements.insert(idx, removed);
            return Err(e);
        }
        tracing::info!(range = id, node = %removed.node, state = %removed.state, "destroyed placement");
        Ok(())
    }

    /// Remember that a placement of this range was abandoned on `node`, so
    /// candidate selection avoids it for the re-placement.
    pub fn record_failed_node(&mut self, id: RangeId, node: NodeId) -> Result<(), Error> {
        {
            let r = self.get_mut(id)?;
            if r.failed_nodes.contains(&node) {
                return Ok(());
            }
            r.failed_nodes.push(node);
        }
        if let Err(e) = self.persist(&[id]) {
            self.get_mut(id)?.failed_nodes.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Validated range state transition.
    pub fn range_to_state(&mut self, id: RangeId, new: RangeState) -> Result<(), Error> {
        let old = self.get(id)?.state;
        let ok = matches!(
            (old, new),
            (RangeState::Active, RangeState::Subsuming)
                | (RangeState::Subsuming, RangeState::Obsolete)
        );
        if !ok {
            return Err(Error::TransitionRejected(format!("range {old} -> {new}")));
        }
        self.get_mut(id)?.state = new;
        if let Err(e) = self.persist(&[id]) {
            self.get_mut(id)?.state = old;
            return Err(e);
        }
        tracing::info!(range = id, %old, %new, "range transition");
        Ok(())
    }

    pub fn placement(&self, id: RangeId, idx: usize) -> Result<&Placement, Error> {
        self.get(id)?
            .placements
            .get(idx)
            .ok_or_else(|| Error::NotFound(format!("placement {idx} of range {id}")))
    }

    pub fn placement_mut(&mut self, id: RangeId, idx: usize) -> Result<&mut Placement, Error> {
        self.get_mut(id)?
            .placements
            .get_mut(idx)
            .ok_or_else(|| Error::NotFound(format!("placement {idx} of range {id}")))
    }

    /// All `(range, placement index)` pairs currently assigned to `node`.
    pub fn placements_on(&self, node: &NodeId) -> Vec<(RangeId, usize)> {
        let mut out = Vec::new();
        for r in &self.ranges {
            for (i, p) in r.placements.iter().enumerate() {
                if &p.node == node {
                    out.push((r.id(), i));
                }
            }
        }
        out
    }

    /// Number of live placements per node, for candidate load balancing.
    pub fn placement_count(&self, node: &NodeId) -> usize {
        self.ranges
            .iter()
            .flat_map(|r| r.placements.iter())
            .filter(|p| &p.node == node && p.state != PlacementState::Dropped)
            .count()
    }

    fn persist(&self, touched: &[RangeId]) -> Result<(), Error> {
        let records: Vec<RangeRecord> = touched
            .iter()
            .filter_map(|id| self.get(*id).ok())
            .map(record_from_range)
            .collect();
        self.persister
            .put_ranges(&records)
            .map_err(|e| Error::PersistenceFailed(e.to_string()))
    }

    /// Single-line rendering of the whole catalog, ranges in id order.
    pub fn log_string(&self) -> String {
        self.ranges
            .iter()
            .map(|r| r.log_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

pub fn record_from_range(r: &Range) -> RangeRecord {
    RangeRecord {
        id: r.meta.id,
        start: r.meta.start.clone(),
        end: r.meta.end.clone(),
        state: r.state,
        parents: r.parents.clone(),
        children: r.children.clone(),
        policy: r.policy,
        failed_nodes: r.failed_nodes.clone(),
        placements: r.placements.iter().map(|p| p.record()).collect(),
    }
}

pub fn range_from_record(rec: RangeRecord) -> Range {
    let mut r = Range::new(RangeMeta {
        id: rec.id,
        start: rec.start,
        end: rec.end,
    });
    r.state = rec.state;
    r.parents = rec.parents;
    r.children = rec.children;
    r.policy = rec.policy;
    r.failed_nodes = rec.failed_nodes;
    r.placements = rec.placements.into_iter().map(Into::into).collect();
    r
}
