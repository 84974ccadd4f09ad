/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Savepoints: the change log of a transaction
//!
//! A transaction's changes are recorded in a stack of savepoints. Each
//! savepoint holds what happened since the previous one; the aggregate
//! views (`all_*`) combine them from first to last.

use std::collections::BTreeMap;

use crate::delta::RevisionDelta;
use crate::id::ObjectId;
use crate::object::CdoObject;
use crate::revision::Revision;

/// Identifies a savepoint of a transaction. Becomes invalid when the
/// savepoint is discarded (by rolling back past it or committing).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SavepointHandle {
    pub(crate) tx: u64,
    pub(crate) index: usize,
    pub(crate) serial: u64,
}

impl SavepointHandle {
    /// Position in the stack; the first savepoint is 0
    pub fn index(&self) -> usize { self.index }
}

#[derive(Clone, Default)]
pub(crate) struct Savepoint {
    pub serial: u64,
    pub new_objects: BTreeMap<ObjectId, CdoObject>,
    pub new_resources: BTreeMap<ObjectId, CdoObject>,
    /// Revisions of this savepoint's new objects as they were when the
    /// next savepoint was set
    pub base_new_revisions: BTreeMap<ObjectId, Revision>,
    pub dirty_objects: BTreeMap<ObjectId, CdoObject>,
    pub revision_deltas: BTreeMap<ObjectId, RevisionDelta>,
    pub detached_objects: BTreeMap<ObjectId, CdoObject>,
    pub reattached_objects: BTreeMap<ObjectId, CdoObject>,
    /// Dirty flag of the transaction when this savepoint was set
    pub was_dirty: bool,
}

impl Savepoint {
    fn new(serial: u64, was_dirty: bool) -> Savepoint {
        Savepoint { serial, was_dirty, ..Default::default() }
    }

    /// Forget all changes, keeping identity and dirty flag
    pub fn clear(&mut self) {
        self.new_objects.clear();
        self.new_resources.clear();
        self.base_new_revisions.clear();
        self.dirty_objects.clear();
        self.revision_deltas.clear();
        self.detached_objects.clear();
        self.reattached_objects.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.new_objects.is_empty() && self.new_resources.is_empty()
            && self.dirty_objects.is_empty() && self.revision_deltas.is_empty()
            && self.detached_objects.is_empty() && self.reattached_objects.is_empty()
    }

    /// True if `id` was created in this savepoint
    pub fn is_new(&self, id: ObjectId) -> bool {
        self.new_objects.contains_key(&id) || self.new_resources.contains_key(&id)
    }

    /// New objects and resources of this savepoint
    pub fn new_entries(&self) -> impl Iterator<Item = (&ObjectId, &CdoObject)> {
        self.new_resources.iter().chain(self.new_objects.iter())
    }
}

#[derive(Clone)]
pub(crate) struct SavepointStack {
    savepoints: Vec<Savepoint>,
    next_serial: u64,
}

impl SavepointStack {
    pub fn new() -> SavepointStack {
        SavepointStack { savepoints: vec![Savepoint::new(1, false)], next_serial: 2 }
    }

    pub fn len(&self) -> usize { self.savepoints.len() }
    pub fn get(&self, index: usize) -> Option<&Savepoint> { self.savepoints.get(index) }
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Savepoint> { self.savepoints.get_mut(index) }
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Savepoint> { self.savepoints.iter() }
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Savepoint> { self.savepoints.iter_mut() }

    pub fn last(&self) -> &Savepoint {
        let n = self.savepoints.len();
        &self.savepoints[n - 1]
    }
    pub fn last_mut(&mut self) -> &mut Savepoint {
        let n = self.savepoints.len();
        &mut self.savepoints[n - 1]
    }

    /// Push a new savepoint; return its index
    pub fn push(&mut self, was_dirty: bool) -> usize {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.savepoints.push(Savepoint::new(serial, was_dirty));
        self.savepoints.len() - 1
    }

    /// Drop all savepoints after `index`
    pub fn truncate(&mut self, index: usize) {
        self.savepoints.truncate(index + 1);
    }

    /// Discard everything and start again with a fresh first savepoint
    pub fn reset(&mut self) {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.savepoints = vec![Savepoint::new(serial, false)];
    }

    /// Check a handle still refers to a savepoint of this stack
    pub fn is_valid(&self, index: usize, serial: u64) -> bool {
        self.savepoints.get(index).map_or(false, |sp| sp.serial == serial)
    }

    /// New objects which have not been detached again
    pub fn all_new_objects(&self) -> BTreeMap<ObjectId, CdoObject> {
        let mut all = BTreeMap::new();
        for sp in &self.savepoints {
            all.extend(sp.new_objects.iter().map(|(k, v)| (*k, v.clone())));
            for id in sp.detached_objects.keys() {
                all.remove(id);
            }
        }
        all
    }

    /// New resources which have not been detached again
    pub fn all_new_resources(&self) -> BTreeMap<ObjectId, CdoObject> {
        let mut all = BTreeMap::new();
        for sp in &self.savepoints {
            all.extend(sp.new_resources.iter().map(|(k, v)| (*k, v.clone())));
            for id in sp.detached_objects.keys() {
                all.remove(id);
            }
        }
        all
    }

    /// Look up a new object or resource of any savepoint (detached or not)
    pub fn find_new(&self, id: ObjectId) -> Option<CdoObject> {
        self.savepoints.iter()
            .filter_map(|sp| sp.new_objects.get(&id).or_else(|| sp.new_resources.get(&id)))
            .next()
            .cloned()
    }

    pub fn all_base_new_revisions(&self) -> BTreeMap<ObjectId, Revision> {
        let mut all = BTreeMap::new();
        for sp in &self.savepoints {
            all.extend(sp.base_new_revisions.iter().map(|(k, v)| (*k, v.clone())));
        }
        all
    }

    /// Detached objects not re-attached since. Temporary identifiers are
    /// included only if `with_temp`.
    pub fn all_detached_objects(&self, with_temp: bool) -> BTreeMap<ObjectId, CdoObject> {
        let mut all = BTreeMap::new();
        for sp in &self.savepoints {
            for (id, obj) in &sp.detached_objects {
                if with_temp || !id.is_temporary() {
                    all.insert(*id, obj.clone());
                }
            }
            for id in sp.reattached_objects.keys() {
                all.remove(id);
            }
        }
        all
    }

    /// Find the identifier under which an object was detached
    pub fn detached_id_of(&self, object: &CdoObject) -> Option<ObjectId> {
        self.savepoints.iter().rev()
            .flat_map(|sp| sp.detached_objects.iter())
            .find(|(_, o)| o.ptr_eq(object))
            .map(|(id, _)| *id)
    }

    /// Dirty persistent objects, excluding detached ones
    pub fn all_dirty_objects(&self) -> BTreeMap<ObjectId, CdoObject> {
        let detached = self.all_detached_objects(true);
        let mut all = BTreeMap::new();
        for sp in &self.savepoints {
            for (id, obj) in sp.dirty_objects.iter().chain(sp.reattached_objects.iter()) {
                if !detached.contains_key(id) {
                    all.insert(*id, obj.clone());
                }
            }
        }
        all
    }

    /// Deltas of persistent objects merged across savepoints, excluding
    /// detached objects
    pub fn all_revision_deltas(&self) -> BTreeMap<ObjectId, RevisionDelta> {
        let detached = self.all_detached_objects(true);
        let mut all: BTreeMap<ObjectId, RevisionDelta> = BTreeMap::new();
        for sp in &self.savepoints {
            for (id, delta) in &sp.revision_deltas {
                if id.is_temporary() || detached.contains_key(id) {
                    continue;
                }
                match all.get_mut(id) {
                    Some(existing) => {
                        if existing.merge(delta).is_err() {
                            warn!("Delta {} has a different base than {}; keeping the newer", delta, existing);
                            *existing = delta.clone();
                        }
                    }
                    None => {
                        all.insert(*id, delta.clone());
                    }
                }
            }
        }
        all
    }

    /// The merged local delta of one object across all savepoints
    pub fn merged_delta(&self, id: ObjectId) -> Option<RevisionDelta> {
        let mut merged: Option<RevisionDelta> = None;
        for delta in self.savepoints.iter().filter_map(|sp| sp.revision_deltas.get(&id)) {
            match merged {
                Some(ref mut m) => {
                    if m.merge(delta).is_err() {
                        *m = delta.clone();
                    }
                }
                None => merged = Some(delta.clone()),
            }
        }
        merged
    }

    /// Remove every trace of `id` except its creation
    pub fn forget_changes(&mut self, id: ObjectId) {
        for sp in &mut self.savepoints {
            sp.dirty_objects.remove(&id);
            sp.revision_deltas.remove(&id);
            sp.detached_objects.remove(&id);
            sp.reattached_objects.remove(&id);
        }
    }
}
