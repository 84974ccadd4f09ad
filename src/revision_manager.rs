/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Session-level revision cache

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use vec_map::VecMap;

use crate::branch::{BranchId, BranchManager, BranchPoint, BranchVersion};
use crate::error::Result;
use crate::id::ObjectId;
use crate::revision::Revision;
use crate::revision_info::RevisionInfo;
use crate::store::RevisionStore;

// Revisions of one object on one branch
#[derive(Default)]
struct RevisionList {
    versions: VecMap<Revision>,
    pointers: Vec<Revision>,
}

impl RevisionList {
    fn find(&self, time: i64) -> Option<&Revision> {
        self.versions.values().rev().find(|r| r.is_valid_at(time))
            .or_else(|| self.pointers.iter().find(|r| r.is_valid_at(time)))
    }
}

/// Caches revisions by object, branch and version, and resolves objects
/// at branch points, asking the repository only when the cache cannot
/// answer.
pub struct RevisionManager {
    store: Arc<dyn RevisionStore>,
    branches: Arc<BranchManager>,
    capacity: usize,
    cache: Mutex<HashMap<(ObjectId, BranchId), RevisionList>>,
}

impl RevisionManager {
    /// Create. `capacity` is the maximum number of versions kept per object
    /// and branch (at least one).
    pub fn new(store: Arc<dyn RevisionStore>, capacity: usize) -> RevisionManager {
        let branches = store.branches();
        RevisionManager {
            store,
            branches,
            capacity: capacity.max(1),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<HashMap<(ObjectId, BranchId), RevisionList>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a revision (normal, pointer or detached) to the cache
    pub fn add_revision(&self, revision: Revision) {
        let mut cache = self.lock();
        let list = cache.entry((revision.id(), revision.branch())).or_insert_with(Default::default);
        if revision.is_pointer() {
            if !list.pointers.contains(&revision) {
                list.pointers.push(revision);
                if list.pointers.len() > self.capacity {
                    list.pointers.remove(0);
                }
            }
            return;
        }
        let version = revision.version() as usize;
        let mut revision = revision;
        if let Some(existing) = list.versions.get(version) {
            // never forget that a version was superseded
            if revision.is_current() && !existing.is_current() {
                revision.set_revised(existing.revised());
            }
        }
        trace!("Caching revision {}", revision);
        list.versions.insert(version, revision);
        while list.versions.len() > self.capacity {
            let oldest = list.versions.keys().next();
            match oldest {
                Some(key) => { list.versions.remove(key); }
                None => break,
            }
        }
    }

    /// Get a cached revision of `id` on the branch of `point`, valid at its
    /// time
    pub fn cached_revision(&self, id: ObjectId, point: BranchPoint) -> Option<Revision> {
        self.lock().get(&(id, point.branch)).and_then(|l| l.find(point.time)).cloned()
    }

    /// Get a cached revision valid at `point` or, failing that, at the base
    /// of its branch, and so on towards the main branch
    pub fn cached_revision_recursively(&self, id: ObjectId, point: BranchPoint) -> Option<Revision> {
        let path = self.branches.path_to_main(point);
        let cache = self.lock();
        path.iter()
            .filter_map(|bp| cache.get(&(id, bp.branch)).and_then(|l| l.find(bp.time)))
            .next()
            .cloned()
    }

    /// Get a cached revision by branch version
    pub fn cached_revision_by_version(&self, id: ObjectId, bv: BranchVersion) -> Option<Revision> {
        self.lock().get(&(id, bv.branch))
            .and_then(|l| l.versions.get(bv.version as usize))
            .cloned()
    }

    /// Get a revision by branch version, loading it if not cached
    pub fn revision_by_version(&self, id: ObjectId, bv: BranchVersion) -> Result<Option<Revision>> {
        if let Some(rev) = self.cached_revision_by_version(id, bv) {
            return Ok(Some(rev));
        }
        let rev = self.store.revision_by_version(id, bv)?;
        if let Some(ref rev) = rev {
            self.add_revision(rev.clone());
        }
        Ok(rev)
    }

    /// Build the lookup request for `id` at `point` from cached data
    pub fn create_revision_info(&self, id: ObjectId, point: BranchPoint) -> RevisionInfo {
        match self.cached_revision_recursively(id, point) {
            Some(rev) => {
                let target = rev.target().and_then(|bv| self.cached_revision_by_version(id, bv));
                RevisionInfo::available(point, rev, target)
            }
            None => RevisionInfo::missing(id, point),
        }
    }

    /// Resolve one object at a branch point. `None` if the object does not
    /// exist there (never created, or detached).
    pub fn revision(&self, id: ObjectId, point: BranchPoint) -> Result<Option<Revision>> {
        let mut revs = self.revisions(&[id], point)?;
        Ok(revs.pop().and_then(|r| r))
    }

    /// Resolve a batch of objects at a branch point. Only requests which
    /// the cache cannot answer go to the repository, in one round trip.
    pub fn revisions(&self, ids: &[ObjectId], point: BranchPoint) -> Result<Vec<Option<Revision>>> {
        let mut infos: Vec<RevisionInfo> = ids.iter()
            .map(|id| self.create_revision_info(*id, point))
            .collect();
        let mut to_load: Vec<RevisionInfo> = infos.iter()
            .filter(|info| info.is_load_needed())
            .cloned()
            .collect();
        if !to_load.is_empty() {
            debug!("Loading {} of {} revisions at {}", to_load.len(), infos.len(), point);
            self.store.load_revisions(&mut to_load)?;
            let mut loaded = to_load.into_iter();
            for info in infos.iter_mut().filter(|info| info.is_load_needed()) {
                if let Some(l) = loaded.next() {
                    *info = l;
                }
            }
        }
        Ok(infos.iter_mut().map(|info| info.process_result(self)).collect())
    }

    /// Mark all current cached revisions of `id` on `branch` as superseded
    /// at `time`
    pub fn mark_revised(&self, id: ObjectId, branch: BranchId, time: i64) {
        let mut cache = self.lock();
        if let Some(list) = cache.get_mut(&(id, branch)) {
            for rev in list.versions.values_mut().chain(list.pointers.iter_mut()) {
                if rev.is_current() {
                    trace!("Revision {} revised at {}", rev, time);
                    rev.set_revised(time);
                }
            }
        }
    }

    /// The branch manager used for resolution
    pub fn branches(&self) -> &Arc<BranchManager> { &self.branches }
}
