/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! An in-memory repository

use std::collections::HashMap;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::branch::{BranchId, BranchManager, BranchPoint, BranchVersion, UNSPECIFIED_DATE};
use crate::error::{Result, StoreError};
use crate::id::{IdMapper, ObjectId};
use crate::package::{PackageRegistry, PackageState};
use crate::readwrite::{DataInput, DataOutput};
use crate::revision::Revision;
use crate::revision_info::RevisionInfo;
use super::{Clock, CommitRequest, CommitResult, Invalidation, LockOwner, RevisionStore,
        SessionId, Subscription, SystemClock};

struct StoreState {
    // Revisions of one object on one branch, in version order
    revisions: HashMap<(ObjectId, BranchId), Vec<Revision>>,
    next_id: u64,
    sequence: u64,
    last_commit: i64,
    packages: PackageRegistry,
    locks: HashMap<(ObjectId, BranchId), LockOwner>,
    subscribers: HashMap<SessionId, Sender<Invalidation>>,
    next_session: u64,
}

/// A complete repository held in memory.
///
/// Lookups go through the binary `RevisionInfo` encoding, as they would
/// over a connection.
pub struct MemoryStore {
    name: String,
    branches: Arc<BranchManager>,
    clock: Box<dyn Clock>,
    state: Mutex<StoreState>,
}

impl MemoryStore {
    /// Create an empty repository using the system clock
    pub fn new() -> MemoryStore {
        MemoryStore::with_clock(Box::new(SystemClock))
    }

    /// Create an empty repository using the given clock
    pub fn with_clock(clock: Box<dyn Clock>) -> MemoryStore {
        let name = format!("mem-{:08x}", rand::random::<u32>());
        // Identifiers of different repositories should not collide
        let first_id = u64::from(rand::random::<u16>()) << 32 | 1;
        info!("Creating memory repository {} (first id L{})", name, first_id);
        MemoryStore {
            name,
            branches: Arc::new(BranchManager::new()),
            clock,
            state: Mutex::new(StoreState {
                revisions: HashMap::new(),
                next_id: first_id,
                sequence: 0,
                last_commit: UNSPECIFIED_DATE,
                packages: PackageRegistry::new(),
                locks: HashMap::new(),
                subscribers: HashMap::new(),
                next_session: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a branch forked from `base` (which must name a time). The
    /// current commit time is used if `base` is a head point.
    pub fn create_branch(&self, name: &str, base: BranchPoint) -> Result<BranchId> {
        let base = if base.is_head() {
            let time = self.lock().last_commit.max(1);
            base.branch.point(time)
        } else {
            base
        };
        Ok(self.branches.create_branch(name, base)?.id())
    }

    /// Sequence number of the last commit
    pub fn last_sequence(&self) -> u64 {
        self.lock().sequence
    }

    /// Time of the last commit
    pub fn last_commit_time(&self) -> i64 {
        self.lock().last_commit
    }

    /// True if the repository knows the package
    pub fn has_package(&self, uri: &str) -> bool {
        self.lock().packages.state(uri) == Some(PackageState::Loaded)
    }

    fn resolve(&self, state: &StoreState, id: ObjectId, point: BranchPoint)
            -> (Option<Revision>, Option<Revision>)
    {
        let path = self.branches.path_to_main(point);
        for (i, bp) in path.iter().enumerate() {
            let found = state.revisions.get(&(id, bp.branch))
                .and_then(|list| list.iter().rev().find(|r| r.is_valid_at(bp.time)));
            let rev = match found {
                Some(rev) => rev,
                None => continue,
            };
            if i == 0 {
                return if rev.is_detached() {
                    (None, Some(rev.clone()))
                } else {
                    (Some(rev.clone()), None)
                };
            }
            // Unchanged on the requested branch until its first own version
            let revised = state.revisions.get(&(id, point.branch))
                .and_then(|list| list.iter().find(|r| point.is_head() || r.created() > point.time))
                .map(|r| r.created() - 1)
                .unwrap_or(UNSPECIFIED_DATE);
            let (result, target) = if rev.is_detached() {
                (None, None)
            } else {
                (Some(rev.clone()), Some(rev.branch_version()))
            };
            let pointer = Revision::pointer(id, point.branch, UNSPECIFIED_DATE, revised, target);
            return (result, Some(pointer));
        }
        (None, None)
    }

    fn serve_lookup(&self, info: &RevisionInfo) -> Result<Vec<u8>> {
        let mut request = Vec::new();
        info.write(&mut DataOutput::new(&mut request))?;
        let mut r = &request[..];
        let mut server_info = RevisionInfo::read(&mut DataInput::new(&mut r), info.requested())?;
        server_info.execute(self)?;
        let mut response = Vec::new();
        server_info.write_result(&mut DataOutput::new(&mut response))?;
        Ok(response)
    }

    fn check_lock(state: &StoreState, owner: LockOwner, key: (ObjectId, BranchId), locked: &mut Vec<ObjectId>) {
        if let Some(holder) = state.locks.get(&key) {
            if *holder != owner {
                locked.push(key.0);
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self { MemoryStore::new() }
}

impl RevisionStore for MemoryStore {
    fn name(&self) -> &str { &self.name }

    fn branches(&self) -> Arc<BranchManager> { self.branches.clone() }

    fn open_session(&self) -> SessionId {
        let mut state = self.lock();
        let id = SessionId(state.next_session);
        state.next_session += 1;
        info!("Repository {}: opened session {}", self.name, id);
        id
    }

    fn revision(&self, id: ObjectId, point: BranchPoint, with_synthetics: bool)
            -> Result<(Option<Revision>, Option<Revision>)>
    {
        if !self.branches.contains(point.branch) {
            return Err(StoreError::UnknownBranch(point.branch.0).into());
        }
        let state = self.lock();
        let (result, synthetic) = self.resolve(&state, id, point);
        Ok((result, if with_synthetics { synthetic } else { None }))
    }

    fn revision_by_version(&self, id: ObjectId, bv: BranchVersion) -> Result<Option<Revision>> {
        let state = self.lock();
        Ok(state.revisions.get(&(id, bv.branch))
            .and_then(|list| list.iter().find(|r| r.version() == bv.version))
            .cloned())
    }

    fn load_revisions(&self, infos: &mut [RevisionInfo]) -> Result<()> {
        for info in infos.iter_mut() {
            let response = self.serve_lookup(info)?;
            let mut r = &response[..];
            info.read_result(&mut DataInput::new(&mut r))?;
        }
        Ok(())
    }

    fn commit(&self, request: CommitRequest) -> Result<CommitResult, StoreError> {
        let branch = request.branch;
        if !self.branches.contains(branch) {
            return Err(StoreError::UnknownBranch(branch.0));
        }
        let mut state = self.lock();

        let mut locked = vec![];
        for delta in &request.deltas {
            MemoryStore::check_lock(&state, request.owner, (delta.id(), branch), &mut locked);
        }
        for &(id, _) in &request.detached {
            MemoryStore::check_lock(&state, request.owner, (id, branch), &mut locked);
        }
        if !locked.is_empty() {
            return Err(StoreError::Locked(locked));
        }

        // Optimistic check: every change must be against the current version
        let mut conflicts = vec![];
        let mut bases = HashMap::new();
        let head = branch.head();
        let changed = request.deltas.iter().map(|d| (d.id(), d.base()))
            .chain(request.detached.iter().cloned());
        for (id, base) in changed {
            match self.resolve(&state, id, head).0 {
                Some(ref cur) if cur.branch_version() == base => {
                    bases.insert(id, cur.clone());
                }
                _ => conflicts.push(id),
            }
        }
        if !conflicts.is_empty() {
            debug!("Repository {}: commit rejected, {} conflicts", self.name, conflicts.len());
            return Err(StoreError::Conflict(conflicts));
        }

        let mut id_mappings = IdMapper::new();
        for rev in &request.new_revisions {
            if rev.id().is_temporary() {
                id_mappings.insert(rev.id(), ObjectId::Persistent(state.next_id));
                state.next_id += 1;
            }
        }

        let timestamp = self.clock.now().max(state.last_commit + 1);

        // Compute all new revisions before changing anything
        let mut created = Vec::with_capacity(request.new_revisions.len() + request.deltas.len());
        for rev in &request.new_revisions {
            let mut rev = rev.copy();
            rev.adjust_references(&id_mappings);
            rev.set_branch_version(branch.version(1));
            rev.set_created(timestamp);
            rev.set_revised(UNSPECIFIED_DATE);
            created.push(rev);
        }
        let mut deltas = Vec::with_capacity(request.deltas.len());
        for delta in &request.deltas {
            let mut delta = delta.clone();
            delta.adjust_references(&id_mappings);
            let mut rev = match bases.get(&delta.id()) {
                Some(base) => base.copy(),
                None => return Err(StoreError::NotFound(delta.id())),
            };
            delta.apply(&mut rev).map_err(|e| StoreError::Transport(format!("cannot apply {}: {}", delta, e)))?;
            rev.adjust_for_commit(branch, timestamp);
            created.push(rev);
            deltas.push(delta);
        }
        for &(id, _) in &request.detached {
            if let Some(base) = bases.get(&id) {
                let version = if base.branch() == branch { base.version() + 1 } else { 1 };
                created.push(Revision::detached(id, branch.version(version), timestamp, UNSPECIFIED_DATE));
            }
        }

        // Apply
        for rev in created {
            let list = state.revisions.entry((rev.id(), branch)).or_insert_with(Vec::new);
            if let Some(prev) = list.last_mut() {
                if prev.is_current() {
                    prev.set_revised(timestamp - 1);
                }
            }
            list.push(rev);
        }
        for unit in &request.new_packages {
            let mut unit = unit.clone();
            unit.state = PackageState::Loaded;
            state.packages.register(unit);
        }
        if request.release_locks {
            let owner = request.owner;
            state.locks.retain(|k, v| !(k.1 == branch && *v == owner));
        }
        state.sequence += 1;
        state.last_commit = timestamp;
        let sequence = state.sequence;

        info!("Repository {}: commit {} by {} on branch {} at {}: {} new, {} changed, {} detached",
                self.name, sequence, request.owner.session, branch, timestamp,
                request.new_revisions.len(), deltas.len(), request.detached.len());

        let invalidation = Invalidation {
            sequence,
            timestamp,
            branch,
            committer: request.owner.session,
            new_packages: request.new_packages.iter().cloned().map(|mut u| {
                u.state = PackageState::Loaded;
                u
            }).collect(),
            dirty: request.deltas.iter().map(|d| (d.id(), d.base())).collect(),
            detached: request.detached.iter().map(|d| d.0).collect(),
            deltas,
        };
        let committer = request.owner.session;
        state.subscribers.retain(|session, sender| {
            *session == committer || sender.send(invalidation.clone()).is_ok()
        });

        Ok(CommitResult { sequence, timestamp, id_mappings })
    }

    fn lock_objects(&self, owner: LockOwner, branch: BranchId, ids: &[ObjectId]) -> Result<(), StoreError> {
        let mut state = self.lock();
        let mut locked = vec![];
        for id in ids {
            MemoryStore::check_lock(&state, owner, (*id, branch), &mut locked);
        }
        if !locked.is_empty() {
            return Err(StoreError::Locked(locked));
        }
        for id in ids {
            state.locks.insert((*id, branch), owner);
        }
        trace!("Repository {}: {} locks taken by {:?}", self.name, ids.len(), owner);
        Ok(())
    }

    fn unlock_objects(&self, owner: LockOwner, branch: BranchId, ids: Option<&[ObjectId]>) {
        let mut state = self.lock();
        match ids {
            Some(ids) => {
                for id in ids {
                    if state.locks.get(&(*id, branch)) == Some(&owner) {
                        state.locks.remove(&(*id, branch));
                    }
                }
            }
            None => state.locks.retain(|k, v| !(k.1 == branch && *v == owner)),
        }
    }

    fn subscribe(&self, session: SessionId) -> Subscription {
        let (sender, receiver) = channel();
        let mut state = self.lock();
        state.subscribers.insert(session, sender);
        Subscription {
            receiver,
            last_sequence: state.sequence,
            last_commit_time: state.last_commit,
        }
    }

    fn unsubscribe(&self, session: SessionId) {
        let mut state = self.lock();
        state.subscribers.remove(&session);
        state.locks.retain(|_, v| v.session != session);
        info!("Repository {}: closed session {}", self.name, session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{FeatureDelta, RevisionDelta};
    use crate::revision::{ClassRef, Value};
    use crate::store::ManualClock;
    use crate::view::ViewId;

    fn store() -> MemoryStore {
        MemoryStore::with_clock(Box::new(ManualClock::new(1000)))
    }

    fn owner(store: &MemoryStore) -> LockOwner {
        LockOwner { session: store.open_session(), view: ViewId(1) }
    }

    fn request(owner: LockOwner, branch: BranchId) -> CommitRequest {
        CommitRequest {
            owner,
            branch,
            comment: None,
            new_packages: vec![],
            new_revisions: vec![],
            deltas: vec![],
            detached: vec![],
            release_locks: true,
        }
    }

    fn create(store: &MemoryStore, owner: LockOwner) -> Revision {
        let mut rev = Revision::new(ObjectId::Temp(1), BranchId::MAIN.version(0), 0, ClassRef::new("p", "C"));
        rev.set("name".into(), "a".into()).unwrap();
        let mut req = request(owner, BranchId::MAIN);
        req.new_revisions.push(rev);
        let result = store.commit(req).unwrap();
        let id = result.id_mappings.adjust(ObjectId::Temp(1));
        assert!(id.is_persistent());
        store.revision(id, BranchId::MAIN.head(), false).unwrap().0.unwrap()
    }

    #[test]
    fn stale_delta_is_rejected() {
        let store = store();
        let owner = owner(&store);
        let rev = create(&store, owner);

        let mut delta = RevisionDelta::for_revision(&rev);
        delta.add_feature_delta(FeatureDelta::set("name", "b"));
        let mut req = request(owner, BranchId::MAIN);
        req.deltas.push(delta.clone());
        store.commit(req.clone()).unwrap();

        match store.commit(req) {
            Err(StoreError::Conflict(ids)) => assert_eq!(ids, vec![rev.id()]),
            r => panic!("unexpected: {:?}", r),
        }
        let cur = store.revision(rev.id(), BranchId::MAIN.head(), false).unwrap().0.unwrap();
        assert_eq!(cur.version(), 2);
        assert_eq!(cur.get(&"name".into()), Some(&Value::from("b")));
    }

    #[test]
    fn branch_lookup_yields_pointer() {
        let store = store();
        let owner = owner(&store);
        let rev = create(&store, owner);
        let sub = store.create_branch("sub", BranchId::MAIN.head()).unwrap();

        let (result, synthetic) = store.revision(rev.id(), sub.head(), true).unwrap();
        assert_eq!(result.as_ref().map(|r| r.branch_version()), Some(BranchId::MAIN.version(1)));
        let pointer = synthetic.expect("pointer");
        assert!(pointer.is_pointer());
        assert_eq!(pointer.branch(), sub);
        assert_eq!(pointer.target(), Some(BranchId::MAIN.version(1)));

        // first change on the branch creates version 1 there
        let mut delta = RevisionDelta::for_revision(&rev);
        delta.add_feature_delta(FeatureDelta::set("name", "on-branch"));
        let mut req = request(owner, sub);
        req.deltas.push(delta);
        store.commit(req).unwrap();
        let (result, synthetic) = store.revision(rev.id(), sub.head(), true).unwrap();
        assert_eq!(result.map(|r| r.branch_version()), Some(sub.version(1)));
        assert!(synthetic.is_none());
        // main is unaffected
        let main = store.revision(rev.id(), BranchId::MAIN.head(), false).unwrap().0.unwrap();
        assert_eq!(main.version(), 1);
    }

    #[test]
    fn detach_and_locks() {
        let store = store();
        let a = owner(&store);
        let b = LockOwner { session: store.open_session(), view: ViewId(2) };
        let rev = create(&store, a);

        store.lock_objects(b, BranchId::MAIN, &[rev.id()]).unwrap();
        assert!(store.lock_objects(a, BranchId::MAIN, &[rev.id()]).is_err());
        let mut req = request(a, BranchId::MAIN);
        req.detached.push((rev.id(), rev.branch_version()));
        match store.commit(req.clone()) {
            Err(StoreError::Locked(ids)) => assert_eq!(ids, vec![rev.id()]),
            r => panic!("unexpected: {:?}", r),
        }
        store.unlock_objects(b, BranchId::MAIN, None);
        store.commit(req).unwrap();

        let (result, synthetic) = store.revision(rev.id(), BranchId::MAIN.head(), true).unwrap();
        assert!(result.is_none());
        assert!(synthetic.map(|s| s.is_detached()).unwrap_or(false));
    }

    #[test]
    fn invalidations_skip_committer() {
        let store = store();
        let a = owner(&store);
        let other = store.open_session();
        let sub_a = store.subscribe(a.session);
        let sub_other = store.subscribe(other);
        assert_eq!(sub_other.last_sequence, 0);
        create(&store, a);
        let inv = sub_other.receiver.try_recv().expect("invalidation");
        assert_eq!(inv.sequence, 1);
        assert_eq!(inv.committer, a.session);
        assert!(sub_a.receiver.try_recv().is_err());
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = ManualClock::new(5);
        let a = clock.now();
        let b = clock.now();
        assert!(b > a);
    }
}
