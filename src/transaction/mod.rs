/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Transactions: writable views
//!
//! A transaction records local changes in a stack of savepoints, follows
//! remote commits on its branch (marking locally modified objects which
//! were changed remotely as conflicting), and sends its changes to the
//! repository on commit.

mod changes;
mod commit;

pub use self::commit::{CommitContext, CommitInfo, CommitStrategy, DefaultCommitStrategy};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::branch::{BranchId, BranchVersion, UNSPECIFIED_DATE};
use crate::conflict::ConflictResolver;
use crate::delta::{reference_removals, FeatureDelta, RevisionDelta};
use crate::error::{Error, Result};
use crate::id::{IdMapper, ObjectId, TempIdGen};
use crate::object::{CdoObject, ObjectState};
use crate::revision::{Feature, Revision, Value};
use crate::savepoint::{SavepointHandle, SavepointStack};
use crate::session::SessionInner;
use crate::state_machine::ObjectEvent;
use crate::store::{Invalidation, LockOwner};
use crate::view::{FinishedKind, InvalidationTarget, ViewCore, ViewEvent, ViewId, ViewListener};

/// Transaction options
#[derive(Clone)]
pub struct TransactionOptions {
    /// Release all write locks on commit and on rollback to the first
    /// savepoint
    pub auto_release_locks: bool,
    /// Resolvers used by `Transaction::handle_conflicts`, in order
    pub resolvers: Vec<Arc<dyn ConflictResolver>>,
    /// Comment sent with each commit
    pub comment: Option<String>,
}

impl Default for TransactionOptions {
    fn default() -> TransactionOptions {
        TransactionOptions {
            auto_release_locks: true,
            resolvers: vec![],
            comment: None,
        }
    }
}

/// Hooks into the life of a transaction.
///
/// The `attaching_object` and `detaching_object` hooks run before the
/// change and may veto it by returning an error. `committing` runs while
/// the transaction is locked; it may veto the commit but must not call
/// back into the transaction. Errors of the other hooks are logged.
pub trait TransactionHandler: Send + Sync {
    fn attaching_object(&self, _tx: &Transaction, _object: &CdoObject) -> Result<()> {
        Ok(())
    }
    fn modifying_object(&self, _tx: &Transaction, _object: &CdoObject, _delta: &FeatureDelta) {}
    fn detaching_object(&self, _tx: &Transaction, _object: &CdoObject) -> Result<()> {
        Ok(())
    }
    fn committing(&self, _ctx: &CommitContext) -> Result<()> {
        Ok(())
    }
    fn committed(&self, _tx: &Transaction, _info: &CommitInfo) -> Result<()> {
        Ok(())
    }
    fn rolled_back(&self, _tx: &Transaction) -> Result<()> {
        Ok(())
    }
}

pub(crate) struct TxState {
    pub savepoints: SavepointStack,
    pub temp_ids: TempIdGen,
    pub dirty: bool,
    pub conflict: usize,
    /// Working revisions of detached objects as they were when first
    /// detached
    pub former_revisions: HashMap<ObjectId, Revision>,
    /// Remote changes to conflicting objects, oldest first
    pub remote_deltas: BTreeMap<ObjectId, Vec<RevisionDelta>>,
    pub locked: BTreeSet<ObjectId>,
    pub closed: bool,
}

impl TxState {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::illegal("transaction is closed"))
        } else {
            Ok(())
        }
    }

    /// Objects in conflict: dirty ones and locally detached ones
    pub fn conflicts(&self) -> Vec<CdoObject> {
        let mut found: Vec<CdoObject> = vec![];
        let dirty = self.savepoints.all_dirty_objects();
        let detached = self.savepoints.all_detached_objects(false);
        for obj in dirty.values().chain(detached.values()) {
            if obj.state() == ObjectState::Conflict && !found.iter().any(|o| o.ptr_eq(obj)) {
                found.push(obj.clone());
            }
        }
        found
    }

    pub fn recount_conflicts(&mut self) {
        self.conflict = self.conflicts().len();
    }

    fn set_dirty(&mut self) -> Vec<ViewEvent> {
        if self.dirty {
            vec![]
        } else {
            self.dirty = true;
            vec![ViewEvent::Started]
        }
    }

    /// Forget everything after a commit or complete rollback
    pub fn clean_up(&mut self) {
        self.savepoints.reset();
        self.former_revisions.clear();
        self.remote_deltas.clear();
        self.dirty = false;
        self.conflict = 0;
    }
}

pub(crate) struct TxInner {
    pub core: ViewCore,
    pub branch: BranchId,
    pub options: TransactionOptions,
    state: Mutex<TxState>,
    handlers: Mutex<Vec<Arc<dyn TransactionHandler>>>,
    strategy: Mutex<Arc<dyn CommitStrategy>>,
}

impl TxInner {
    pub fn lock_state(&self) -> MutexGuard<TxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn handlers(&self) -> Vec<Arc<dyn TransactionHandler>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn strategy(&self) -> Arc<dyn CommitStrategy> {
        self.strategy.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn owner(&self) -> LockOwner {
        LockOwner { session: self.core.session.id, view: self.core.id }
    }

    /// The latest revision of a persistent object on this branch
    pub fn current_revision(&self, id: ObjectId) -> Result<Option<Revision>> {
        self.core.session.revisions.revision(id, self.core.point)
    }

    fn handle(&self, state: &TxState, index: usize) -> SavepointHandle {
        let serial = state.savepoints.get(index).map_or(0, |sp| sp.serial);
        SavepointHandle { tx: self.core.id.0, index, serial }
    }

    pub fn push_savepoint(&self, state: &mut TxState) -> usize {
        let last = state.savepoints.last_mut();
        let bases: Vec<(ObjectId, Revision)> = last.new_entries()
            .filter_map(|(id, obj)| obj.revision().map(|rev| (*id, rev)))
            .collect();
        last.base_new_revisions.extend(bases);
        let was_dirty = state.dirty;
        let index = state.savepoints.push(was_dirty);
        debug!("Transaction {}: savepoint {}", self.core.id, index);
        index
    }

    fn register_new(&self, state: &mut TxState, object: &CdoObject) -> Result<ObjectId> {
        let id = state.temp_ids.next_id();
        if state.savepoints.last().is_new(id) {
            return Err(Error::illegal(format!("{} is already registered", id)));
        }
        let resource = {
            let mut data = object.lock();
            let mut rev = Revision::new(id, self.branch.version(0), UNSPECIFIED_DATE, data.class.clone());
            {
                let rd = rev.data_mut()?;
                rd.resource = data.resource;
                rd.values = data.transient.clone();
            }
            self.core.session.state_machine.apply(&mut data, ObjectEvent::Attach)?;
            data.transient.clear();
            data.id = id;
            data.revision = Some(rev);
            data.view = Some(self.core.id);
            data.resource
        };
        let last = state.savepoints.last_mut();
        if resource {
            last.new_resources.insert(id, object.clone());
        } else {
            last.new_objects.insert(id, object.clone());
        }
        self.core.register(id, object);
        debug!("Transaction {}: attached new object {}", self.core.id, id);
        Ok(id)
    }

    fn register_reattached(&self, state: &mut TxState, object: &CdoObject, id: ObjectId) -> Result<ObjectId> {
        let former = state.former_revisions.get(&id).cloned()
            .ok_or_else(|| Error::illegal(format!("no former revision of {}", id)))?;
        let sm = &self.core.session.state_machine;
        if id.is_temporary() {
            for sp in state.savepoints.iter_mut() {
                sp.detached_objects.remove(&id);
            }
            let mut data = object.lock();
            sm.apply(&mut data, ObjectEvent::Attach)?;
            data.transient.clear();
            data.id = id;
            data.revision = Some(former);
            data.view = Some(self.core.id);
        } else {
            {
                let mut data = object.lock();
                sm.apply(&mut data, ObjectEvent::Reattach)?;
                data.transient.clear();
                data.id = id;
                data.revision = Some(former);
                data.view = Some(self.core.id);
            }
            let last = state.savepoints.last_mut();
            if last.detached_objects.remove(&id).is_some() {
                last.dirty_objects.insert(id, object.clone());
            } else {
                last.reattached_objects.insert(id, object.clone());
            }
        }
        self.core.register(id, object);
        debug!("Transaction {}: re-attached {}", self.core.id, id);
        Ok(id)
    }

    fn register_feature_delta(&self, state: &mut TxState, object: &CdoObject, fd: &FeatureDelta)
            -> Result<Vec<ViewEvent>>
    {
        if object.state() == ObjectState::Proxy {
            self.core.load(object)?;
        }
        let sm = &self.core.session.state_machine;
        let (id, base, was) = {
            let mut data = object.lock();
            if data.view != Some(self.core.id) {
                return Err(Error::illegal(format!("{:?} is not attached to {}", object, self.core.id)));
            }
            sm.next(data.state, ObjectEvent::Write)?;
            let id = data.id;
            let was = data.state;
            let rev = data.revision.as_mut()
                .ok_or_else(|| Error::illegal(format!("{} has no revision", id)))?;
            let base = rev.branch_version();
            fd.apply(rev.data_mut()?)?;
            sm.apply(&mut data, ObjectEvent::Write)?;
            (id, base, was)
        };
        trace!("Transaction {}: {} {:?}", self.core.id, id, fd);
        let has_previous = state.savepoints.len() > 1;
        let last = state.savepoints.last_mut();
        if was != ObjectState::New || (has_previous && !last.is_new(id)) {
            last.revision_deltas.entry(id)
                .or_insert_with(|| RevisionDelta::new(id, base))
                .add_feature_delta(fd.clone());
        }
        if was == ObjectState::Clean {
            last.dirty_objects.insert(id, object.clone());
        }
        Ok(state.set_dirty())
    }

    fn detach_object(&self, state: &mut TxState, object: &CdoObject) -> Result<Vec<ViewEvent>> {
        if object.state() == ObjectState::Proxy {
            self.core.load(object)?;
        }
        let sm = &self.core.session.state_machine;
        let (id, was, revision) = {
            let mut data = object.lock();
            if data.view != Some(self.core.id) {
                return Err(Error::illegal(format!("{:?} is not attached to {}", object, self.core.id)));
            }
            let was = data.state;
            sm.apply(&mut data, ObjectEvent::Detach)?;
            let id = data.id;
            let revision = data.revision.take();
            if let Some(ref rev) = revision {
                if let Ok(rd) = rev.data() {
                    data.transient = rd.values.clone();
                }
            }
            data.id = ObjectId::Null;
            data.view = None;
            (id, was, revision)
        };
        self.core.deregister(id);
        let last = state.savepoints.last_mut();
        if was == ObjectState::New && last.is_new(id) {
            last.new_objects.remove(&id);
            last.new_resources.remove(&id);
            last.base_new_revisions.remove(&id);
            last.revision_deltas.remove(&id);
        } else {
            last.detached_objects.insert(id, object.clone());
            if was != ObjectState::New {
                last.reattached_objects.remove(&id);
            }
            if let Some(rev) = revision {
                state.former_revisions.entry(id).or_insert(rev);
            }
        }
        debug!("Transaction {}: detached {}", self.core.id, id);
        if was == ObjectState::Conflict {
            state.recount_conflicts();
        }
        Ok(state.set_dirty())
    }

    /// Mark an object as conflicting; return the event to fire
    pub fn mark_conflict(&self, state: &mut TxState, object: &CdoObject) -> Option<ViewEvent> {
        {
            let mut data = object.lock();
            let current = data.state;
            match current {
                ObjectState::Conflict => return None,
                ObjectState::Dirty => {
                    if let Err(e) = self.core.session.state_machine.apply(&mut data, ObjectEvent::Invalidate) {
                        warn!("Transaction {}: {}", self.core.id, e);
                        return None;
                    }
                }
                ObjectState::Transient => data.state = ObjectState::Conflict,
                other => {
                    warn!("Transaction {}: cannot mark {:?} object as conflicting", self.core.id, other);
                    return None;
                }
            }
        }
        state.conflict += 1;
        info!("Transaction {}: conflict on {:?}", self.core.id, object);
        Some(ViewEvent::Conflict { object: object.clone(), first: state.conflict == 1 })
    }

    /// Make an object transient and remove it from the view
    pub fn remove_object(&self, object: &CdoObject) {
        let id = {
            let mut data = object.lock();
            let id = data.id;
            data.state = ObjectState::Transient;
            data.revision = None;
            data.view = None;
            data.id = ObjectId::Null;
            id
        };
        if !id.is_null() {
            self.core.deregister(id);
        }
    }

    /// Reset an object to the latest revision of `id`; removes it if the
    /// object no longer exists
    pub fn clean_object(&self, object: &CdoObject, id: ObjectId) -> Result<()> {
        match self.current_revision(id)? {
            Some(rev) => {
                {
                    let mut data = object.lock();
                    data.id = id;
                    data.revision = Some(rev);
                    data.view = Some(self.core.id);
                    data.state = ObjectState::Clean;
                    data.transient.clear();
                }
                self.core.register(id, object);
            }
            None => {
                debug!("Transaction {}: {} no longer exists", self.core.id, id);
                object.lock().id = id;
                self.remove_object(object);
            }
        }
        Ok(())
    }

    // Undo everything from savepoint `target` on; return the temporary
    // identifiers of new objects which had changes there
    fn rollback_completely(&self, state: &mut TxState, target: usize) -> Result<BTreeSet<ObjectId>> {
        let mut ids_with_deltas = BTreeSet::new();
        for index in (target..state.savepoints.len()).rev() {
            let sp = match state.savepoints.get(index) {
                Some(sp) => sp.clone(),
                None => continue,
            };
            for obj in sp.new_resources.values()
                .chain(sp.new_objects.values())
                .chain(sp.reattached_objects.values())
            {
                self.remove_object(obj);
            }
            for (id, obj) in &sp.detached_objects {
                if id.is_temporary() {
                    ids_with_deltas.insert(*id);
                } else {
                    self.clean_object(obj, *id)?;
                }
            }
            for (id, obj) in &sp.dirty_objects {
                if !id.is_temporary() && !sp.reattached_objects.contains_key(id) {
                    self.clean_object(obj, *id)?;
                }
            }
            ids_with_deltas.extend(sp.revision_deltas.keys().filter(|id| id.is_temporary()).cloned());
        }
        state.savepoints.truncate(target);
        state.savepoints.last_mut().clear();
        Ok(ids_with_deltas)
    }

    // Rebuild the state of the objects as of savepoint `target`
    fn load_savepoint(&self, state: &mut TxState, target: usize, ids_with_deltas: &BTreeSet<ObjectId>)
            -> Result<()>
    {
        let detached = state.savepoints.all_detached_objects(true);
        for (id, obj) in &detached {
            if let Some(rd) = state.former_revisions.get(id).and_then(|rev| rev.data().ok()) {
                let mut data = obj.lock();
                if data.view.is_none() && data.transient.is_empty() {
                    data.transient = rd.values.clone();
                }
            }
        }
        let bases = state.savepoints.all_base_new_revisions();
        for id in ids_with_deltas {
            if detached.contains_key(id) {
                continue;
            }
            if let (Some(obj), Some(base)) = (state.savepoints.find_new(*id), bases.get(id)) {
                {
                    let mut data = obj.lock();
                    data.id = *id;
                    data.revision = Some(base.clone());
                    data.view = Some(self.core.id);
                    data.state = ObjectState::New;
                    data.transient.clear();
                }
                self.core.register(*id, &obj);
            }
        }
        let mut new_objects = state.savepoints.all_new_resources();
        new_objects.extend(state.savepoints.all_new_objects());
        for (id, obj) in &new_objects {
            {
                let mut data = obj.lock();
                data.state = ObjectState::New;
                data.view = Some(self.core.id);
            }
            self.core.register(*id, obj);
        }

        let dirty = state.savepoints.all_dirty_objects();
        let conflicting: BTreeSet<ObjectId> = dirty.iter()
            .filter(|(_, obj)| obj.state() == ObjectState::Conflict)
            .map(|(id, _)| *id)
            .collect();
        for (id, obj) in &dirty {
            if !id.is_temporary() {
                self.clean_object(obj, *id)?;
            }
        }

        for index in 0..target {
            let deltas: Vec<RevisionDelta> = match state.savepoints.get(index) {
                Some(sp) => sp.revision_deltas.values().cloned().collect(),
                None => continue,
            };
            for delta in deltas {
                let id = delta.id();
                if (id.is_temporary() && !ids_with_deltas.contains(&id)) || detached.contains_key(&id) {
                    continue;
                }
                let obj = if id.is_temporary() {
                    new_objects.get(&id).cloned()
                } else {
                    dirty.get(&id).cloned()
                };
                let obj = match obj {
                    Some(obj) => obj,
                    None => continue,
                };
                let mut data = obj.lock();
                if id.is_temporary() {
                    if let Some(ref mut rev) = data.revision {
                        delta.apply(rev)?;
                    }
                    continue;
                }
                if data.state == ObjectState::Transient {
                    // removed because it no longer exists
                    continue;
                }
                let stale = match data.revision {
                    Some(ref mut rev) => {
                        let stale = rev.branch_version() != delta.base();
                        delta.apply(rev)?;
                        stale
                    }
                    None => continue,
                };
                if stale || conflicting.contains(&id) {
                    data.state = ObjectState::Conflict;
                } else {
                    data.state = ObjectState::Dirty;
                }
            }
        }

        state.dirty = state.savepoints.last().was_dirty;
        state.former_revisions.retain(|id, _| detached.contains_key(id));
        state.remote_deltas.retain(|id, _| dirty.contains_key(id) || detached.contains_key(id));
        state.recount_conflicts();
        Ok(())
    }

    // Drop references to remotely detached objects from new and dirty
    // objects so that they are not committed
    fn remove_references(&self, state: &mut TxState, targets: &BTreeSet<ObjectId>) -> Vec<ViewEvent> {
        let mut objects = state.savepoints.all_new_resources();
        objects.extend(state.savepoints.all_new_objects());
        objects.extend(state.savepoints.all_dirty_objects());
        let mut events = vec![];
        for (id, object) in objects {
            if targets.contains(&id) {
                continue;
            }
            let removals = match object.revision() {
                Some(rev) => match rev.data() {
                    Ok(data) => reference_removals(data, targets),
                    Err(_) => continue,
                },
                None => continue,
            };
            for fd in &removals {
                debug!("Transaction {}: {} loses reference to a remotely detached object: {:?}",
                        self.core.id, id, fd);
                match self.register_feature_delta(state, &object, fd) {
                    Ok(ev) => events.extend(ev),
                    Err(e) => warn!("Transaction {}: cannot remove reference from {}: {}", self.core.id, id, e),
                }
            }
        }
        events
    }

    // Apply remote changes to one object of this transaction
    fn invalidate_object(&self, state: &mut TxState, object: &CdoObject, id: ObjectId,
            prior: Option<BranchVersion>, locally_detached: bool, remote: Vec<RevisionDelta>)
            -> Option<ViewEvent>
    {
        let sm = &self.core.session.state_machine;
        let mut data = object.lock();
        let local = if locally_detached {
            state.former_revisions.get(&id).map(|r| r.branch_version())
        } else {
            data.revision.as_ref().map(|r| r.branch_version())
        };
        let current = data.state;
        match current {
            ObjectState::Clean | ObjectState::Proxy if !locally_detached => {
                if prior.is_some() {
                    if current == ObjectState::Clean && sm.apply(&mut data, ObjectEvent::Invalidate).is_ok() {
                        data.revision = None;
                    }
                } else {
                    if let Err(e) = sm.apply(&mut data, ObjectEvent::Detach) {
                        warn!("Transaction {}: {}", self.core.id, e);
                    }
                    data.revision = None;
                    data.view = None;
                    data.id = ObjectId::Null;
                    drop(data);
                    self.core.deregister(id);
                }
                None
            }
            ObjectState::Dirty | ObjectState::Conflict | ObjectState::Transient => {
                if let (Some(prior), Some(local)) = (prior, local) {
                    if local.branch == prior.branch && local.version > prior.version {
                        debug!("Transaction {}: ignoring outdated change of {}", self.core.id, id);
                        return None;
                    }
                }
                state.remote_deltas.entry(id).or_insert_with(Vec::new).extend(remote);
                drop(data);
                self.mark_conflict(state, object)
            }
            _ => None,
        }
    }
}

impl InvalidationTarget for TxInner {
    fn view_id(&self) -> ViewId { self.core.id }

    fn invalidate(&self, inv: &Invalidation) -> Vec<ViewEvent> {
        if !self.core.follows(inv) {
            return vec![];
        }
        let mut state = self.lock_state();
        if state.closed {
            return vec![];
        }
        let detached = state.savepoints.all_detached_objects(false);
        let mut events = vec![];
        let mut dirty = vec![];
        let mut gone = vec![];
        let changes = inv.dirty.iter().map(|&(id, prior)| (id, Some(prior)))
            .chain(inv.detached.iter().map(|&id| (id, None)));
        for (id, prior) in changes {
            let (object, locally_detached) = match self.core.lookup(id) {
                Some(object) => (object, false),
                None => match detached.get(&id) {
                    Some(object) => (object.clone(), true),
                    None => continue,
                },
            };
            if prior.is_some() { dirty.push(id); } else { gone.push(id); }
            let remote = inv.deltas.iter().filter(|d| d.id() == id).cloned().collect();
            events.extend(self.invalidate_object(&mut state, &object, id, prior, locally_detached, remote));
        }
        if !inv.detached.is_empty() {
            let targets: BTreeSet<ObjectId> = inv.detached.iter().cloned().collect();
            events.extend(self.remove_references(&mut state, &targets));
        }
        if dirty.is_empty() && gone.is_empty() {
            return events;
        }
        debug!("Transaction {}: remote commit {} changed {} and detached {} of our objects",
                self.core.id, inv.sequence, dirty.len(), gone.len());
        events.insert(0, ViewEvent::Invalidation {
            timestamp: inv.timestamp,
            dirty,
            detached: gone,
            deltas: inv.deltas.clone(),
        });
        events
    }

    fn notify(&self, events: Vec<ViewEvent>) {
        self.core.fire(events);
    }
}

/// A transaction on the head of one branch
///
/// Cheap to clone; clones refer to the same transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxInner>,
}

impl Transaction {
    pub(crate) fn new(session: Arc<SessionInner>, branch: BranchId, options: TransactionOptions) -> Transaction {
        let id = session.next_view_id();
        let inner = Arc::new(TxInner {
            core: ViewCore::new(id, session.clone(), branch.head()),
            branch,
            options,
            state: Mutex::new(TxState {
                savepoints: SavepointStack::new(),
                temp_ids: TempIdGen::new(),
                dirty: false,
                conflict: 0,
                former_revisions: HashMap::new(),
                remote_deltas: BTreeMap::new(),
                locked: BTreeSet::new(),
                closed: false,
            }),
            handlers: Mutex::new(vec![]),
            strategy: Mutex::new(Arc::new(DefaultCommitStrategy)),
        });
        let weak: Weak<TxInner> = Arc::downgrade(&inner);
        session.register_view(weak, id);
        Transaction { inner }
    }

    pub(crate) fn inner(&self) -> &TxInner { &self.inner }

    pub fn id(&self) -> ViewId { self.inner.core.id }
    pub fn branch(&self) -> BranchId { self.inner.branch }

    fn check_attached(&self, object: &CdoObject) -> Result<()> {
        if object.view_id() == Some(self.id()) {
            Ok(())
        } else {
            Err(Error::illegal(format!("{:?} is not attached to transaction {}", object, self.id())))
        }
    }

    /// Get the live object for `id`, loading it if necessary
    pub fn get_object(&self, id: ObjectId) -> Result<CdoObject> {
        self.inner.core.get_object(id)
    }

    /// Read a feature of an object of this transaction
    pub fn read(&self, object: &CdoObject, feature: &Feature) -> Result<Option<Value>> {
        self.inner.core.read(object, feature)
    }

    /// Attach a transient object: a new object gets a temporary identifier
    /// and becomes `New`; an object detached earlier in this transaction is
    /// re-attached under its former identifier.
    pub fn attach(&self, object: &CdoObject) -> Result<ObjectId> {
        if object.state() != ObjectState::Transient {
            return Err(Error::illegal(format!("{:?} is already attached", object)));
        }
        for handler in self.inner.handlers() {
            handler.attaching_object(self, object)?;
        }
        let (id, events) = {
            let mut state = self.inner.lock_state();
            state.check_open()?;
            let id = match state.savepoints.detached_id_of(object) {
                Some(id) if state.former_revisions.contains_key(&id) =>
                    self.inner.register_reattached(&mut state, object, id)?,
                _ => self.inner.register_new(&mut state, object)?,
            };
            (id, state.set_dirty())
        };
        self.inner.core.fire(events);
        Ok(id)
    }

    /// Record a feature change on an attached object
    pub fn modify(&self, object: &CdoObject, delta: FeatureDelta) -> Result<()> {
        self.check_attached(object)?;
        let events = {
            let mut state = self.inner.lock_state();
            state.check_open()?;
            self.inner.register_feature_delta(&mut state, object, &delta)?
        };
        self.inner.core.fire(events);
        for handler in self.inner.handlers() {
            handler.modifying_object(self, object, &delta);
        }
        Ok(())
    }

    /// Set a feature
    pub fn set<F: Into<Feature>, V: Into<Value>>(&self, object: &CdoObject, feature: F, value: V) -> Result<()> {
        self.modify(object, FeatureDelta::set(feature, value))
    }

    /// Unset a feature
    pub fn unset<F: Into<Feature>>(&self, object: &CdoObject, feature: F) -> Result<()> {
        self.modify(object, FeatureDelta::unset(feature))
    }

    /// Append to a list feature
    pub fn add<F: Into<Feature>, V: Into<Value>>(&self, object: &CdoObject, feature: F, value: V) -> Result<()> {
        self.modify(object, FeatureDelta::add(feature, value))
    }

    /// Remove an item from a list feature
    pub fn remove<F: Into<Feature>>(&self, object: &CdoObject, feature: F, index: usize) -> Result<()> {
        self.modify(object, FeatureDelta::remove(feature, index))
    }

    /// Detach an object. A new object detached in the savepoint which
    /// created it disappears without trace; otherwise the detachment is
    /// recorded and sent with the next commit.
    pub fn detach(&self, object: &CdoObject) -> Result<()> {
        self.check_attached(object)?;
        for handler in self.inner.handlers() {
            handler.detaching_object(self, object)?;
        }
        let events = {
            let mut state = self.inner.lock_state();
            state.check_open()?;
            self.inner.detach_object(&mut state, object)?
        };
        self.inner.core.fire(events);
        Ok(())
    }

    /// Mark an object as conflicting
    pub fn set_conflict(&self, object: &CdoObject) {
        let event = {
            let mut state = self.inner.lock_state();
            self.inner.mark_conflict(&mut state, object)
        };
        self.inner.core.fire(event.into_iter().collect());
    }

    pub fn is_dirty(&self) -> bool { self.inner.lock_state().dirty }
    pub fn has_conflict(&self) -> bool { self.inner.lock_state().conflict > 0 }
    pub fn conflict_count(&self) -> usize { self.inner.lock_state().conflict }

    /// Objects currently in conflict
    pub fn conflicts(&self) -> Vec<CdoObject> {
        self.inner.lock_state().conflicts()
    }

    /// New objects and resources not detached again
    pub fn new_objects(&self) -> Vec<CdoObject> {
        let state = self.inner.lock_state();
        let mut all = state.savepoints.all_new_resources();
        all.extend(state.savepoints.all_new_objects());
        all.into_iter().map(|(_, o)| o).collect()
    }

    /// Modified persistent objects
    pub fn dirty_objects(&self) -> Vec<CdoObject> {
        self.inner.lock_state().savepoints.all_dirty_objects().into_iter().map(|(_, o)| o).collect()
    }

    /// Identifiers of detached persistent objects
    pub fn detached_objects(&self) -> Vec<ObjectId> {
        self.inner.lock_state().savepoints.all_detached_objects(false).into_iter().map(|(id, _)| id).collect()
    }

    /// Changes to persistent objects, merged across savepoints
    pub fn revision_deltas(&self) -> Vec<RevisionDelta> {
        self.inner.lock_state().savepoints.all_revision_deltas().into_iter().map(|(_, d)| d).collect()
    }

    /// Remote changes seen for a conflicting object
    pub fn remote_deltas(&self, id: ObjectId) -> Vec<RevisionDelta> {
        self.inner.lock_state().remote_deltas.get(&id).cloned().unwrap_or_default()
    }

    /// Start a new savepoint
    pub fn set_savepoint(&self) -> Result<SavepointHandle> {
        let mut state = self.inner.lock_state();
        state.check_open()?;
        let index = self.inner.push_savepoint(&mut state);
        Ok(self.inner.handle(&state, index))
    }

    pub fn first_savepoint(&self) -> SavepointHandle {
        let state = self.inner.lock_state();
        self.inner.handle(&state, 0)
    }

    pub fn last_savepoint(&self) -> SavepointHandle {
        let state = self.inner.lock_state();
        let index = state.savepoints.len() - 1;
        self.inner.handle(&state, index)
    }

    /// Number of savepoints (at least one)
    pub fn savepoint_count(&self) -> usize {
        self.inner.lock_state().savepoints.len()
    }

    /// Discard all changes
    pub fn rollback(&self) -> Result<()> {
        let first = self.first_savepoint();
        self.rollback_internal(first, true)
    }

    /// Discard the changes made since `savepoint` was set. The savepoint
    /// stays valid; later ones are discarded.
    pub fn rollback_to(&self, savepoint: SavepointHandle) -> Result<()> {
        self.rollback_internal(savepoint, false)
    }

    fn rollback_internal(&self, savepoint: SavepointHandle, complete: bool) -> Result<()> {
        let session = &self.inner.core.session;
        {
            let _guard = session.invalidation_lock();
            let mut state = self.inner.lock_state();
            state.check_open()?;
            if savepoint.tx != self.id().0 || !state.savepoints.is_valid(savepoint.index, savepoint.serial) {
                return Err(Error::illegal(format!("invalid savepoint {} for transaction {}",
                        savepoint.index, self.id())));
            }
            let ids = self.inner.rollback_completely(&mut state, savepoint.index)?;
            self.inner.load_savepoint(&mut state, savepoint.index, &ids)?;
            if complete {
                state.clean_up();
            }
            if savepoint.index == 0 && self.inner.options.auto_release_locks && !state.locked.is_empty() {
                session.store.unlock_objects(self.inner.owner(), self.branch(), None);
                state.locked.clear();
            }
        }
        info!("Transaction {}: rolled back to savepoint {}", self.id(), savepoint.index);
        self.inner.core.fire(vec![ViewEvent::Finished {
            kind: FinishedKind::RolledBack,
            id_mappings: IdMapper::new(),
        }]);
        for handler in self.inner.handlers() {
            if let Err(e) = handler.rolled_back(self) {
                error!("Transaction {}: rollback handler failed: {}", self.id(), e);
            }
        }
        Ok(())
    }

    /// Take write locks on persistent objects. New objects are ignored.
    pub fn lock_objects(&self, objects: &[CdoObject]) -> Result<()> {
        let ids: Vec<ObjectId> = objects.iter().map(|o| o.id()).filter(|id| id.is_persistent()).collect();
        let mut state = self.inner.lock_state();
        state.check_open()?;
        self.inner.core.session.store.lock_objects(self.inner.owner(), self.branch(), &ids)?;
        debug!("Transaction {}: locked {} objects", self.id(), ids.len());
        state.locked.extend(ids);
        Ok(())
    }

    /// Release write locks: on the given objects, or all
    pub fn unlock_objects(&self, objects: Option<&[CdoObject]>) {
        let mut state = self.inner.lock_state();
        let store = &self.inner.core.session.store;
        match objects {
            Some(objects) => {
                let ids: Vec<ObjectId> = objects.iter().map(|o| o.id()).collect();
                store.unlock_objects(self.inner.owner(), self.branch(), Some(&ids));
                for id in ids {
                    state.locked.remove(&id);
                }
            }
            None => {
                store.unlock_objects(self.inner.owner(), self.branch(), None);
                state.locked.clear();
            }
        }
    }

    /// Identifiers of objects locked by this transaction
    pub fn locked_objects(&self) -> Vec<ObjectId> {
        self.inner.lock_state().locked.iter().cloned().collect()
    }

    pub fn add_handler(&self, handler: Arc<dyn TransactionHandler>) {
        self.inner.handlers.lock().unwrap_or_else(PoisonError::into_inner).push(handler);
    }

    pub fn remove_handler(&self, handler: &Arc<dyn TransactionHandler>) {
        self.inner.handlers.lock().unwrap_or_else(PoisonError::into_inner)
            .retain(|h| !Arc::ptr_eq(h, handler));
    }

    pub fn add_listener(&self, listener: Arc<dyn ViewListener>) {
        self.inner.core.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ViewListener>) {
        self.inner.core.remove_listener(listener);
    }

    /// Replace the commit strategy
    pub fn set_commit_strategy(&self, strategy: Arc<dyn CommitStrategy>) {
        *self.inner.strategy.lock().unwrap_or_else(PoisonError::into_inner) = strategy;
    }

    /// Stop following remote commits and release all locks. Uncommitted
    /// changes are abandoned.
    pub fn close(&self) {
        let mut state = self.inner.lock_state();
        if state.closed {
            return;
        }
        state.closed = true;
        let session = &self.inner.core.session;
        if !state.locked.is_empty() {
            session.store.unlock_objects(self.inner.owner(), self.branch(), None);
            state.locked.clear();
        }
        session.deregister_view(self.id());
        debug!("Transaction {}: closed", self.id());
    }
}
