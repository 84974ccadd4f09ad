/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Committing a transaction

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};

use crate::branch::{BranchId, BranchVersion};
use crate::delta::RevisionDelta;
use crate::error::{Error, Result, StoreError, TransactionError};
use crate::id::{IdMapper, ObjectId};
use crate::object::CdoObject;
use crate::package::PackageUnit;
use crate::revision::Revision;
use crate::session::deliver;
use crate::store::{CommitRequest, CommitResult, Invalidation, LockOwner, RevisionStore};
use crate::view::{FinishedKind, ViewEvent};
use super::{Transaction, TxInner, TxState};

/// The changes of a transaction being committed
pub struct CommitContext {
    pub branch: BranchId,
    pub new_resources: BTreeMap<ObjectId, CdoObject>,
    pub new_objects: BTreeMap<ObjectId, CdoObject>,
    pub dirty_objects: BTreeMap<ObjectId, CdoObject>,
    /// Detached persistent objects with the version last seen
    pub detached: Vec<(ObjectId, BranchVersion)>,
    pub revision_deltas: BTreeMap<ObjectId, RevisionDelta>,
    /// Package units the repository does not know yet
    pub new_packages: Vec<PackageUnit>,
    pub comment: Option<String>,
}

impl CommitContext {
    /// Working revisions of all new objects and resources
    pub fn new_revisions(&self) -> Vec<Revision> {
        self.new_resources.values().chain(self.new_objects.values())
            .filter_map(|obj| obj.revision())
            .collect()
    }

    fn request(&self, owner: LockOwner, release_locks: bool) -> CommitRequest {
        CommitRequest {
            owner,
            branch: self.branch,
            comment: self.comment.clone(),
            new_packages: self.new_packages.clone(),
            new_revisions: self.new_revisions(),
            deltas: self.revision_deltas.values().cloned().collect(),
            detached: self.detached.clone(),
            release_locks,
        }
    }
}

/// How a commit request reaches the repository
pub trait CommitStrategy: Send + Sync {
    /// Send the request. The default implementation calls
    /// `RevisionStore::commit`.
    fn commit(&self, store: &dyn RevisionStore, request: CommitRequest) -> Result<CommitResult, StoreError> {
        store.commit(request)
    }
}

/// Sends commit requests straight to the repository
#[derive(Debug, Default)]
pub struct DefaultCommitStrategy;
impl CommitStrategy for DefaultCommitStrategy {}

/// Outcome of a successful commit
#[derive(Clone, Debug, PartialEq)]
pub struct CommitInfo {
    /// Position in the repository's commit order
    pub sequence: u64,
    /// Commit time, milliseconds since the UNIX epoch
    pub time: i64,
    pub timestamp: DateTime<Utc>,
    pub branch: BranchId,
    /// Temporary to persistent identifiers of new objects
    pub id_mappings: IdMapper,
    pub new_objects: Vec<ObjectId>,
    pub dirty_objects: Vec<ObjectId>,
    pub detached_objects: Vec<ObjectId>,
}

impl TxInner {
    fn commit_context(&self, state: &TxState) -> Result<CommitContext> {
        let new_resources = state.savepoints.all_new_resources();
        let new_objects = state.savepoints.all_new_objects();
        let classes: Vec<_> = new_resources.values().chain(new_objects.values())
            .map(|obj| obj.class())
            .collect();
        let new_packages = self.core.session.packages().analyze_new_packages(classes.iter())?;
        let mut detached = vec![];
        for id in state.savepoints.all_detached_objects(false).keys() {
            match state.former_revisions.get(id) {
                Some(rev) => detached.push((*id, rev.branch_version())),
                None => return Err(Error::illegal(format!("no former revision of detached {}", id))),
            }
        }
        Ok(CommitContext {
            branch: self.branch,
            new_resources,
            new_objects,
            dirty_objects: state.savepoints.all_dirty_objects(),
            detached,
            revision_deltas: state.savepoints.all_revision_deltas(),
            new_packages,
            comment: self.options.comment.clone(),
        })
    }

    // Bring objects up to date with the committed state. Returns the new
    // revisions to cache.
    fn post_commit(&self, state: &mut TxState, ctx: &CommitContext, result: &CommitResult)
            -> (CommitInfo, Vec<Revision>, Invalidation)
    {
        let sm = &self.core.session.state_machine;
        let mapper = &result.id_mappings;
        let ts = result.timestamp;
        let mut revisions = vec![];
        let mut new_ids = vec![];
        for (old_id, obj) in ctx.new_resources.iter().chain(ctx.new_objects.iter()) {
            let new_id = mapper.adjust(*old_id);
            {
                let mut data = obj.lock();
                if let Some(ref mut rev) = data.revision {
                    rev.set_id(new_id);
                    rev.adjust_references(mapper);
                    rev.set_branch_version(self.branch.version(1));
                    rev.set_created(ts);
                    rev.set_revised(crate::branch::UNSPECIFIED_DATE);
                    revisions.push(rev.clone());
                }
                data.id = new_id;
                sm.commit(&mut data);
            }
            self.core.deregister(*old_id);
            self.core.register(new_id, obj);
            new_ids.push(new_id);
        }

        let mut dirty = vec![];
        for (id, obj) in &ctx.dirty_objects {
            let mut data = obj.lock();
            if ctx.revision_deltas.contains_key(id) {
                if let Some(ref mut rev) = data.revision {
                    dirty.push((*id, rev.branch_version()));
                    rev.adjust_references(mapper);
                    rev.adjust_for_commit(self.branch, ts);
                    revisions.push(rev.clone());
                }
            }
            sm.commit(&mut data);
        }

        let detached: Vec<ObjectId> = ctx.detached.iter().map(|&(id, _)| id).collect();
        for id in &detached {
            state.former_revisions.remove(id);
        }
        if !ctx.new_packages.is_empty() {
            self.core.session.packages().mark_loaded(ctx.new_packages.iter().map(|u| u.uri.as_str()));
        }

        let deltas: Vec<RevisionDelta> = ctx.revision_deltas.values()
            .map(|d| {
                let mut d = d.clone();
                d.adjust_references(mapper);
                d
            })
            .collect();
        let inv = Invalidation {
            sequence: result.sequence,
            timestamp: ts,
            branch: self.branch,
            committer: self.core.session.id,
            new_packages: ctx.new_packages.clone(),
            dirty: dirty.clone(),
            detached: detached.clone(),
            deltas,
        };
        let info = CommitInfo {
            sequence: result.sequence,
            time: ts,
            timestamp: Utc.timestamp_millis_opt(ts).single().unwrap_or_else(Utc::now),
            branch: self.branch,
            id_mappings: mapper.clone(),
            new_objects: new_ids,
            dirty_objects: dirty.into_iter().map(|(id, _)| id).collect(),
            detached_objects: detached,
        };
        state.clean_up();
        if self.options.auto_release_locks {
            state.locked.clear();
        }
        (info, revisions, inv)
    }
}

impl Transaction {
    /// Commit all changes.
    ///
    /// Returns `Ok(None)` if there was nothing to commit. Fails with
    /// `TransactionError::Conflict` while conflicts are unresolved, and with
    /// `TransactionError::Commit` if the repository refused the commit; in
    /// both cases the transaction is unchanged.
    pub fn commit(&self) -> Result<Option<CommitInfo>> {
        let inner = self.inner();
        let session = &inner.core.session;
        let (info, notifications) = {
            let mut guard = session.invalidation_lock();
            let mut state = inner.lock_state();
            if state.closed {
                return Err(Error::illegal("transaction is closed"));
            }
            if state.conflict > 0 {
                return Err(TransactionError::Conflict.into());
            }
            if !state.dirty {
                debug!("Transaction {}: nothing to commit", self.id());
                return Ok(None);
            }
            let ctx = inner.commit_context(&state)?;
            for handler in inner.handlers() {
                handler.committing(&ctx).map_err(|e| TransactionError::Vetoed(e.to_string()))?;
            }
            let request = ctx.request(inner.owner(), inner.options.auto_release_locks);
            let result = inner.strategy().commit(&*session.store, request).map_err(|e| {
                warn!("Transaction {}: commit failed: {}", self.id(), e);
                TransactionError::Commit(e)
            })?;
            let (info, revisions, inv) = inner.post_commit(&mut state, &ctx, &result);
            drop(state);
            let notifications = session.commit_notification(&mut guard, &inv, self.id(), revisions);
            (info, notifications)
        };
        info!("Transaction {}: committed {} at {} ({} new, {} dirty, {} detached)",
                self.id(), info.sequence, info.timestamp,
                info.new_objects.len(), info.dirty_objects.len(), info.detached_objects.len());
        deliver(notifications);
        inner.core.fire(vec![ViewEvent::Finished {
            kind: FinishedKind::Committed,
            id_mappings: info.id_mappings.clone(),
        }]);
        for handler in inner.handlers() {
            if let Err(e) = handler.committed(self, &info) {
                error!("Transaction {}: commit handler failed: {}", self.id(), e);
            }
        }
        Ok(Some(info))
    }
}
