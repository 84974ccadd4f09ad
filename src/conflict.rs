/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Conflict resolution
//!
//! An object is in *conflict* when it was modified (or detached) locally and
//! a remote commit changed it too. A transaction with conflicts cannot
//! commit until they are resolved.
//!
//! Resolvers are run in order over all still-conflicting objects; each
//! need not resolve all of them. If any resolver fails, every change made
//! during resolution is undone and the conflicts remain.
//!
//! Available resolvers:
//!
//! *   `DiscardLocalChanges`: keep the remote state
//! *   `TakeRemoteChangesThenApplyLocalChanges`: re-apply local changes on
//!     top of the remote state, whatever they touch
//! *   `MergeLocalChangesPerFeature`: as above, but only if local and
//!     remote changes touch disjoint features

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::delta::RevisionDelta;
use crate::error::{Error, Result, StoreError};
use crate::id::ObjectId;
use crate::object::{CdoObject, ObjectState};
use crate::revision::{Feature, Revision, Value};
use crate::savepoint::SavepointStack;
use crate::state_machine::ObjectEvent;
use crate::transaction::{Transaction, TxInner, TxState};
use crate::view::ViewId;

/// Access to a transaction while its conflicts are being resolved
pub struct ResolveContext<'a> {
    tx: &'a TxInner,
    state: &'a mut TxState,
}

impl<'a> ResolveContext<'a> {
    /// The transaction being resolved
    pub fn view_id(&self) -> ViewId { self.tx.core.id }

    /// Identifier of an object, also for locally detached ones
    pub fn object_id(&self, object: &CdoObject) -> ObjectId {
        let id = object.id();
        if !id.is_null() {
            return id;
        }
        self.state.savepoints.detached_id_of(object).unwrap_or(ObjectId::Null)
    }

    /// True if the object is still in conflict
    pub fn is_conflict(&self, object: &CdoObject) -> bool {
        object.state() == ObjectState::Conflict
    }

    /// True if the object was detached locally
    pub fn is_detached(&self, object: &CdoObject) -> bool {
        object.view_id().is_none()
    }

    /// All local changes to an object, merged across savepoints
    pub fn local_delta(&self, object: &CdoObject) -> Option<RevisionDelta> {
        self.state.savepoints.merged_delta(self.object_id(object))
    }

    /// Remote changes seen for an object, oldest first
    pub fn remote_deltas(&self, object: &CdoObject) -> Vec<RevisionDelta> {
        self.state.remote_deltas.get(&self.object_id(object)).cloned().unwrap_or_default()
    }

    /// The latest revision of an object; `None` if it was detached remotely
    pub fn latest_revision(&self, object: &CdoObject) -> Result<Option<Revision>> {
        self.tx.current_revision(self.object_id(object))
    }

    /// The revision local changes were made against
    pub fn base_revision(&self, object: &CdoObject) -> Result<Option<Revision>> {
        let id = self.object_id(object);
        let base = match self.local_delta(object) {
            Some(delta) => delta.base(),
            None => match self.state.former_revisions.get(&id) {
                Some(rev) => rev.branch_version(),
                None => return Ok(None),
            },
        };
        self.tx.core.session.revisions.revision_by_version(id, base)
    }

    /// Features changed remotely since the local base revision
    pub fn remote_features(&self, object: &CdoObject) -> Result<Vec<Feature>> {
        let remote = self.remote_deltas(object);
        if !remote.is_empty() {
            let mut features: Vec<Feature> = remote.iter().flat_map(|d| d.touched_features()).collect();
            features.sort();
            features.dedup();
            return Ok(features);
        }
        match (self.base_revision(object)?, self.latest_revision(object)?) {
            (Some(base), Some(latest)) => Ok(RevisionDelta::from_diff(&base, &latest)?
                .map(|d| d.touched_features().into_iter().collect())
                .unwrap_or_default()),
            _ => Ok(vec![]),
        }
    }

    /// Throw away all local changes to an object: it becomes clean at the
    /// latest revision, or transient if it no longer exists
    pub fn rollback_object(&mut self, object: &CdoObject) -> Result<()> {
        let id = self.object_id(object);
        if id.is_null() || id.is_temporary() {
            return Err(Error::illegal(format!("{:?} is not a persistent object", object)));
        }
        self.state.savepoints.forget_changes(id);
        self.state.former_revisions.remove(&id);
        self.state.remote_deltas.remove(&id);
        self.tx.clean_object(object, id)?;
        trace!("Transaction {}: rolled back {}", self.tx.core.id, id);
        Ok(())
    }

    /// Apply `delta` on top of the latest revision of an object and record
    /// it as the object's only local change
    pub fn change_object(&mut self, object: &CdoObject, delta: RevisionDelta) -> Result<()> {
        let id = self.object_id(object);
        let latest = self.latest_revision(object)?.ok_or(StoreError::NotFound(id))?;
        let mut delta = delta;
        delta.set_id(id);
        delta.set_base(latest.branch_version());
        let mut rev = latest;
        delta.apply(&mut rev)?;
        {
            let mut data = object.lock();
            let event = if data.state == ObjectState::Conflict { ObjectEvent::Resolve } else { ObjectEvent::Write };
            self.tx.core.session.state_machine.apply(&mut data, event)?;
            data.id = id;
            data.revision = Some(rev);
            data.view = Some(self.tx.core.id);
            data.transient.clear();
        }
        self.tx.core.register(id, object);
        self.state.savepoints.forget_changes(id);
        self.state.remote_deltas.remove(&id);
        self.state.former_revisions.remove(&id);
        let last = self.state.savepoints.last_mut();
        last.revision_deltas.insert(id, delta);
        last.dirty_objects.insert(id, object.clone());
        self.state.dirty = true;
        trace!("Transaction {}: re-applied local changes to {}", self.tx.core.id, id);
        Ok(())
    }
}

/// Resolves (some) conflicts of a transaction
pub trait ConflictResolver: Send + Sync {
    /// Resolve some or all of `conflicts`. Objects left in state `Conflict`
    /// are passed to the next resolver.
    fn resolve_conflicts(&self, ctx: &mut ResolveContext, conflicts: &[CdoObject]) -> Result<()>;
}

/// Resolve by dropping the local changes of conflicting objects
#[derive(Debug, Default)]
pub struct DiscardLocalChanges;

impl ConflictResolver for DiscardLocalChanges {
    fn resolve_conflicts(&self, ctx: &mut ResolveContext, conflicts: &[CdoObject]) -> Result<()> {
        for object in conflicts {
            ctx.rollback_object(object)?;
        }
        Ok(())
    }
}

/// Resolve by taking the remote state and re-applying local changes on top.
/// Locally detached objects stay detached unless they were detached
/// remotely too.
#[derive(Debug, Default)]
pub struct TakeRemoteChangesThenApplyLocalChanges;

impl ConflictResolver for TakeRemoteChangesThenApplyLocalChanges {
    fn resolve_conflicts(&self, ctx: &mut ResolveContext, conflicts: &[CdoObject]) -> Result<()> {
        for object in conflicts {
            if ctx.latest_revision(object)?.is_none() {
                // gone remotely: nothing to apply to
                ctx.rollback_object(object)?;
                continue;
            }
            if ctx.is_detached(object) {
                let id = ctx.object_id(object);
                let latest = ctx.latest_revision(object)?;
                if let Some(latest) = latest {
                    ctx.state.former_revisions.insert(id, latest);
                }
                ctx.state.remote_deltas.remove(&id);
                object.lock().state = ObjectState::Transient;
                continue;
            }
            let local = ctx.local_delta(object);
            ctx.rollback_object(object)?;
            if let Some(delta) = local {
                ctx.change_object(object, delta)?;
            }
        }
        Ok(())
    }
}

/// A three-way merge of local and remote changes of one object
pub trait ThreeWayMerge: Send + Sync {
    /// Merge. `local` holds all local changes; `remote` the remote changes
    /// known, possibly none (in which case they can be computed from
    /// `ResolveContext::base_revision` and `latest_revision`).
    fn merge(&self, ctx: &mut ResolveContext, object: &CdoObject, local: RevisionDelta,
            remote: Vec<RevisionDelta>) -> Result<()>;

    /// Run `merge` over all conflicting objects with local changes
    fn resolve_three_way(&self, ctx: &mut ResolveContext, conflicts: &[CdoObject]) -> Result<()> {
        for object in conflicts {
            let local = match ctx.local_delta(object) {
                Some(local) => local,
                None => continue,
            };
            if ctx.is_detached(object) {
                continue;
            }
            let remote = ctx.remote_deltas(object);
            self.merge(ctx, object, local, remote)?;
        }
        Ok(())
    }
}

/// Merge local and remote changes if they touch different features. Fails
/// if any feature was changed on both sides.
#[derive(Debug, Default)]
pub struct MergeLocalChangesPerFeature;

impl ThreeWayMerge for MergeLocalChangesPerFeature {
    fn merge(&self, ctx: &mut ResolveContext, object: &CdoObject, local: RevisionDelta,
            _remote: Vec<RevisionDelta>) -> Result<()>
    {
        if ctx.latest_revision(object)?.is_none() {
            return Err(Error::Resolver(format!("{} was detached remotely", ctx.object_id(object))));
        }
        let remote_features = ctx.remote_features(object)?;
        let local_features = local.touched_features();
        let both: Vec<&str> = remote_features.iter()
            .filter(|f| local_features.contains(*f))
            .map(|f| f.name())
            .collect();
        if !both.is_empty() {
            return Err(Error::Resolver(format!("{} changed locally and remotely: {}",
                    ctx.object_id(object), both.join(", "))));
        }
        ctx.rollback_object(object)?;
        ctx.change_object(object, local)
    }
}

impl ConflictResolver for MergeLocalChangesPerFeature {
    fn resolve_conflicts(&self, ctx: &mut ResolveContext, conflicts: &[CdoObject]) -> Result<()> {
        self.resolve_three_way(ctx, conflicts)
    }
}

// Everything resolution or an import may touch, for undo
pub(crate) struct Snapshot {
    savepoints: SavepointStack,
    former_revisions: HashMap<ObjectId, Revision>,
    remote_deltas: BTreeMap<ObjectId, Vec<RevisionDelta>>,
    dirty: bool,
    objects: Vec<(CdoObject, ObjectState, ObjectId, Option<Revision>, Option<ViewId>, BTreeMap<Feature, Value>)>,
}

impl Snapshot {
    pub fn take(state: &TxState, objects: &[CdoObject]) -> Snapshot {
        Snapshot {
            savepoints: state.savepoints.clone(),
            former_revisions: state.former_revisions.clone(),
            remote_deltas: state.remote_deltas.clone(),
            dirty: state.dirty,
            objects: objects.iter().map(|o| {
                let data = o.lock();
                (o.clone(), data.state, data.id, data.revision.clone(), data.view, data.transient.clone())
            }).collect(),
        }
    }

    pub fn restore(self, tx: &TxInner, state: &mut TxState) {
        state.savepoints = self.savepoints;
        state.former_revisions = self.former_revisions;
        state.remote_deltas = self.remote_deltas;
        state.dirty = self.dirty;
        for (object, obj_state, id, revision, view, transient) in self.objects {
            {
                let mut data = object.lock();
                data.state = obj_state;
                data.id = id;
                data.revision = revision;
                data.view = view;
                data.transient = transient;
            }
            if view == Some(tx.core.id) {
                tx.core.register(id, &object);
            } else if let Some(current) = tx.core.lookup(id) {
                if current.ptr_eq(&object) {
                    tx.core.deregister(id);
                }
            }
        }
        state.recount_conflicts();
    }
}

impl Transaction {
    /// Resolve conflicts with the resolvers configured for this transaction
    pub fn handle_conflicts(&self) -> Result<()> {
        let resolvers = self.inner().options.resolvers.clone();
        self.resolve_conflicts(&resolvers)
    }

    /// Run resolvers, in order, over the objects still in conflict. On
    /// failure all changes made by the resolvers are undone and
    /// `Error::Resolver` is returned.
    pub fn resolve_conflicts(&self, resolvers: &[Arc<dyn ConflictResolver>]) -> Result<()> {
        let inner = self.inner();
        let _guard = inner.core.session.invalidation_lock();
        let mut state = inner.lock_state();
        let mut remaining = state.conflicts();
        if remaining.is_empty() {
            return Ok(());
        }
        let total = remaining.len();
        let snapshot = Snapshot::take(&state, &remaining);
        for resolver in resolvers {
            if remaining.is_empty() {
                break;
            }
            let result = {
                let mut ctx = ResolveContext { tx: inner, state: &mut *state };
                resolver.resolve_conflicts(&mut ctx, &remaining)
            };
            if let Err(e) = result {
                warn!("Transaction {}: conflict resolution failed, restoring: {}", self.id(), e);
                snapshot.restore(inner, &mut *state);
                return Err(match e {
                    Error::Resolver(msg) => Error::Resolver(msg),
                    other => Error::Resolver(other.to_string()),
                });
            }
            remaining.retain(|o| o.state() == ObjectState::Conflict);
        }
        state.recount_conflicts();
        info!("Transaction {}: resolved {} of {} conflicts", self.id(), total - remaining.len(), total);
        Ok(())
    }
}
