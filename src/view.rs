/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Views: live objects of one branch point
//!
//! A view maps identifiers to live objects, resolving unknown identifiers
//! lazily through the session's revision cache. Views at the head of a
//! branch follow remote commits on that branch; historical views never
//! change.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::branch::BranchPoint;
use crate::delta::RevisionDelta;
use crate::error::{Result, StoreError};
use crate::id::{IdMapper, ObjectId};
use crate::object::{CdoObject, ObjectState};
use crate::revision::{Feature, Value};
use crate::session::SessionInner;
use crate::state_machine::ObjectEvent;
use crate::store::Invalidation;

/// Identifies a view (or transaction) within its session
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ViewId(pub u64);

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "V{}", self.0)
    }
}

/// How a transaction finished
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FinishedKind {
    Committed,
    RolledBack,
}

/// Events delivered to view listeners
#[derive(Clone, Debug)]
pub enum ViewEvent {
    /// Remote changes were applied
    Invalidation {
        timestamp: i64,
        dirty: Vec<ObjectId>,
        detached: Vec<ObjectId>,
        deltas: Vec<RevisionDelta>,
    },
    /// An object of a transaction entered conflict; `first` if no other
    /// object was in conflict before
    Conflict { object: CdoObject, first: bool },
    /// A transaction became dirty
    Started,
    /// A transaction committed or rolled back. Mappings are from temporary
    /// to persistent identifiers (empty on rollback).
    Finished { kind: FinishedKind, id_mappings: IdMapper },
}

/// Observer of view events.
///
/// Failures are logged and otherwise ignored: they never reach the
/// operation which triggered the event.
pub trait ViewListener: Send + Sync {
    fn notify(&self, view: ViewId, event: &ViewEvent) -> Result<()>;
}

impl<F> ViewListener for F where F: Fn(ViewId, &ViewEvent) -> Result<()> + Send + Sync {
    fn notify(&self, view: ViewId, event: &ViewEvent) -> Result<()> {
        self(view, event)
    }
}

// Receives invalidations from the session
pub(crate) trait InvalidationTarget: Send + Sync {
    fn view_id(&self) -> ViewId;
    // Apply an invalidation; return the events to deliver once the session
    // has released its locks.
    fn invalidate(&self, inv: &Invalidation) -> Vec<ViewEvent>;
    fn notify(&self, events: Vec<ViewEvent>);
}

// State shared by views and transactions
pub(crate) struct ViewCore {
    pub id: ViewId,
    pub session: Arc<SessionInner>,
    pub point: BranchPoint,
    objects: Mutex<HashMap<ObjectId, CdoObject>>,
    listeners: Mutex<Vec<Arc<dyn ViewListener>>>,
}

impl ViewCore {
    pub fn new(id: ViewId, session: Arc<SessionInner>, point: BranchPoint) -> ViewCore {
        ViewCore {
            id,
            session,
            point,
            objects: Mutex::new(HashMap::new()),
            listeners: Mutex::new(vec![]),
        }
    }

    pub fn objects(&self) -> MutexGuard<HashMap<ObjectId, CdoObject>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lookup(&self, id: ObjectId) -> Option<CdoObject> {
        self.objects().get(&id).cloned()
    }

    pub fn register(&self, id: ObjectId, object: &CdoObject) {
        self.objects().insert(id, object.clone());
    }

    pub fn deregister(&self, id: ObjectId) {
        self.objects().remove(&id);
    }

    /// Get the live object for `id`, loading it if necessary
    pub fn get_object(&self, id: ObjectId) -> Result<CdoObject> {
        if let Some(object) = self.lookup(id) {
            if object.state() == ObjectState::Proxy {
                self.load(&object)?;
            }
            return Ok(object);
        }
        let revision = self.session.revisions.revision(id, self.point)?
            .ok_or(StoreError::NotFound(id))?;
        let object = CdoObject::proxy(id, revision, self.id);
        self.session.state_machine.process(&object, ObjectEvent::Load)?;
        // another thread may have been quicker
        let mut objects = self.objects();
        Ok(objects.entry(id).or_insert(object).clone())
    }

    /// Load the current revision of a proxy
    pub fn load(&self, object: &CdoObject) -> Result<()> {
        let id = object.id();
        let revision = self.session.revisions.revision(id, self.point)?;
        let mut data = object.lock();
        if data.state != ObjectState::Proxy {
            return Ok(());
        }
        match revision {
            Some(rev) => {
                trace!("View {}: loaded {}", self.id, rev);
                data.revision = Some(rev);
                self.session.state_machine.apply(&mut data, ObjectEvent::Load)?;
                Ok(())
            }
            None => {
                self.session.state_machine.apply(&mut data, ObjectEvent::Detach)?;
                data.revision = None;
                data.view = None;
                data.id = ObjectId::Null;
                drop(data);
                self.deregister(id);
                Err(StoreError::NotFound(id).into())
            }
        }
    }

    /// Read a feature, loading the object if it is a proxy
    pub fn read(&self, object: &CdoObject, feature: &Feature) -> Result<Option<Value>> {
        if object.state() == ObjectState::Proxy {
            self.load(object)?;
        }
        Ok(object.get(feature))
    }

    pub fn add_listener(&self, listener: Arc<dyn ViewListener>) {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ViewListener>) {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Deliver events to all listeners, isolating failures
    pub fn fire(&self, events: Vec<ViewEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner).clone();
        for event in &events {
            for listener in &listeners {
                if let Err(e) = listener.notify(self.id, event) {
                    error!("View {}: listener failed on {:?}: {}", self.id, event_name(event), e);
                }
            }
        }
    }

    /// True if this view follows remote commits on `inv.branch`
    pub fn follows(&self, inv: &Invalidation) -> bool {
        self.point.is_head() && self.point.branch == inv.branch
    }

    /// Apply an invalidation to clean objects: changed ones become proxies,
    /// detached ones leave the view.
    pub fn invalidate_clean(&self, inv: &Invalidation) -> Vec<ViewEvent> {
        if !self.follows(inv) {
            return vec![];
        }
        let sm = &self.session.state_machine;
        let mut dirty = vec![];
        let mut detached = vec![];
        for &(id, _) in &inv.dirty {
            if let Some(object) = self.lookup(id) {
                let mut data = object.lock();
                if data.state == ObjectState::Clean {
                    if let Err(e) = sm.apply(&mut data, ObjectEvent::Invalidate) {
                        warn!("View {}: cannot invalidate {}: {}", self.id, id, e);
                        continue;
                    }
                    data.revision = None;
                }
                dirty.push(id);
            }
        }
        for &id in &inv.detached {
            let removed = self.objects().remove(&id);
            if let Some(object) = removed {
                let mut data = object.lock();
                if let Err(e) = sm.apply(&mut data, ObjectEvent::Detach) {
                    warn!("View {}: cannot detach {}: {}", self.id, id, e);
                }
                data.revision = None;
                data.view = None;
                data.id = ObjectId::Null;
                detached.push(id);
            }
        }
        if dirty.is_empty() && detached.is_empty() {
            return vec![];
        }
        debug!("View {}: invalidated {} objects, {} detached", self.id, dirty.len(), detached.len());
        vec![ViewEvent::Invalidation {
            timestamp: inv.timestamp,
            dirty,
            detached,
            deltas: inv.deltas.clone(),
        }]
    }
}

fn event_name(event: &ViewEvent) -> &'static str {
    match *event {
        ViewEvent::Invalidation { .. } => "invalidation",
        ViewEvent::Conflict { .. } => "conflict",
        ViewEvent::Started => "started",
        ViewEvent::Finished { .. } => "finished",
    }
}

impl InvalidationTarget for ViewCore {
    fn view_id(&self) -> ViewId { self.id }
    fn invalidate(&self, inv: &Invalidation) -> Vec<ViewEvent> {
        self.invalidate_clean(inv)
    }
    fn notify(&self, events: Vec<ViewEvent>) {
        self.fire(events);
    }
}

/// A read-only view
pub struct View {
    core: Arc<ViewCore>,
}

impl View {
    pub(crate) fn new(core: Arc<ViewCore>) -> View {
        View { core }
    }

    pub fn id(&self) -> ViewId { self.core.id }

    /// The branch point this view shows
    pub fn branch_point(&self) -> BranchPoint { self.core.point }

    /// True if this view shows a fixed point in time
    pub fn is_historical(&self) -> bool { !self.core.point.is_head() }

    /// Get the live object for `id`
    pub fn get_object(&self, id: ObjectId) -> Result<CdoObject> {
        self.core.get_object(id)
    }

    /// Read a feature of an object of this view, reloading it if remote
    /// changes were reported since it was last read
    pub fn read(&self, object: &CdoObject, feature: &Feature) -> Result<Option<Value>> {
        self.core.read(object, feature)
    }

    pub fn add_listener(&self, listener: Arc<dyn ViewListener>) {
        self.core.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ViewListener>) {
        self.core.remove_listener(listener);
    }

    /// Stop following remote commits
    pub fn close(&self) {
        self.core.session.deregister_view(self.core.id);
    }
}

impl Drop for View {
    fn drop(&mut self) {
        self.close();
    }
}
