/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Live objects
//!
//! A `CdoObject` is a shared handle: clones refer to the same object. While
//! attached to a view, an object has an identifier and a *working revision*
//! (a private copy of the cached revision, modified in place by local
//! changes). A transient object keeps its feature values locally until it
//! is attached.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::id::ObjectId;
use crate::revision::{ClassRef, Feature, Revision, Value};
use crate::view::ViewId;

/// State of an object with respect to one view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectState {
    /// Not attached to any view
    Transient,
    /// Matches its revision
    Clean,
    /// Created, not yet committed
    New,
    /// Modified since load or commit
    Dirty,
    /// Dirty, and a concurrent remote modification was detected
    Conflict,
    /// Reference known, data not loaded (or invalidated)
    Proxy,
}

pub(crate) struct ObjectData {
    pub class: ClassRef,
    pub resource: bool,
    pub state: ObjectState,
    pub id: ObjectId,
    pub revision: Option<Revision>,
    pub transient: BTreeMap<Feature, Value>,
    pub view: Option<ViewId>,
}

/// Handle to a live object
#[derive(Clone)]
pub struct CdoObject {
    inner: Arc<Mutex<ObjectData>>,
}

impl CdoObject {
    /// Create a new transient object
    pub fn new(class: ClassRef) -> CdoObject {
        CdoObject::with_flag(class, false)
    }

    /// Create a new transient resource (a root container object)
    pub fn new_resource(class: ClassRef) -> CdoObject {
        CdoObject::with_flag(class, true)
    }

    fn with_flag(class: ClassRef, resource: bool) -> CdoObject {
        CdoObject {
            inner: Arc::new(Mutex::new(ObjectData {
                class,
                resource,
                state: ObjectState::Transient,
                id: ObjectId::Null,
                revision: None,
                transient: BTreeMap::new(),
                view: None,
            })),
        }
    }

    // Create a proxy for a persistent object known to a view
    pub(crate) fn proxy(id: ObjectId, revision: Revision, view: ViewId) -> CdoObject {
        let class = revision.class().cloned().unwrap_or_else(|| ClassRef::new("", ""));
        let resource = revision.data().map(|d| d.resource).unwrap_or(false);
        CdoObject {
            inner: Arc::new(Mutex::new(ObjectData {
                class,
                resource,
                state: ObjectState::Proxy,
                id,
                revision: Some(revision),
                transient: BTreeMap::new(),
                view: Some(view),
            })),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<ObjectData> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True if both handles refer to the same object
    pub fn ptr_eq(&self, other: &CdoObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn state(&self) -> ObjectState { self.lock().state }
    pub fn id(&self) -> ObjectId { self.lock().id }
    pub fn class(&self) -> ClassRef { self.lock().class.clone() }
    pub fn is_resource(&self) -> bool { self.lock().resource }
    /// The view this object is attached to, if any
    pub fn view_id(&self) -> Option<ViewId> { self.lock().view }

    /// A copy of the working revision (none while transient)
    pub fn revision(&self) -> Option<Revision> {
        self.lock().revision.clone()
    }

    /// Version of the working revision, if any
    pub fn version(&self) -> Option<u32> {
        self.lock().revision.as_ref().map(|r| r.version())
    }

    /// Read a feature. Attached objects read their working revision,
    /// transient ones their local values.
    pub fn get(&self, feature: &Feature) -> Option<Value> {
        let data = self.lock();
        match data.revision {
            Some(ref rev) => rev.get(feature).cloned(),
            None => data.transient.get(feature).cloned(),
        }
    }

    /// Set a feature value on a transient object. Attached objects must be
    /// modified through their transaction.
    pub fn set_transient(&self, feature: Feature, value: Value) -> bool {
        let mut data = self.lock();
        if data.state != ObjectState::Transient {
            return false;
        }
        data.transient.insert(feature, value);
        true
    }
}

impl PartialEq for CdoObject {
    fn eq(&self, other: &CdoObject) -> bool { self.ptr_eq(other) }
}
impl Eq for CdoObject {}

impl fmt::Debug for CdoObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let data = self.lock();
        write!(f, "{}#{}[{:?}]", data.class.name, data.id, data.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_values() {
        let obj = CdoObject::new(ClassRef::new("shop", "Product"));
        assert_eq!(obj.state(), ObjectState::Transient);
        assert!(obj.set_transient("name".into(), "lamp".into()));
        assert_eq!(obj.get(&"name".into()), Some(Value::Text("lamp".to_string())));
        assert!(obj.revision().is_none());

        let other = obj.clone();
        assert!(other.ptr_eq(&obj));
        assert!(obj != CdoObject::new(ClassRef::new("shop", "Product")));
    }
}
