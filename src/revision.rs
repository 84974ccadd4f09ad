/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Revisions: immutable, versioned snapshots of one object's state
//!
//! A revision is addressed by `(id, branch, version)`. Feature data is kept
//! in a map from opaque feature keys to typed values; the model layer binding
//! those keys to real attributes is not part of this crate.

use std::collections::BTreeMap;
use std::fmt;

use crate::branch::{BranchId, BranchVersion, UNSPECIFIED_DATE};
use crate::error::DeltaOp;
use crate::id::{IdMapper, ObjectId};

/// Opaque feature key
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Feature(String);

impl Feature {
    /// Create from a name
    pub fn new<S: Into<String>>(name: S) -> Feature { Feature(name.into()) }
    /// The feature name
    pub fn name(&self) -> &str { &self.0 }
}
impl<'a> From<&'a str> for Feature {
    fn from(name: &'a str) -> Feature { Feature(name.to_string()) }
}
impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { f.write_str(&self.0) }
}
impl fmt::Debug for Feature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { write!(f, "'{}'", self.0) }
}

/// Typed feature value
#[derive(Clone, PartialEq, Debug)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Text(String),
    /// Reference to another object
    Ref(ObjectId),
    /// Many-valued feature
    List(Vec<Value>),
}

impl Value {
    /// Replace object identifiers inside this value according to `mapper`
    pub fn adjust_references(&mut self, mapper: &IdMapper) {
        match *self {
            Value::Ref(ref mut id) => *id = mapper.adjust(*id),
            Value::List(ref mut items) => {
                for item in items {
                    item.adjust_references(mapper);
                }
            }
            _ => {}
        }
    }
}

impl<'a> From<&'a str> for Value {
    fn from(s: &'a str) -> Value { Value::Text(s.to_string()) }
}
impl From<i64> for Value {
    fn from(n: i64) -> Value { Value::Int(n) }
}
impl From<bool> for Value {
    fn from(b: bool) -> Value { Value::Bool(b) }
}
impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Value { Value::Ref(id) }
}

/// Identifies the class of an object within a package.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ClassRef {
    /// URI of the package defining the class
    pub package: String,
    /// Name of the class
    pub name: String,
}

impl ClassRef {
    /// Create
    pub fn new<P: Into<String>, N: Into<String>>(package: P, name: N) -> ClassRef {
        ClassRef { package: package.into(), name: name.into() }
    }
}

/// Feature data of a normal revision
#[derive(Clone, PartialEq, Debug)]
pub struct RevisionData {
    /// Class of the object
    pub class: ClassRef,
    /// True for resources (root containers)
    pub resource: bool,
    /// Feature values; unset features are absent
    pub values: BTreeMap<Feature, Value>,
}

impl RevisionData {
    /// Create with no feature values
    pub fn new(class: ClassRef) -> RevisionData {
        RevisionData { class, resource: false, values: BTreeMap::new() }
    }
}

/// Variants of a revision
#[derive(Clone, PartialEq, Debug)]
pub enum RevisionKind {
    /// Full feature data
    Normal(RevisionData),
    /// Object unchanged on this branch since its base; resolves to `target`
    /// on an ancestor branch (or to nothing if the object did not exist
    /// there)
    Pointer {
        /// The authoritative revision, if any
        target: Option<BranchVersion>,
    },
    /// Object deleted as of this version
    Detached,
}

/// An immutable snapshot of one object at one branch version.
///
/// Pointer revisions have version 0; they do not occupy a slot in the
/// version sequence of their branch.
#[derive(Clone, PartialEq, Debug)]
pub struct Revision {
    id: ObjectId,
    branch_version: BranchVersion,
    created: i64,
    revised: i64,
    kind: RevisionKind,
}

impl Revision {
    /// Create a normal revision with no feature values
    pub fn new(id: ObjectId, branch_version: BranchVersion, created: i64, class: ClassRef) -> Revision {
        Revision {
            id,
            branch_version,
            created,
            revised: UNSPECIFIED_DATE,
            kind: RevisionKind::Normal(RevisionData::new(class)),
        }
    }

    /// Create a pointer revision
    pub fn pointer(id: ObjectId, branch: BranchId, created: i64, revised: i64,
            target: Option<BranchVersion>) -> Revision
    {
        Revision {
            id,
            branch_version: branch.version(0),
            created,
            revised,
            kind: RevisionKind::Pointer { target },
        }
    }

    /// Create a detached revision
    pub fn detached(id: ObjectId, branch_version: BranchVersion, created: i64, revised: i64) -> Revision {
        Revision { id, branch_version, created, revised, kind: RevisionKind::Detached }
    }

    /// Create from parts; used by readers
    pub fn from_parts(id: ObjectId, branch_version: BranchVersion, created: i64,
            revised: i64, kind: RevisionKind) -> Revision
    {
        Revision { id, branch_version, created, revised, kind }
    }

    pub fn id(&self) -> ObjectId { self.id }
    pub fn branch_version(&self) -> BranchVersion { self.branch_version }
    pub fn branch(&self) -> BranchId { self.branch_version.branch }
    pub fn version(&self) -> u32 { self.branch_version.version }
    /// Creation time
    pub fn created(&self) -> i64 { self.created }
    /// Time at which this was superseded, or `UNSPECIFIED_DATE`
    pub fn revised(&self) -> i64 { self.revised }
    pub fn kind(&self) -> &RevisionKind { &self.kind }

    pub fn set_id(&mut self, id: ObjectId) { self.id = id; }
    pub fn set_branch_version(&mut self, bv: BranchVersion) { self.branch_version = bv; }
    pub fn set_created(&mut self, time: i64) { self.created = time; }
    pub fn set_revised(&mut self, time: i64) { self.revised = time; }

    /// True if this revision is current (not superseded)
    pub fn is_current(&self) -> bool { self.revised == UNSPECIFIED_DATE }

    /// True if this revision is the valid one at `time`. `UNSPECIFIED_DATE`
    /// asks for the current revision.
    pub fn is_valid_at(&self, time: i64) -> bool {
        if time == UNSPECIFIED_DATE {
            return self.is_current();
        }
        self.created <= time && (self.revised == UNSPECIFIED_DATE || time <= self.revised)
    }

    pub fn is_normal(&self) -> bool {
        match self.kind { RevisionKind::Normal(_) => true, _ => false }
    }
    pub fn is_pointer(&self) -> bool {
        match self.kind { RevisionKind::Pointer { .. } => true, _ => false }
    }
    pub fn is_detached(&self) -> bool {
        match self.kind { RevisionKind::Detached => true, _ => false }
    }

    /// The pointer target, if this is a pointer with a target
    pub fn target(&self) -> Option<BranchVersion> {
        match self.kind {
            RevisionKind::Pointer { target } => target,
            _ => None,
        }
    }

    /// Feature data (normal revisions only)
    pub fn data(&self) -> Result<&RevisionData, DeltaOp> {
        match self.kind {
            RevisionKind::Normal(ref data) => Ok(data),
            _ => Err(DeltaOp::NoData),
        }
    }
    /// Mutable feature data (normal revisions only)
    pub fn data_mut(&mut self) -> Result<&mut RevisionData, DeltaOp> {
        match self.kind {
            RevisionKind::Normal(ref mut data) => Ok(data),
            _ => Err(DeltaOp::NoData),
        }
    }

    /// Class of a normal revision
    pub fn class(&self) -> Option<&ClassRef> {
        self.data().ok().map(|d| &d.class)
    }

    /// Get a feature value. Returns `None` if unset or not a normal revision.
    pub fn get(&self, feature: &Feature) -> Option<&Value> {
        self.data().ok().and_then(|d| d.values.get(feature))
    }
    /// Set a feature value
    pub fn set(&mut self, feature: Feature, value: Value) -> Result<(), DeltaOp> {
        self.data_mut()?.values.insert(feature, value);
        Ok(())
    }

    /// Copy for modification. Equivalent to `clone`; the copy is detached
    /// from any cache the original lives in.
    pub fn copy(&self) -> Revision { self.clone() }

    /// Turn a working copy into the revision a commit on `branch` at `time`
    /// produces: the next version on the same branch, or the first version
    /// when the base revision lives on another (ancestor) branch.
    pub fn adjust_for_commit(&mut self, branch: BranchId, time: i64) {
        if self.branch_version.branch == branch {
            self.branch_version.version += 1;
        } else {
            self.branch_version = branch.version(1);
        }
        self.created = time;
        self.revised = UNSPECIFIED_DATE;
    }

    /// Replace the identifier and references according to `mapper`
    pub fn adjust_references(&mut self, mapper: &IdMapper) {
        self.id = mapper.adjust(self.id);
        if let RevisionKind::Normal(ref mut data) = self.kind {
            for value in data.values.values_mut() {
                value.adjust_references(mapper);
            }
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            RevisionKind::Normal(_) => "",
            RevisionKind::Pointer { .. } => " (pointer)",
            RevisionKind::Detached => " (detached)",
        };
        write!(f, "{}:{}{}", self.id, self.branch_version, kind)
    }
}
