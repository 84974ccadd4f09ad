/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Object identifiers

use std::collections::HashMap;
use std::fmt;

/// Identifies a persistent object within a repository.
///
/// Persistent identifiers are assigned by the repository and are stable
/// across branches and time. Temporary identifiers are handed out by a
/// transaction for objects created in it and are replaced by persistent
/// identifiers when the transaction commits.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectId {
    /// No object
    Null,
    /// Assigned by the repository
    Persistent(u64),
    /// Assigned by a transaction before commit
    Temp(u32),
}

impl ObjectId {
    /// True for `Temp(_)`
    pub fn is_temporary(self) -> bool {
        match self {
            ObjectId::Temp(_) => true,
            _ => false,
        }
    }
    /// True for `Null`
    pub fn is_null(self) -> bool {
        self == ObjectId::Null
    }
    /// True for `Persistent(_)`
    pub fn is_persistent(self) -> bool {
        match self {
            ObjectId::Persistent(_) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ObjectId::Null => write!(f, "NULL"),
            ObjectId::Persistent(n) => write!(f, "L{}", n),
            ObjectId::Temp(n) => write!(f, "t{}", n),
        }
    }
}
impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Issues temporary identifiers for one transaction.
///
/// The counter only ever grows: a temporary identifier is never issued
/// twice, even after an earlier one has been remapped by a commit.
#[derive(Debug, Default)]
pub struct TempIdGen {
    last: u32,
}

impl TempIdGen {
    /// Create, starting at `t1`
    pub fn new() -> TempIdGen {
        TempIdGen { last: 0 }
    }
    /// Get the next temporary identifier
    pub fn next_id(&mut self) -> ObjectId {
        self.last += 1;
        ObjectId::Temp(self.last)
    }
    /// The last identifier issued, if any
    pub fn last(&self) -> Option<ObjectId> {
        if self.last == 0 { None } else { Some(ObjectId::Temp(self.last)) }
    }
}

/// Maps identifiers (usually temporary to persistent).
///
/// Unmapped identifiers map to themselves.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IdMapper {
    map: HashMap<ObjectId, ObjectId>,
}

impl IdMapper {
    /// Create an empty mapping
    pub fn new() -> IdMapper {
        IdMapper { map: HashMap::new() }
    }
    /// Create from a map
    pub fn from_map(map: HashMap<ObjectId, ObjectId>) -> IdMapper {
        IdMapper { map }
    }
    /// Add a mapping
    pub fn insert(&mut self, from: ObjectId, to: ObjectId) {
        self.map.insert(from, to);
    }
    /// Map an identifier
    pub fn adjust(&self, id: ObjectId) -> ObjectId {
        self.map.get(&id).cloned().unwrap_or(id)
    }
    /// Get a mapping if one exists
    pub fn get(&self, id: ObjectId) -> Option<ObjectId> {
        self.map.get(&id).cloned()
    }
    /// Number of mappings
    pub fn len(&self) -> usize { self.map.len() }
    /// True if no mappings
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    /// Iterate over all `(from, to)` pairs
    pub fn iter<'a>(&'a self) -> impl Iterator<Item = (ObjectId, ObjectId)> + 'a {
        self.map.iter().map(|(k, v)| (*k, *v))
    }
}

#[test]
fn temp_ids_are_unique() {
    let mut gen = TempIdGen::new();
    assert_eq!(gen.last(), None);
    let a = gen.next_id();
    let b = gen.next_id();
    assert!(a.is_temporary() && b.is_temporary());
    assert!(a != b);
    assert_eq!(gen.last(), Some(b));
}

#[test]
fn mapper_defaults_to_identity() {
    let mut m = IdMapper::new();
    m.insert(ObjectId::Temp(1), ObjectId::Persistent(17));
    assert_eq!(m.adjust(ObjectId::Temp(1)), ObjectId::Persistent(17));
    assert_eq!(m.adjust(ObjectId::Temp(2)), ObjectId::Temp(2));
    assert_eq!(m.adjust(ObjectId::Null), ObjectId::Null);
}
