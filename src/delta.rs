/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Feature deltas and revision deltas

use std::collections::BTreeSet;
use std::fmt;

use crate::branch::BranchVersion;
use crate::error::DeltaOp;
use crate::id::{IdMapper, ObjectId};
use crate::revision::{Feature, Revision, RevisionData, Value};

/// A change to a single feature
#[derive(Clone, PartialEq, Debug)]
pub enum FeatureDelta {
    /// Feature was given a (new) value
    Set { feature: Feature, value: Value },
    /// Feature was unset
    Unset { feature: Feature },
    /// An item was inserted into a list at `index` (`None`: appended)
    Add { feature: Feature, index: Option<usize>, value: Value },
    /// The item at `index` was removed from a list
    Remove { feature: Feature, index: usize },
    /// A list item was moved
    Move { feature: Feature, from: usize, to: usize },
    /// A list was emptied
    Clear { feature: Feature },
}

impl FeatureDelta {
    /// Create a `Set`
    pub fn set<F: Into<Feature>, V: Into<Value>>(feature: F, value: V) -> FeatureDelta {
        FeatureDelta::Set { feature: feature.into(), value: value.into() }
    }
    /// Create an `Unset`
    pub fn unset<F: Into<Feature>>(feature: F) -> FeatureDelta {
        FeatureDelta::Unset { feature: feature.into() }
    }
    /// Create an appending `Add`
    pub fn add<F: Into<Feature>, V: Into<Value>>(feature: F, value: V) -> FeatureDelta {
        FeatureDelta::Add { feature: feature.into(), index: None, value: value.into() }
    }
    /// Create a `Remove`
    pub fn remove<F: Into<Feature>>(feature: F, index: usize) -> FeatureDelta {
        FeatureDelta::Remove { feature: feature.into(), index }
    }

    /// The feature changed
    pub fn feature(&self) -> &Feature {
        match *self {
            FeatureDelta::Set { ref feature, .. } |
            FeatureDelta::Unset { ref feature } |
            FeatureDelta::Add { ref feature, .. } |
            FeatureDelta::Remove { ref feature, .. } |
            FeatureDelta::Move { ref feature, .. } |
            FeatureDelta::Clear { ref feature } => feature,
        }
    }

    /// Apply to revision data
    pub fn apply(&self, data: &mut RevisionData) -> Result<(), DeltaOp> {
        match *self {
            FeatureDelta::Set { ref feature, ref value } => {
                data.values.insert(feature.clone(), value.clone());
            }
            FeatureDelta::Unset { ref feature } => {
                data.values.remove(feature);
            }
            FeatureDelta::Add { ref feature, index, ref value } => {
                let len = match data.values.get(feature) {
                    Some(Value::List(list)) => list.len(),
                    Some(_) => return Err(DeltaOp::NotList),
                    None => 0,
                };
                let index = index.unwrap_or(len);
                if index > len {
                    return Err(DeltaOp::IndexOutOfBounds);
                }
                list_mut(data, feature)?.insert(index, value.clone());
            }
            FeatureDelta::Remove { ref feature, index } => {
                let list = existing_list_mut(data, feature)?;
                if index >= list.len() {
                    return Err(DeltaOp::IndexOutOfBounds);
                }
                list.remove(index);
            }
            FeatureDelta::Move { ref feature, from, to } => {
                let list = existing_list_mut(data, feature)?;
                if from >= list.len() || to >= list.len() {
                    return Err(DeltaOp::IndexOutOfBounds);
                }
                let item = list.remove(from);
                list.insert(to, item);
            }
            FeatureDelta::Clear { ref feature } => {
                list_mut(data, feature)?.clear();
            }
        }
        Ok(())
    }

    /// Replace object identifiers in values according to `mapper`
    pub fn adjust_references(&mut self, mapper: &IdMapper) {
        match *self {
            FeatureDelta::Set { ref mut value, .. } |
            FeatureDelta::Add { ref mut value, .. } => value.adjust_references(mapper),
            _ => {}
        }
    }
}

/// Deltas removing all references to `targets` from `data`: single
/// references are unset, list items removed (highest index first).
pub fn reference_removals(data: &RevisionData, targets: &BTreeSet<ObjectId>) -> Vec<FeatureDelta> {
    let mut deltas = vec![];
    for (feature, value) in &data.values {
        match *value {
            Value::Ref(id) if targets.contains(&id) => deltas.push(FeatureDelta::unset(feature.clone())),
            Value::List(ref items) => {
                for (index, item) in items.iter().enumerate().rev() {
                    if let Value::Ref(id) = *item {
                        if targets.contains(&id) {
                            deltas.push(FeatureDelta::remove(feature.clone(), index));
                        }
                    }
                }
            }
            _ => {}
        }
    }
    deltas
}

// An absent list feature is treated as an empty list.
fn list_mut<'a>(data: &'a mut RevisionData, feature: &Feature) -> Result<&'a mut Vec<Value>, DeltaOp> {
    let value = data.values.entry(feature.clone()).or_insert_with(|| Value::List(vec![]));
    match *value {
        Value::List(ref mut list) => Ok(list),
        _ => Err(DeltaOp::NotList),
    }
}

fn existing_list_mut<'a>(data: &'a mut RevisionData, feature: &Feature) -> Result<&'a mut Vec<Value>, DeltaOp> {
    match data.values.get_mut(feature) {
        Some(Value::List(list)) => Ok(list),
        Some(_) => Err(DeltaOp::NotList),
        None => Err(DeltaOp::IndexOutOfBounds),
    }
}

/// The accumulated changes to one object relative to a base revision.
///
/// Feature deltas are kept in the order they were made and applied in that
/// order.
#[derive(Clone, PartialEq, Debug)]
pub struct RevisionDelta {
    id: ObjectId,
    base: BranchVersion,
    deltas: Vec<FeatureDelta>,
}

impl RevisionDelta {
    /// Create an empty delta against `base`
    pub fn new(id: ObjectId, base: BranchVersion) -> RevisionDelta {
        RevisionDelta { id, base, deltas: vec![] }
    }
    /// Create an empty delta against a revision
    pub fn for_revision(rev: &Revision) -> RevisionDelta {
        RevisionDelta::new(rev.id(), rev.branch_version())
    }
    /// Create from parts; used by readers
    pub fn from_parts(id: ObjectId, base: BranchVersion, deltas: Vec<FeatureDelta>) -> RevisionDelta {
        RevisionDelta { id, base, deltas }
    }

    /// Create a delta from an old revision and a new revision of the same
    /// object. Return the delta if there are any differences or `None` if
    /// the feature data is identical.
    pub fn from_diff(old: &Revision, new: &Revision) -> Result<Option<RevisionDelta>, DeltaOp> {
        if old.id() != new.id() {
            return Err(DeltaOp::Mismatch);
        }
        let old_data = old.data()?;
        let new_data = new.data()?;
        let mut deltas = vec![];
        for (feature, old_value) in &old_data.values {
            match new_data.values.get(feature) {
                Some(new_value) if new_value == old_value => { /* no change */ }
                Some(new_value) => deltas.push(FeatureDelta::Set {
                    feature: feature.clone(),
                    value: new_value.clone(),
                }),
                None => deltas.push(FeatureDelta::Unset { feature: feature.clone() }),
            }
        }
        for (feature, new_value) in &new_data.values {
            if !old_data.values.contains_key(feature) {
                deltas.push(FeatureDelta::Set { feature: feature.clone(), value: new_value.clone() });
            }
        }
        if deltas.is_empty() {
            Ok(None)
        } else {
            Ok(Some(RevisionDelta { id: old.id(), base: old.branch_version(), deltas }))
        }
    }

    pub fn id(&self) -> ObjectId { self.id }
    /// The branch version this delta was made against
    pub fn base(&self) -> BranchVersion { self.base }
    /// The version of the base revision
    pub fn version(&self) -> u32 { self.base.version }
    /// Rebase onto any branch version
    pub fn set_base(&mut self, base: BranchVersion) { self.base = base; }
    pub fn set_id(&mut self, id: ObjectId) { self.id = id; }

    /// Feature deltas, in order
    pub fn deltas(&self) -> &[FeatureDelta] { &self.deltas }
    pub fn is_empty(&self) -> bool { self.deltas.is_empty() }

    /// Append a feature delta
    pub fn add_feature_delta(&mut self, delta: FeatureDelta) {
        self.deltas.push(delta);
    }

    /// Append all feature deltas of `other`. Both deltas must describe the
    /// same object against the same base version.
    pub fn merge(&mut self, other: &RevisionDelta) -> Result<(), DeltaOp> {
        if self.id != other.id || self.base != other.base {
            return Err(DeltaOp::Mismatch);
        }
        self.deltas.extend(other.deltas.iter().cloned());
        Ok(())
    }

    /// Apply to a revision (normally a working copy of the base revision).
    /// On error the revision may be partially modified.
    /// Apply all feature deltas; on failure the revision is unchanged
    pub fn apply(&self, rev: &mut Revision) -> Result<(), DeltaOp> {
        let data = rev.data_mut()?;
        let mut result = data.clone();
        for delta in &self.deltas {
            delta.apply(&mut result)?;
        }
        *data = result;
        Ok(())
    }

    /// The set of features touched by this delta
    pub fn touched_features(&self) -> BTreeSet<Feature> {
        self.deltas.iter().map(|d| d.feature().clone()).collect()
    }

    /// Replace identifiers according to `mapper`
    pub fn adjust_references(&mut self, mapper: &IdMapper) {
        self.id = mapper.adjust(self.id);
        for delta in &mut self.deltas {
            delta.adjust_references(mapper);
        }
    }
}

impl fmt::Display for RevisionDelta {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "delta {}:{} ({} changes)", self.id, self.base, self.deltas.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::BranchId;
    use crate::revision::ClassRef;

    fn base() -> Revision {
        let mut r = Revision::new(ObjectId::Persistent(1), BranchId::MAIN.version(3), 10,
                ClassRef::new("shop", "Product"));
        r.set("name".into(), "chair".into()).unwrap();
        r.set("price".into(), Value::Int(20)).unwrap();
        r
    }

    #[test]
    fn disjoint_merge_commutes() {
        let b = base();
        let mut d1 = RevisionDelta::for_revision(&b);
        d1.add_feature_delta(FeatureDelta::set("name", "table"));
        let mut d2 = RevisionDelta::for_revision(&b);
        d2.add_feature_delta(FeatureDelta::set("price", 35i64));
        d2.add_feature_delta(FeatureDelta::add("tags", "wood"));

        let mut m12 = d1.clone();
        m12.merge(&d2).unwrap();
        let mut m21 = d2.clone();
        m21.merge(&d1).unwrap();

        let mut r12 = b.copy();
        m12.apply(&mut r12).unwrap();
        let mut r21 = b.copy();
        m21.apply(&mut r21).unwrap();
        assert_eq!(r12, r21);
        assert_eq!(r12.get(&"price".into()), Some(&Value::Int(35)));
    }

    #[test]
    fn merge_requires_same_base() {
        let b = base();
        let mut d1 = RevisionDelta::for_revision(&b);
        let d2 = RevisionDelta::new(b.id(), BranchId::MAIN.version(4));
        assert_eq!(d1.merge(&d2), Err(DeltaOp::Mismatch));
        let d3 = RevisionDelta::new(ObjectId::Persistent(2), b.branch_version());
        assert_eq!(d1.merge(&d3), Err(DeltaOp::Mismatch));
    }

    #[test]
    fn diff_then_apply() {
        let old = base();
        let mut new = old.copy();
        new.set("name".into(), "stool".into()).unwrap();
        new.data_mut().unwrap().values.remove(&Feature::new("price"));
        new.set("legs".into(), Value::Int(3)).unwrap();

        let delta = RevisionDelta::from_diff(&old, &new).unwrap().expect("changes");
        assert_eq!(delta.touched_features().len(), 3);
        let mut copy = old.copy();
        delta.apply(&mut copy).unwrap();
        assert_eq!(copy, new);

        assert_eq!(RevisionDelta::from_diff(&old, &old.copy()), Ok(None));
    }

    #[test]
    fn list_ops() {
        let mut r = base();
        let mut d = RevisionDelta::for_revision(&r);
        d.add_feature_delta(FeatureDelta::add("tags", "a"));
        d.add_feature_delta(FeatureDelta::add("tags", "b"));
        d.add_feature_delta(FeatureDelta::Move { feature: "tags".into(), from: 1, to: 0 });
        d.add_feature_delta(FeatureDelta::remove("tags", 1));
        d.apply(&mut r).unwrap();
        assert_eq!(r.get(&"tags".into()), Some(&Value::List(vec!["b".into()])));

        let mut bad = RevisionDelta::for_revision(&r);
        bad.add_feature_delta(FeatureDelta::remove("tags", 5));
        assert_eq!(bad.apply(&mut r), Err(DeltaOp::IndexOutOfBounds));
        let mut bad = RevisionDelta::for_revision(&r);
        bad.add_feature_delta(FeatureDelta::Clear { feature: "name".into() });
        assert_eq!(bad.apply(&mut r), Err(DeltaOp::NotList));
    }

    #[test]
    fn removes_references() {
        let gone = ObjectId::Persistent(7);
        let kept = ObjectId::Persistent(8);
        let mut r = base();
        r.set("supplier".into(), gone.into()).unwrap();
        r.set("parts".into(), Value::List(vec![gone.into(), kept.into(), gone.into()])).unwrap();
        r.set("backup".into(), kept.into()).unwrap();

        let targets = [gone].iter().cloned().collect();
        let removals = reference_removals(r.data().unwrap(), &targets);
        assert_eq!(removals.len(), 3);
        for fd in &removals {
            fd.apply(r.data_mut().unwrap()).unwrap();
        }
        assert_eq!(r.get(&"supplier".into()), None);
        assert_eq!(r.get(&"parts".into()), Some(&Value::List(vec![kept.into()])));
        assert_eq!(r.get(&"backup".into()), Some(&Value::Ref(kept)));
        assert!(reference_removals(r.data().unwrap(), &targets).is_empty());
    }

    #[test]
    fn failed_apply_leaves_revision_unchanged() {
        let mut r = base();
        let add = FeatureDelta::Add { feature: "tags".into(), index: Some(2), value: "x".into() };
        assert_eq!(add.apply(r.data_mut().unwrap()), Err(DeltaOp::IndexOutOfBounds));
        assert_eq!(r, base());

        let mut d = RevisionDelta::for_revision(&r);
        d.add_feature_delta(FeatureDelta::set("name", "desk"));
        d.add_feature_delta(FeatureDelta::remove("tags", 0));
        assert_eq!(d.apply(&mut r), Err(DeltaOp::IndexOutOfBounds));
        assert_eq!(r, base());
    }
}
