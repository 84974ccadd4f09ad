/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Reading and writing feature values, revisions and revision deltas

use std::collections::BTreeMap;

use crate::delta::{FeatureDelta, RevisionDelta};
use crate::error::Result;
use crate::revision::{ClassRef, Feature, Revision, RevisionData, RevisionKind, Value};
use super::{DataInput, DataOutput};

const VALUE_BOOL: u8 = 0;
const VALUE_INT: u8 = 1;
const VALUE_TEXT: u8 = 2;
const VALUE_REF: u8 = 3;
const VALUE_LIST: u8 = 4;

const REV_NONE: u8 = 0;
const REV_NORMAL: u8 = 1;
const REV_POINTER: u8 = 2;
const REV_DETACHED: u8 = 3;

const FD_SET: u8 = 0;
const FD_UNSET: u8 = 1;
const FD_ADD: u8 = 2;
const FD_REMOVE: u8 = 3;
const FD_MOVE: u8 = 4;
const FD_CLEAR: u8 = 5;

impl<'a> DataInput<'a> {
    pub fn read_feature(&mut self) -> Result<Feature> {
        Ok(Feature::new(self.read_string()?))
    }

    pub fn read_value(&mut self) -> Result<Value> {
        Ok(match self.read_u8()? {
            VALUE_BOOL => Value::Bool(self.read_bool()?),
            VALUE_INT => Value::Int(self.read_i64()?),
            VALUE_TEXT => Value::Text(self.read_string()?),
            VALUE_REF => Value::Ref(self.read_id()?),
            VALUE_LIST => {
                let n = self.read_len()?;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(self.read_value()?);
                }
                Value::List(items)
            }
            _ => return self.err("unexpected contents (expected value tag)", 1),
        })
    }

    /// Read an optional revision
    pub fn read_revision(&mut self) -> Result<Option<Revision>> {
        let tag = self.read_u8()?;
        if tag == REV_NONE {
            return Ok(None);
        }
        if tag > REV_DETACHED {
            return self.err("unexpected contents (expected revision tag)", 1);
        }
        let id = self.read_id()?;
        let bv = self.read_branch_version()?;
        let created = self.read_i64()?;
        let revised = self.read_i64()?;
        let kind = match tag {
            REV_NORMAL => {
                let package = self.read_string()?;
                let name = self.read_string()?;
                let resource = self.read_bool()?;
                let n = self.read_len()?;
                let mut values = BTreeMap::new();
                for _ in 0..n {
                    let feature = self.read_feature()?;
                    let value = self.read_value()?;
                    values.insert(feature, value);
                }
                RevisionKind::Normal(RevisionData {
                    class: ClassRef { package, name },
                    resource,
                    values,
                })
            }
            REV_POINTER => {
                let target = if self.read_bool()? {
                    Some(self.read_branch_version()?)
                } else {
                    None
                };
                RevisionKind::Pointer { target }
            }
            _ => RevisionKind::Detached,
        };
        Ok(Some(Revision::from_parts(id, bv, created, revised, kind)))
    }

    pub fn read_feature_delta(&mut self) -> Result<FeatureDelta> {
        let tag = self.read_u8()?;
        let feature = self.read_feature()?;
        Ok(match tag {
            FD_SET => FeatureDelta::Set { feature, value: self.read_value()? },
            FD_UNSET => FeatureDelta::Unset { feature },
            FD_ADD => {
                let index = if self.read_bool()? { Some(self.read_len()?) } else { None };
                FeatureDelta::Add { feature, index, value: self.read_value()? }
            }
            FD_REMOVE => FeatureDelta::Remove { feature, index: self.read_len()? },
            FD_MOVE => {
                let from = self.read_len()?;
                let to = self.read_len()?;
                FeatureDelta::Move { feature, from, to }
            }
            FD_CLEAR => FeatureDelta::Clear { feature },
            _ => return self.err("unexpected contents (expected feature delta tag)", 1),
        })
    }

    pub fn read_revision_delta(&mut self) -> Result<RevisionDelta> {
        let id = self.read_id()?;
        let base = self.read_branch_version()?;
        let n = self.read_len()?;
        let mut deltas = Vec::with_capacity(n);
        for _ in 0..n {
            deltas.push(self.read_feature_delta()?);
        }
        Ok(RevisionDelta::from_parts(id, base, deltas))
    }
}

impl<'a> DataOutput<'a> {
    pub fn write_feature(&mut self, feature: &Feature) -> Result<()> {
        self.write_string(feature.name())
    }

    pub fn write_value(&mut self, value: &Value) -> Result<()> {
        match *value {
            Value::Bool(b) => {
                self.write_u8(VALUE_BOOL)?;
                self.write_bool(b)
            }
            Value::Int(n) => {
                self.write_u8(VALUE_INT)?;
                self.write_i64(n)
            }
            Value::Text(ref s) => {
                self.write_u8(VALUE_TEXT)?;
                self.write_string(s)
            }
            Value::Ref(id) => {
                self.write_u8(VALUE_REF)?;
                self.write_id(id)
            }
            Value::List(ref items) => {
                self.write_u8(VALUE_LIST)?;
                self.write_len(items.len())?;
                for item in items {
                    self.write_value(item)?;
                }
                Ok(())
            }
        }
    }

    /// Write an optional revision
    pub fn write_revision(&mut self, rev: Option<&Revision>) -> Result<()> {
        let rev = match rev {
            Some(rev) => rev,
            None => return self.write_u8(REV_NONE),
        };
        let tag = match *rev.kind() {
            RevisionKind::Normal(_) => REV_NORMAL,
            RevisionKind::Pointer { .. } => REV_POINTER,
            RevisionKind::Detached => REV_DETACHED,
        };
        self.write_u8(tag)?;
        self.write_id(rev.id())?;
        self.write_branch_version(rev.branch_version())?;
        self.write_i64(rev.created())?;
        self.write_i64(rev.revised())?;
        match *rev.kind() {
            RevisionKind::Normal(ref data) => {
                self.write_string(&data.class.package)?;
                self.write_string(&data.class.name)?;
                self.write_bool(data.resource)?;
                self.write_len(data.values.len())?;
                for (feature, value) in &data.values {
                    self.write_feature(feature)?;
                    self.write_value(value)?;
                }
            }
            RevisionKind::Pointer { target } => {
                self.write_bool(target.is_some())?;
                if let Some(bv) = target {
                    self.write_branch_version(bv)?;
                }
            }
            RevisionKind::Detached => {}
        }
        Ok(())
    }

    pub fn write_feature_delta(&mut self, delta: &FeatureDelta) -> Result<()> {
        match *delta {
            FeatureDelta::Set { ref feature, ref value } => {
                self.write_u8(FD_SET)?;
                self.write_feature(feature)?;
                self.write_value(value)
            }
            FeatureDelta::Unset { ref feature } => {
                self.write_u8(FD_UNSET)?;
                self.write_feature(feature)
            }
            FeatureDelta::Add { ref feature, index, ref value } => {
                self.write_u8(FD_ADD)?;
                self.write_feature(feature)?;
                self.write_bool(index.is_some())?;
                if let Some(i) = index {
                    self.write_len(i)?;
                }
                self.write_value(value)
            }
            FeatureDelta::Remove { ref feature, index } => {
                self.write_u8(FD_REMOVE)?;
                self.write_feature(feature)?;
                self.write_len(index)
            }
            FeatureDelta::Move { ref feature, from, to } => {
                self.write_u8(FD_MOVE)?;
                self.write_feature(feature)?;
                self.write_len(from)?;
                self.write_len(to)
            }
            FeatureDelta::Clear { ref feature } => {
                self.write_u8(FD_CLEAR)?;
                self.write_feature(feature)
            }
        }
    }

    pub fn write_revision_delta(&mut self, delta: &RevisionDelta) -> Result<()> {
        self.write_id(delta.id())?;
        self.write_branch_version(delta.base())?;
        self.write_len(delta.deltas().len())?;
        for fd in delta.deltas() {
            self.write_feature_delta(fd)?;
        }
        Ok(())
    }
}
