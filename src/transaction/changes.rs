/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Exporting and importing uncommitted changes

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use crate::conflict::Snapshot;
use crate::error::{Error, Result};
use crate::id::{IdMapper, ObjectId};
use crate::object::CdoObject;
use crate::readwrite::{read_change_blocks, write_change_blocks, ChangeBlock};
use crate::revision::Revision;
use crate::state_machine::ObjectEvent;
use crate::view::ViewEvent;
use super::{Transaction, TxState};

impl Transaction {
    /// Write the uncommitted changes, one block per savepoint: revisions of
    /// new objects and deltas of modified objects. Detachments are not
    /// exported.
    pub fn export_changes(&self, w: &mut dyn Write) -> Result<()> {
        let blocks = {
            let state = self.inner().lock_state();
            let detached = state.savepoints.all_detached_objects(true);
            let n = state.savepoints.len();
            let mut blocks = Vec::with_capacity(n);
            for (i, sp) in state.savepoints.iter().enumerate() {
                let mut block = ChangeBlock::default();
                for (id, obj) in sp.new_entries() {
                    if detached.contains_key(id) {
                        continue;
                    }
                    // later changes are exported as deltas of later blocks
                    let base = if i + 1 < n { sp.base_new_revisions.get(id).cloned() } else { None };
                    if let Some(rev) = base.or_else(|| obj.revision()) {
                        block.revisions.push(rev);
                    }
                }
                block.deltas.extend(sp.revision_deltas.iter()
                    .filter(|&(id, _)| !detached.contains_key(id))
                    .map(|(_, d)| d.clone()));
                blocks.push(block);
            }
            blocks
        };
        debug!("Transaction {}: exporting {} change blocks", self.id(), blocks.len());
        write_change_blocks(w, &blocks)
    }

    /// Read changes written by `export_changes` and apply them to this
    /// transaction. New objects get fresh temporary identifiers; the
    /// returned mapper translates the exported ones. With
    /// `reconstruct_savepoints`, each block after the first starts a new
    /// savepoint. If any change cannot be applied the transaction is left
    /// as it was.
    pub fn import_changes(&self, r: &mut dyn Read, reconstruct_savepoints: bool) -> Result<IdMapper> {
        let blocks = read_change_blocks(r)?;
        let inner = self.inner();
        let (mapper, events) = {
            let mut state = inner.lock_state();
            if state.closed {
                return Err(Error::illegal("transaction is closed"));
            }
            let mut mapper = IdMapper::new();
            let mut imported = BTreeSet::new();
            for rev in blocks.iter().flat_map(|b| b.revisions.iter()) {
                if !rev.id().is_temporary() {
                    return Err(Error::illegal(format!("imported new object {} has no temporary id", rev.id())));
                }
                let id = state.temp_ids.next_id();
                mapper.insert(rev.id(), id);
                imported.insert(id);
            }

            // objects which exist already and are changed by the import
            let mut targets = BTreeMap::new();
            for delta in blocks.iter().flat_map(|b| b.deltas.iter()) {
                let id = mapper.adjust(delta.id());
                if imported.contains(&id) || targets.contains_key(&id) {
                    continue;
                }
                let object = if id.is_temporary() {
                    inner.core.lookup(id)
                        .ok_or_else(|| Error::illegal(format!("imported delta for unknown object {}", id)))?
                } else {
                    inner.core.get_object(id)?
                };
                targets.insert(id, object);
            }

            let objects: Vec<CdoObject> = targets.values().cloned().collect();
            let snapshot = Snapshot::take(&state, &objects);
            let mut events = vec![];
            let result = self.apply_change_blocks(&mut state, &blocks, &mapper, &targets,
                    reconstruct_savepoints, &mut events);
            if let Err(e) = result {
                warn!("Transaction {}: import failed, reverting: {}", self.id(), e);
                snapshot.restore(inner, &mut state);
                for id in &imported {
                    if let Some(object) = inner.core.lookup(*id) {
                        inner.remove_object(&object);
                    }
                }
                return Err(e);
            }
            (mapper, events)
        };
        info!("Transaction {}: imported {} change blocks", self.id(), blocks.len());
        inner.core.fire(events);
        Ok(mapper)
    }

    fn apply_change_blocks(&self, state: &mut TxState, blocks: &[ChangeBlock], mapper: &IdMapper,
            targets: &BTreeMap<ObjectId, CdoObject>, reconstruct_savepoints: bool,
            events: &mut Vec<ViewEvent>) -> Result<()>
    {
        let inner = self.inner();
        for (i, block) in blocks.iter().enumerate() {
            if reconstruct_savepoints && i > 0 {
                inner.push_savepoint(state);
            }
            for rev in &block.revisions {
                let mut rev = rev.clone();
                rev.set_id(mapper.adjust(rev.id()));
                rev.adjust_references(mapper);
                self.import_new_object(state, rev)?;
            }
            for delta in &block.deltas {
                let mut delta = delta.clone();
                delta.adjust_references(mapper);
                let id = delta.id();
                let object = match targets.get(&id) {
                    Some(object) => object.clone(),
                    None => inner.core.lookup(id)
                        .ok_or_else(|| Error::illegal(format!("imported delta for unknown object {}", id)))?,
                };
                let stale = !id.is_temporary()
                    && object.revision().map_or(false, |rev| rev.branch_version() != delta.base());
                for fd in delta.deltas() {
                    events.extend(inner.register_feature_delta(state, &object, fd)?);
                }
                if stale {
                    warn!("Transaction {}: imported delta {} is based on an old version", self.id(), delta);
                    events.extend(inner.mark_conflict(state, &object));
                }
            }
            if !block.revisions.is_empty() {
                events.extend(state.set_dirty());
            }
        }
        Ok(())
    }

    fn import_new_object(&self, state: &mut TxState, rev: Revision) -> Result<()> {
        let inner = self.inner();
        let id = rev.id();
        let class = rev.class().cloned()
            .ok_or_else(|| Error::illegal(format!("imported new object {} has no data", id)))?;
        let resource = rev.data()?.resource;
        let object = if resource { CdoObject::new_resource(class) } else { CdoObject::new(class) };
        {
            let mut data = object.lock();
            inner.core.session.state_machine.apply(&mut data, ObjectEvent::Attach)?;
            data.id = id;
            data.revision = Some(rev);
            data.view = Some(inner.core.id);
        }
        let last = state.savepoints.last_mut();
        if resource {
            last.new_resources.insert(id, object.clone());
        } else {
            last.new_objects.insert(id, object.clone());
        }
        inner.core.register(id, &object);
        trace!("Transaction {}: imported new object {}", self.id(), id);
        Ok(())
    }
}
