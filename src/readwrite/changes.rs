/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The exported-changes stream
//!
//! A stream is a sequence of blocks, one per savepoint with content:
//!
//! ```text
//! true, revision count: i32, revisions, delta count: i32, deltas
//! ```
//!
//! terminated by a single `false`.

use std::io::{Read, Write};

use crate::delta::RevisionDelta;
use crate::error::Result;
use crate::revision::Revision;
use super::{DataInput, DataOutput};

/// The changes recorded in one savepoint
#[derive(Clone, PartialEq, Debug, Default)]
pub struct ChangeBlock {
    /// Revisions of objects created in the savepoint
    pub revisions: Vec<Revision>,
    /// Deltas recorded in the savepoint
    pub deltas: Vec<RevisionDelta>,
}

impl ChangeBlock {
    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty() && self.deltas.is_empty()
    }
}

/// Write blocks. Empty blocks are skipped.
pub fn write_change_blocks(w: &mut dyn Write, blocks: &[ChangeBlock]) -> Result<()> {
    let mut out = DataOutput::new(w);
    for block in blocks.iter().filter(|b| !b.is_empty()) {
        trace!("Writing change block: {} revisions, {} deltas",
                block.revisions.len(), block.deltas.len());
        out.write_bool(true)?;
        out.write_i32(block.revisions.len() as i32)?;
        for rev in &block.revisions {
            out.write_revision(Some(rev))?;
        }
        out.write_i32(block.deltas.len() as i32)?;
        for delta in &block.deltas {
            out.write_revision_delta(delta)?;
        }
    }
    out.write_bool(false)
}

/// Read all blocks up to the terminating `false`
pub fn read_change_blocks(r: &mut dyn Read) -> Result<Vec<ChangeBlock>> {
    let mut input = DataInput::new(r);
    let mut blocks = vec![];
    while input.read_bool()? {
        let n = read_count(&mut input)?;
        let mut revisions = Vec::with_capacity(n);
        for _ in 0..n {
            match input.read_revision()? {
                Some(rev) => revisions.push(rev),
                None => return input.err("unexpected contents (expected revision)", 1),
            }
        }
        let n = read_count(&mut input)?;
        let mut deltas = Vec::with_capacity(n);
        for _ in 0..n {
            deltas.push(input.read_revision_delta()?);
        }
        blocks.push(ChangeBlock { revisions, deltas });
    }
    Ok(blocks)
}

fn read_count(input: &mut DataInput) -> Result<usize> {
    let n = input.read_i32()?;
    if n < 0 {
        return input.err("negative count", 4);
    }
    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::BranchId;
    use crate::delta::FeatureDelta;
    use crate::error::Error;
    use crate::id::ObjectId;
    use crate::revision::ClassRef;

    #[test]
    fn empty_blocks_are_skipped() {
        let rev = Revision::new(ObjectId::Temp(1), BranchId::MAIN.version(0), 0, ClassRef::new("p", "C"));
        let mut delta = RevisionDelta::new(ObjectId::Persistent(3), BranchId::MAIN.version(1));
        delta.add_feature_delta(FeatureDelta::set("a", 1i64));
        let blocks = vec![
            ChangeBlock { revisions: vec![rev], deltas: vec![] },
            ChangeBlock::default(),
            ChangeBlock { revisions: vec![], deltas: vec![delta] },
        ];

        let mut buf = Vec::new();
        write_change_blocks(&mut buf, &blocks).unwrap();
        let read = read_change_blocks(&mut &buf[..]).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0], blocks[0]);
        assert_eq!(read[1], blocks[2]);
    }

    #[test]
    fn truncated_stream() {
        let mut buf = Vec::new();
        write_change_blocks(&mut buf, &[]).unwrap();
        assert_eq!(buf, vec![0u8]);
        let truncated = [1u8, 0, 0];
        match read_change_blocks(&mut &truncated[..]) {
            Err(Error::Read(_)) => {}
            r => panic!("unexpected: {:?}", r),
        }
    }
}
