use std::any::Any;
use std::sync::Arc;

use crate::compress::decompress;
use crate::error::{Error, Result};
use crate::object::Object;
use crate::rbytes::{RBuffer, WBuffer};
use crate::riofs::File;
use crate::rtree::{BasketData, BasketHeader, BranchRecord, Leaf};
use crate::streamer::StreamerRegistry;

const TREE_VERSION: i16 = 20;

/// TreeRecord is the stored description of a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeRecord {
    pub name: String,
    pub title: String,
    pub entries: i64,
    pub tot_bytes: i64,
    pub zip_bytes: i64,
    pub branches: Vec<BranchRecord>,
}

impl TreeRecord {
    pub fn new(name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            entries: 0,
            tot_bytes: 0,
            zip_bytes: 0,
            branches: Vec::new(),
        }
    }

    /// walk visits every branch, depth first.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a BranchRecord)) {
        for b in &self.branches {
            b.walk(f);
        }
    }

    /// basket_ranges lists the `(seek, nbytes)` of every basket of the tree.
    pub fn basket_ranges(&self) -> Vec<(i64, i64)> {
        let mut ranges = Vec::new();
        self.walk(&mut |b| {
            for (seek, nbytes) in b.basket_seek.iter().zip(&b.basket_bytes) {
                ranges.push((*seek, *nbytes as i64));
            }
        });
        ranges
    }

    pub fn marshal(&self, w: &mut WBuffer) {
        let pos = w.write_version(TREE_VERSION);
        w.write_tnamed(&self.name, &self.title);
        w.write_i64(self.entries);
        w.write_i64(self.tot_bytes);
        w.write_i64(self.zip_bytes);
        w.write_i32(self.branches.len() as i32);
        for b in &self.branches {
            b.marshal(w);
        }
        w.set_byte_count(pos);
    }

    /// unmarshal decodes a tree and checks that every branch, sub-branches
    /// included, holds exactly the tree's entries.
    pub fn unmarshal(r: &mut RBuffer) -> Result<Self> {
        let hdr = r.read_version()?;
        let (name, title) = r.read_tnamed()?;
        let entries = r.read_i64()?;
        let tot_bytes = r.read_i64()?;
        let zip_bytes = r.read_i64()?;
        let n = r.read_i32()?;
        if n < 0 || entries < 0 {
            return Err(Error::corrupted(format!(
                "tree {:?}: invalid number of entries {} or branches {}",
                name, entries, n
            )));
        }
        let mut branches = Vec::with_capacity((n as usize).min(1024));
        for _ in 0..n {
            branches.push(BranchRecord::unmarshal(r)?);
        }
        r.check_byte_count(&hdr, "TTree")?;

        if let Some(b) = find_mismatch(&branches, entries) {
            return Err(Error::corrupted(format!(
                "tree {:?} has {} entries but branch {:?} has {}",
                name, entries, b.name, b.entries
            )));
        }

        Ok(Self {
            name,
            title,
            entries,
            tot_bytes,
            zip_bytes,
            branches,
        })
    }
}

fn find_mismatch(branches: &[BranchRecord], entries: i64) -> Option<&BranchRecord> {
    branches.iter().find_map(|b| {
        if b.entries != entries {
            Some(b)
        } else {
            find_mismatch(&b.branches, entries)
        }
    })
}

impl Object for TreeRecord {
    fn class(&self) -> &str {
        "TTree"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }

    fn marshal(&self, w: &mut WBuffer, _reg: &StreamerRegistry) -> Result<()> {
        TreeRecord::marshal(self, w);
        Ok(())
    }
}

/// Tree is a handle on a tree of an open file.
#[derive(Clone)]
pub struct Tree {
    file: File,
    record: Arc<TreeRecord>,
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("name", &self.record.name)
            .field("entries", &self.record.entries)
            .finish()
    }
}

impl Tree {
    pub(crate) fn new(file: File, record: TreeRecord) -> Self {
        Self {
            file,
            record: Arc::new(record),
        }
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn record(&self) -> &TreeRecord {
        &self.record
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn title(&self) -> &str {
        &self.record.title
    }

    pub fn entries(&self) -> i64 {
        self.record.entries
    }

    pub fn branches(&self) -> &[BranchRecord] {
        &self.record.branches
    }

    /// branch finds a branch by name, searching sub-branches too.
    pub fn branch(&self, name: &str) -> Option<&BranchRecord> {
        let mut found = None;
        self.record.walk(&mut |b| {
            if found.is_none() && b.name == name {
                found = Some(b);
            }
        });
        found
    }

    /// leaves lists the leaves of every branch, depth first.
    pub fn leaves(&self) -> Vec<&Leaf> {
        let mut leaves = Vec::new();
        self.record.walk(&mut |b| leaves.push(&b.leaf));
        leaves
    }

    /// leaf finds the branch owning the leaf named name.
    pub fn leaf(&self, name: &str) -> Option<&BranchRecord> {
        let mut found = None;
        self.record.walk(&mut |b| {
            if found.is_none() && b.leaf.name == name {
                found = Some(b);
            }
        });
        found
    }

    /// basket returns basket idx of branch, from the file's basket cache when
    /// possible.
    pub async fn basket(&self, branch: &BranchRecord, idx: usize) -> Result<Arc<BasketData>> {
        let seek = *branch.basket_seek.get(idx).ok_or_else(|| {
            Error::corrupted(format!("branch {:?} has no basket {}", branch.name, idx))
        })?;
        if let Some(basket) = self.file.baskets().get(seek) {
            return Ok(basket);
        }

        let (_, raw) = self.file.read_raw_key(seek).await?;
        let hdr = BasketHeader::unmarshal(&mut RBuffer::new(&raw))?;
        if hdr.key.nbytes != branch.basket_bytes[idx] {
            return Err(Error::corrupted(format!(
                "basket {} of branch {:?}: {} bytes on disk, {} recorded",
                idx, branch.name, hdr.key.nbytes, branch.basket_bytes[idx]
            )));
        }
        let payload = decompress(&raw[hdr.key.keylen as usize..], hdr.key.objlen as usize)?;
        let first = branch.basket_entry[idx];
        let basket = BasketData::decode(&hdr, &payload, first)?;
        let want = branch.basket_entry[idx + 1] - first;
        if basket.entries() as i64 != want {
            return Err(Error::corrupted(format!(
                "basket {} of branch {:?} holds {} entries, {} recorded",
                idx,
                branch.name,
                basket.entries(),
                want
            )));
        }

        tracing::trace!(
            "fetched basket {} of branch {:?} at {}: entries [{}, {})",
            idx,
            branch.name,
            seek,
            first,
            first + want
        );
        let basket = Arc::new(basket);
        self.file.baskets().put(seek, basket.clone());
        Ok(basket)
    }
}
