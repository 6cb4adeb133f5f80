use std::any::Any;

use crate::error::{Error, Result};
use crate::object::Object;
use crate::rbytes::{RBuffer, WBuffer};
use crate::rtree::Leaf;
use crate::streamer::StreamerRegistry;

const BRANCH_VERSION: i16 = 13;

/// BranchRecord is the stored description of one column: its leaf and the
/// location of every basket holding its entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRecord {
    pub name: String,
    pub title: String,
    /// compression settings of the baskets.
    pub compress: i32,
    pub basket_size: i32,
    /// non-zero when baskets carry per-entry offsets.
    pub entry_offset_len: i32,
    pub entries: i64,
    pub tot_bytes: i64,
    pub zip_bytes: i64,
    pub leaf: Leaf,
    pub branches: Vec<BranchRecord>,
    /// stored size of each basket key.
    pub basket_bytes: Vec<i32>,
    /// first entry of each basket, followed by the total number of entries.
    pub basket_entry: Vec<i64>,
    pub basket_seek: Vec<i64>,
}

impl BranchRecord {
    pub fn new(leaf: Leaf, compress: i32, basket_size: i32) -> Self {
        Self {
            name: leaf.name.clone(),
            title: leaf.title.clone(),
            compress,
            basket_size,
            entry_offset_len: if leaf.entry_size().is_some() { 0 } else { 1 },
            entries: 0,
            tot_bytes: 0,
            zip_bytes: 0,
            leaf,
            branches: Vec::new(),
            basket_bytes: Vec::new(),
            basket_entry: vec![0],
            basket_seek: Vec::new(),
        }
    }

    pub fn baskets(&self) -> usize {
        self.basket_seek.len()
    }

    /// find_basket returns the index of the basket holding entry.
    pub fn find_basket(&self, entry: i64) -> Option<usize> {
        if entry < 0 || entry >= self.entries {
            return None;
        }
        let n = self.baskets();
        let idx = self.basket_entry[..n].partition_point(|first| *first <= entry);
        idx.checked_sub(1)
    }

    /// add_basket records a basket written at seek.
    pub(crate) fn add_basket(&mut self, seek: i64, nbytes: i32, objlen: i32, keylen: i32, entries: i64) {
        self.basket_seek.push(seek);
        self.basket_bytes.push(nbytes);
        self.entries += entries;
        self.basket_entry.push(self.entries);
        self.tot_bytes += (objlen + keylen) as i64;
        self.zip_bytes += nbytes as i64;
    }

    /// walk visits the branch and its sub-branches, depth first.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a BranchRecord)) {
        f(self);
        for b in &self.branches {
            b.walk(f);
        }
    }

    pub(crate) fn marshal(&self, w: &mut WBuffer) {
        let pos = w.write_version(BRANCH_VERSION);
        w.write_tnamed(&self.name, &self.title);
        w.write_i32(self.compress);
        w.write_i32(self.basket_size);
        w.write_i32(self.entry_offset_len);
        w.write_i64(self.entries);
        w.write_i64(self.tot_bytes);
        w.write_i64(self.zip_bytes);
        self.leaf.marshal(w);

        w.write_i32(self.branches.len() as i32);
        for b in &self.branches {
            b.marshal(w);
        }

        w.write_i32(self.baskets() as i32);
        for n in &self.basket_bytes {
            w.write_i32(*n);
        }
        for e in &self.basket_entry {
            w.write_i64(*e);
        }
        for s in &self.basket_seek {
            w.write_i64(*s);
        }
        w.set_byte_count(pos);
    }

    /// unmarshal decodes a branch and checks that its baskets tile its entries.
    pub fn unmarshal(r: &mut RBuffer) -> Result<Self> {
        let hdr = r.read_version()?;
        let (name, title) = r.read_tnamed()?;
        let compress = r.read_i32()?;
        let basket_size = r.read_i32()?;
        let entry_offset_len = r.read_i32()?;
        let entries = r.read_i64()?;
        let tot_bytes = r.read_i64()?;
        let zip_bytes = r.read_i64()?;
        let leaf = Leaf::unmarshal(r)?;

        let nsub = read_len(r, &name, "sub-branches")?;
        let mut branches = Vec::with_capacity(nsub.min(1024));
        for _ in 0..nsub {
            branches.push(BranchRecord::unmarshal(r)?);
        }

        let n = read_len(r, &name, "baskets")?;
        let mut basket_bytes = Vec::with_capacity(n.min(r.remaining() / 4));
        for _ in 0..n {
            basket_bytes.push(r.read_i32()?);
        }
        let mut basket_entry = Vec::with_capacity(basket_bytes.len() + 1);
        for _ in 0..=n {
            basket_entry.push(r.read_i64()?);
        }
        let mut basket_seek = Vec::with_capacity(basket_bytes.len());
        for _ in 0..n {
            basket_seek.push(r.read_i64()?);
        }
        r.check_byte_count(&hdr, "TBranch")?;

        let tiled = basket_entry.first() == Some(&0)
            && basket_entry.windows(2).all(|w| w[0] <= w[1])
            && basket_entry.last() == Some(&entries);
        if !tiled {
            return Err(Error::corrupted(format!(
                "branch {:?}: baskets do not cover its {} entries",
                name, entries
            )));
        }

        Ok(Self {
            name,
            title,
            compress,
            basket_size,
            entry_offset_len,
            entries,
            tot_bytes,
            zip_bytes,
            leaf,
            branches,
            basket_bytes,
            basket_entry,
            basket_seek,
        })
    }
}

fn read_len(r: &mut RBuffer, name: &str, what: &str) -> Result<usize> {
    let n = r.read_i32()?;
    if n < 0 {
        return Err(Error::corrupted(format!(
            "branch {:?}: negative number of {}",
            name, what
        )));
    }
    Ok(n as usize)
}

impl Object for BranchRecord {
    fn class(&self) -> &str {
        "TBranch"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }

    fn marshal(&self, w: &mut WBuffer, _reg: &StreamerRegistry) -> Result<()> {
        BranchRecord::marshal(self, w);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::rbytes::{RBuffer, WBuffer};
    use crate::rtree::{BranchRecord, Leaf};
    use crate::streamer::{BasicType, ElementKind};

    fn branch() -> BranchRecord {
        let mut b = BranchRecord::new(Leaf::new("one", ElementKind::Basic(BasicType::I32)), 101, 32000);
        b.add_basket(1000, 80, 40, 60, 10);
        b.add_basket(2000, 80, 40, 60, 10);
        b.add_basket(3000, 50, 20, 60, 5);
        b
    }

    #[test]
    fn test_find_basket() {
        let b = branch();
        assert_eq!(b.entries, 25);
        assert_eq!(b.basket_entry, vec![0, 10, 20, 25]);
        assert_eq!(b.find_basket(0), Some(0));
        assert_eq!(b.find_basket(9), Some(0));
        assert_eq!(b.find_basket(10), Some(1));
        assert_eq!(b.find_basket(24), Some(2));
        assert_eq!(b.find_basket(25), None);
        assert_eq!(b.find_basket(-1), None);
        assert_eq!(b.zip_bytes, 210);
    }

    #[test]
    fn test_marshal() {
        let mut b = branch();
        b.branches
            .push(BranchRecord::new(Leaf::new("sub", ElementKind::String), 0, 1024));
        let mut w = WBuffer::new();
        b.marshal(&mut w);
        let got = BranchRecord::unmarshal(&mut RBuffer::new(w.as_slice())).unwrap();
        assert_eq!(got, b);
        assert_eq!(got.branches[0].entry_offset_len, 1);

        let mut names = Vec::new();
        got.walk(&mut |b| names.push(b.name.clone()));
        assert_eq!(names, vec!["one", "sub"]);
    }

    #[test]
    fn test_untiled_baskets_rejected() {
        let mut b = branch();
        b.entries = 30;
        let mut w = WBuffer::new();
        b.marshal(&mut w);
        assert!(BranchRecord::unmarshal(&mut RBuffer::new(w.as_slice())).is_err());
    }
}
