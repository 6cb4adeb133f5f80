use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;

use common_base::iterator::AsyncIterator;
use rootfile_utils::time::Datime;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::object::{downcast, Object};
use crate::rbytes::{RBuffer, WBuffer};
use crate::riofs::file::{DirId, File, NewKey};
use crate::riofs::header::{read_seek, read_uuid, write_uuid};
use crate::riofs::key::is_directory_class;
use crate::riofs::{Key, KeyHeader};
use crate::rtree::{Tree, TreeRecord};
use crate::streamer::StreamerRegistry;

const DIR_VERSION: i16 = 5;
const BIG_DIR_VERSION: i16 = 1000;

/// DirRecord is the fixed-size record describing a directory on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRecord {
    pub version: i16,
    pub ctime: Datime,
    pub mtime: Datime,
    pub nbytes_keys: i32,
    pub nbytes_name: i32,
    pub seek_dir: i64,
    pub seek_parent: i64,
    pub seek_keys: i64,
    pub uuid: Uuid,
}

impl DirRecord {
    /// LEN is the encoded length, padded so that the record can always be
    /// rewritten in place.
    pub const LEN: usize = 72;

    pub fn new(ctime: Datime) -> Self {
        Self {
            version: DIR_VERSION + BIG_DIR_VERSION,
            ctime,
            mtime: ctime,
            nbytes_keys: 0,
            nbytes_name: 0,
            seek_dir: 0,
            seek_parent: 0,
            seek_keys: 0,
            uuid: Uuid::new_v4(),
        }
    }

    pub fn marshal(&self, w: &mut WBuffer) {
        let start = w.pos();
        w.write_i16(DIR_VERSION + BIG_DIR_VERSION);
        w.write_u32(self.ctime.raw());
        w.write_u32(self.mtime.raw());
        w.write_i32(self.nbytes_keys);
        w.write_i32(self.nbytes_name);
        w.write_i64(self.seek_dir);
        w.write_i64(self.seek_parent);
        w.write_i64(self.seek_keys);
        write_uuid(w, &self.uuid);
        while w.pos() - start < Self::LEN {
            w.write_u8(0);
        }
    }

    pub fn unmarshal(r: &mut RBuffer) -> Result<Self> {
        let version = r.read_i16()?;
        let ctime = Datime::from_raw(r.read_u32()?);
        let mtime = Datime::from_raw(r.read_u32()?);
        let nbytes_keys = r.read_i32()?;
        let nbytes_name = r.read_i32()?;
        let big = version > BIG_DIR_VERSION;
        let seek_dir = read_seek(r, big)?;
        let seek_parent = read_seek(r, big)?;
        let seek_keys = read_seek(r, big)?;
        let uuid = if r.remaining() >= 18 {
            read_uuid(r)?
        } else {
            Uuid::nil()
        };

        Ok(Self {
            version,
            ctime,
            mtime,
            nbytes_keys,
            nbytes_name,
            seek_dir,
            seek_parent,
            seek_keys,
            uuid,
        })
    }
}

impl Object for DirRecord {
    fn class(&self) -> &str {
        "TDirectory"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }

    fn marshal(&self, w: &mut WBuffer, _reg: &StreamerRegistry) -> Result<()> {
        DirRecord::marshal(self, w);
        Ok(())
    }
}

/// Cycle selects among the keys sharing a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    Latest,
    At(i16),
    All,
}

impl Cycle {
    fn matches(&self, cycle: i16) -> bool {
        match self {
            Cycle::At(c) => *c == cycle,
            _ => true,
        }
    }
}

/// split_cycle splits `name;3` into its name and cycle.
fn split_cycle(name: &str) -> Result<(&str, Cycle)> {
    match name.rsplit_once(';') {
        Some((name, cycle)) => {
            let cycle = cycle
                .parse::<i16>()
                .map_err(|_| Error::InvalidArgument(format!("invalid cycle in key name {:?}", name)))?;
            Ok((name, Cycle::At(cycle)))
        }
        None => Ok((name, Cycle::Latest)),
    }
}

/// Directory is a handle on one namespace of an open file.
#[derive(Clone)]
pub struct Directory {
    file: File,
    id: DirId,
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory")
            .field("path", &self.path())
            .finish()
    }
}

impl Directory {
    pub(crate) fn new(file: File, id: DirId) -> Self {
        Self { file, id }
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn id(&self) -> DirId {
        self.id
    }

    pub fn name(&self) -> String {
        self.file.with_state(|st| st.dirs[self.id.0].key.name.clone())
    }

    pub fn title(&self) -> String {
        self.file.with_state(|st| st.dirs[self.id.0].key.title.clone())
    }

    pub fn record(&self) -> DirRecord {
        self.file.with_state(|st| st.dirs[self.id.0].record.clone())
    }

    /// path is the slash-separated location of the directory, `/` for the root.
    pub fn path(&self) -> String {
        self.file.with_state(|st| {
            let mut parts = Vec::new();
            let mut cur = self.id;
            while let Some(parent) = st.dirs[cur.0].parent {
                parts.push(st.dirs[cur.0].key.name.clone());
                cur = parent;
            }
            parts.reverse();
            format!("/{}", parts.join("/"))
        })
    }

    /// keys lists the keys of the directory in insertion order.
    pub fn keys(&self) -> Vec<Key> {
        let hdrs = self.file.with_state(|st| st.dirs[self.id.0].keys.clone());
        hdrs.into_iter()
            .map(|h| Key::new(self.file.clone(), h))
            .collect()
    }

    /// key returns the key named name, the one with the highest cycle for
    /// `Cycle::Latest`.
    pub fn key(&self, name: &str, cycle: Cycle) -> Result<Key> {
        let hdr = self.file.with_state(|st| {
            st.dirs[self.id.0]
                .keys
                .iter()
                .filter(|h| h.name == name && cycle.matches(h.cycle))
                .max_by_key(|h| h.cycle)
                .cloned()
        });
        match hdr {
            Some(hdr) => Ok(Key::new(self.file.clone(), hdr)),
            None => Err(Error::NotFound(format!(
                "no key named {:?} in directory {:?}",
                name,
                self.path()
            ))),
        }
    }

    /// get_key resolves a path such as `a/b/obj;2` relative to this directory.
    pub async fn get_key(&self, path: &str) -> Result<Key> {
        let path = path.trim_matches('/');
        let (parent, leaf) = match path.rsplit_once('/') {
            Some((parent, leaf)) => (self.get_dir(parent).await?, leaf),
            None => (self.clone(), path),
        };
        let (name, cycle) = split_cycle(leaf)?;
        parent.key(name, cycle)
    }

    /// get decodes the object stored at path.
    pub async fn get(&self, path: &str) -> Result<Box<dyn Object>> {
        self.get_key(path).await?.object().await
    }

    /// get_dir resolves a sub-directory path, loading each level once.
    pub async fn get_dir(&self, path: &str) -> Result<Directory> {
        let mut dir = self.clone();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let (name, cycle) = split_cycle(part)?;
            let key = dir.key(name, cycle)?;
            if !key.is_directory() {
                return Err(Error::ClassMismatch {
                    name: name.to_string(),
                    got: key.class().to_string(),
                    want: "TDirectory".to_string(),
                });
            }
            let id = self.file.load_dir(dir.id, key.header()).await?;
            dir = Directory::new(self.file.clone(), id);
        }
        Ok(dir)
    }

    /// get_tree opens the tree stored at path.
    pub async fn get_tree(&self, path: &str) -> Result<Tree> {
        let key = self.get_key(path).await?;
        if key.class() != "TTree" {
            return Err(Error::ClassMismatch {
                name: key.name().to_string(),
                got: key.class().to_string(),
                want: "TTree".to_string(),
            });
        }
        let record: TreeRecord = downcast(key.object().await?, key.name())?;
        Ok(Tree::new(self.file.clone(), record))
    }

    /// put stores obj under name with a new cycle.
    pub async fn put(&self, name: &str, obj: &dyn Object) -> Result<Key> {
        self.put_with_title(name, "", obj).await
    }

    pub async fn put_with_title(&self, name: &str, title: &str, obj: &dyn Object) -> Result<Key> {
        if name.is_empty() || name.contains('/') || name.contains(';') {
            return Err(Error::InvalidArgument(format!("invalid key name {:?}", name)));
        }
        let keylen = KeyHeader::header_len(obj.class(), name, title);
        let mut w = WBuffer::with_origin(keylen);
        obj.marshal(&mut w, self.file.registry())?;

        let hdr = self
            .file
            .write_key(
                self.id,
                NewKey {
                    class: obj.class(),
                    name,
                    title,
                    extra: &[],
                    payload: w.into_vec(),
                    compression: self.file.options().compression,
                    listed: true,
                },
            )
            .await?;
        Ok(Key::new(self.file.clone(), hdr))
    }

    /// mkdir creates a sub-directory, creating missing intermediate levels of
    /// a slash-separated path.
    pub async fn mkdir(&self, path: &str) -> Result<Directory> {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        let last = match parts.split_last() {
            Some((last, _)) => *last,
            None => return Err(Error::InvalidArgument(format!("invalid directory name {:?}", path))),
        };

        let mut dir = self.clone();
        for part in &parts[..parts.len() - 1] {
            dir = match dir.key(part, Cycle::Latest) {
                Ok(_) => dir.get_dir(part).await?,
                Err(Error::NotFound(_)) => {
                    let id = self.file.create_dir(dir.id, part, "").await?;
                    Directory::new(self.file.clone(), id)
                }
                Err(e) => return Err(e),
            };
        }
        let id = self.file.create_dir(dir.id, last, "").await?;
        tracing::debug!("created directory {}/{}", dir.path().trim_end_matches('/'), last);
        Ok(Directory::new(self.file.clone(), id))
    }

    /// delete removes the keys named name matching cycle and returns how many
    /// were removed. Their bytes, including the baskets of deleted trees and
    /// the contents of deleted directories, become free space.
    pub async fn delete(&self, name: &str, cycle: Cycle) -> Result<usize> {
        let victims: Vec<KeyHeader> = self.file.with_state(|st| {
            let keys = &st.dirs[self.id.0].keys;
            let latest = keys
                .iter()
                .filter(|h| h.name == name)
                .map(|h| h.cycle)
                .max();
            keys.iter()
                .filter(|h| h.name == name)
                .filter(|h| match cycle {
                    Cycle::Latest => Some(h.cycle) == latest,
                    Cycle::At(c) => h.cycle == c,
                    Cycle::All => true,
                })
                .cloned()
                .collect()
        });
        if victims.is_empty() {
            return Err(Error::NotFound(format!(
                "no key named {:?} in directory {:?}",
                name,
                self.path()
            )));
        }

        for hdr in &victims {
            if hdr.class == "TTree" {
                let key = Key::new(self.file.clone(), hdr.clone());
                let record: TreeRecord = downcast(key.object().await?, &hdr.name)?;
                self.file.release_ranges(&record.basket_ranges()).await?;
            } else if is_directory_class(&hdr.class) {
                let id = self.file.load_dir(self.id, hdr).await?;
                Directory::new(self.file.clone(), id).clear().await?;
                self.file.drop_dir(id).await?;
            }
        }
        self.file.remove_keys(self.id, &victims).await?;

        tracing::debug!("deleted {} key(s) {:?} from {}", victims.len(), name, self.path());
        Ok(victims.len())
    }

    /// clear deletes every key of the directory.
    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut names: Vec<String> = self.keys().into_iter().map(|k| k.name().to_string()).collect();
            names.dedup();
            for name in names {
                if self.key(&name, Cycle::Latest).is_ok() {
                    self.delete(&name, Cycle::All).await?;
                }
            }
            Ok(())
        })
    }

    /// walk iterates over every key below this directory, depth first.
    pub fn walk(&self) -> Walker {
        Walker {
            stack: vec![(self.clone(), self.keys().into())],
        }
    }
}

/// Walker yields `(path, key)` for every key below a directory.
pub struct Walker {
    stack: Vec<(Directory, VecDeque<Key>)>,
}

#[async_trait]
impl AsyncIterator for Walker {
    type Item = (String, Key);

    async fn try_next(&mut self) -> anyhow::Result<Option<Self::Item>> {
        loop {
            let (dir, keys) = match self.stack.last_mut() {
                Some(top) => top,
                None => return Ok(None),
            };
            let key = match keys.pop_front() {
                Some(key) => key,
                None => {
                    self.stack.pop();
                    continue;
                }
            };

            let path = format!("{}/{}", dir.path().trim_end_matches('/'), key.name());
            if key.is_directory() {
                let id = dir.file.load_dir(dir.id, key.header()).await?;
                let sub = Directory::new(dir.file.clone(), id);
                let keys = sub.keys().into();
                self.stack.push((sub, keys));
            }
            return Ok(Some((path, key)));
        }
    }
}

#[cfg(test)]
mod tests {
    use common_base::iterator::try_collect;

    use crate::error::Error;
    use crate::object::downcast;
    use crate::rbytes::{RBuffer, WBuffer};
    use crate::riofs::{Cycle, DirRecord, File};
    use crate::streamer::{BasicType, ElementKind, FieldDesc, Record, StreamerInfo, Value};

    fn point_info() -> StreamerInfo {
        StreamerInfo::new(
            "Point",
            1,
            vec![
                FieldDesc::new("x", ElementKind::Basic(BasicType::F64)),
                FieldDesc::new("y", ElementKind::Basic(BasicType::F64)),
            ],
        )
    }

    fn point(x: f64, y: f64) -> Record {
        Record::new("Point", 1)
            .with("x", Value::F64(x))
            .with("y", Value::F64(y))
    }

    #[test]
    fn test_dir_record_roundtrip() {
        let mut rec = DirRecord::new(rootfile_utils::time::Datime::now());
        rec.seek_keys = 1 << 40;
        rec.seek_dir = 100;
        let mut w = WBuffer::new();
        rec.marshal(&mut w);
        assert_eq!(w.pos(), DirRecord::LEN);
        let got = DirRecord::unmarshal(&mut RBuffer::new(w.as_slice())).unwrap();
        assert_eq!(got, rec);
    }

    #[tokio::test]
    async fn test_put_get_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.as_ref().join("points.root");

        let f = File::create(&path).await.unwrap();
        f.register_streamer(point_info()).unwrap();
        let root = f.root();
        root.put("p", &point(1.0, 2.0)).await.unwrap();
        root.put("p", &point(3.0, 4.0)).await.unwrap();
        let sub = root.mkdir("sub").await.unwrap();
        sub.put_with_title("q", "a point", &point(5.0, 6.0)).await.unwrap();
        f.close().await.unwrap();
        f.close().await.unwrap();

        let f = File::open(&path).await.unwrap();
        assert!(f.registry().contains_class("Point"));
        let latest: Record = downcast(f.get("p").await.unwrap(), "p").unwrap();
        assert_eq!(latest.get("x"), Some(&Value::F64(3.0)));
        let first: Record = downcast(f.get("p;1").await.unwrap(), "p").unwrap();
        assert_eq!(first.get("y"), Some(&Value::F64(2.0)));

        let q = f.root().get_key("sub/q").await.unwrap();
        assert_eq!(q.title(), "a point");
        assert_eq!(q.cycle(), 1);
        let sub = f.root().get_dir("sub").await.unwrap();
        assert_eq!(sub.path(), "/sub");

        match f.get("missing").await {
            Err(Error::NotFound(msg)) => assert!(msg.contains("missing")),
            other => panic!("unexpected result {:?}", other.map(|o| o.class().to_string())),
        }
        assert!(matches!(
            f.root().get_dir("p").await,
            Err(Error::ClassMismatch { .. })
        ));
        f.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_put_rejects_invalid_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.as_ref().join("invalid.root");

        let f = File::create(&path).await.unwrap();
        f.register_streamer(point_info()).unwrap();
        let root = f.root();
        let err = root
            .put_with_title("p", &"t".repeat(40000), &point(1.0, 2.0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{}", err);
        assert!(err.to_string().contains("too long"), "{}", err);
        for name in ["", "a/b", "a;2"] {
            assert!(matches!(
                root.put(name, &point(1.0, 2.0)).await,
                Err(Error::InvalidArgument(_))
            ));
        }
        assert!(matches!(root.mkdir("/").await, Err(Error::InvalidArgument(_))));
        assert!(root.keys().is_empty());

        root.put_with_title("p", &"t".repeat(300), &point(1.0, 2.0)).await.unwrap();
        f.close().await.unwrap();

        let f = File::open(&path).await.unwrap();
        let p = f.root().get_key("p").await.unwrap();
        assert_eq!(p.title().len(), 300);
        let p: Record = downcast(p.object().await.unwrap(), "p").unwrap();
        assert_eq!(p.get("x"), Some(&Value::F64(1.0)));
        f.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_reuses_space() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.as_ref().join("reuse.root");

        let f = File::create(&path).await.unwrap();
        f.register_streamer(point_info()).unwrap();
        let root = f.root();
        let a = root.put("a", &point(1.0, 1.0)).await.unwrap();
        root.put("b", &point(2.0, 2.0)).await.unwrap();

        assert_eq!(root.delete("a", Cycle::All).await.unwrap(), 1);
        assert!(root.key("a", Cycle::Latest).is_err());
        let c = root.put("c", &point(3.0, 3.0)).await.unwrap();
        assert_eq!(c.seek(), a.seek());
        f.close().await.unwrap();

        let f = File::update(&path).await.unwrap();
        let names: Vec<String> = f.root().keys().iter().map(|k| k.name().to_string()).collect();
        assert_eq!(names, vec!["b", "c"]);
        assert!(matches!(
            f.root().delete("a", Cycle::Latest).await,
            Err(Error::NotFound(_))
        ));
        f.root().delete("b", Cycle::Latest).await.unwrap();
        f.close().await.unwrap();

        let f = File::open(&path).await.unwrap();
        assert_eq!(f.root().keys().len(), 1);
        let c: Record = downcast(f.get("c").await.unwrap(), "c").unwrap();
        assert_eq!(c.get("x"), Some(&Value::F64(3.0)));
    }

    #[tokio::test]
    async fn test_walk_and_paging() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.as_ref().join("walk.root");

        let opts = crate::riofs::FileOptions {
            keys_per_page: 2,
            ..Default::default()
        };
        let f = File::create_with(&path, opts).await.unwrap();
        f.register_streamer(point_info()).unwrap();
        let root = f.root();
        for i in 0..5 {
            root.put(&format!("p{}", i), &point(i as f64, 0.0)).await.unwrap();
        }
        let deep = root.mkdir("a/b").await.unwrap();
        deep.put("z", &point(9.0, 9.0)).await.unwrap();
        assert_eq!(deep.path(), "/a/b");
        assert!(matches!(root.mkdir("a").await, Err(Error::AlreadyExists(_))));
        f.close().await.unwrap();

        let f = File::open(&path).await.unwrap();
        assert_eq!(f.root().keys().len(), 6);
        let paths: Vec<String> = try_collect(&mut f.root().walk())
            .await
            .unwrap()
            .into_iter()
            .map(|(p, _)| p)
            .collect();
        assert_eq!(
            paths,
            vec!["/p0", "/p1", "/p2", "/p3", "/p4", "/a", "/a/b", "/a/b/z"]
        );
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.as_ref().join("ro.root");
        File::create(&path).await.unwrap().close().await.unwrap();

        let f = File::open(&path).await.unwrap();
        f.register_streamer(point_info()).unwrap();
        assert!(matches!(
            f.root().put("p", &point(0.0, 0.0)).await,
            Err(Error::ReadOnly(_))
        ));
        f.close().await.unwrap();
        assert!(f.is_closed());
    }
}
