use std::collections::HashMap;
use std::fmt::Display;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rootfile_storage::file::WritableFile;
use rootfile_storage::mmap::MmapReadableFile;
use rootfile_storage::{RandomAccessFile, RandomAccessFileExt, Writable};
use rootfile_utils::time::Datime;
use serde::{Deserialize, Serialize};

use crate::compress::{compress, decompress, Compression};
use crate::error::{Error, Result};
use crate::object::{downcast, Factory, List, Object};
use crate::rbytes::{RBuffer, WBuffer};
use crate::riofs::directory::{DirRecord, Directory};
use crate::riofs::free::{FreeList, SEGMENT_LEN, UNBOUNDED};
use crate::riofs::header::{FileHeader, BEGIN};
use crate::riofs::KeyHeader;
use crate::rtree::{BasketCache, Tree};
use crate::streamer::{StreamerInfo, StreamerRegistry};

const STREAMER_INFO_CLASS: &str = "TList";
const STREAMER_INFO_NAME: &str = "StreamerInfo";
const STREAMER_INFO_TITLE: &str = "Doubly linked list";

/// Length of the trailer of a key-list page pointing at the next page.
const PAGE_TRAILER_LEN: usize = 8 + 4;

/// FileOptions configures how a file is opened or created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileOptions {
    /// codec used for keys written through the file.
    pub compression: Compression,
    /// byte budget of the decoded basket cache.
    pub basket_cache_bytes: usize,
    /// number of key headers stored per directory key-list page.
    pub keys_per_page: usize,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            compression: Compression::default(),
            basket_cache_bytes: 64 * 1024 * 1024,
            keys_per_page: 10_000,
        }
    }
}

/// DirId indexes the directory arena of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirId(pub(crate) usize);

impl DirId {
    pub const ROOT: DirId = DirId(0);
}

pub(crate) struct DirState {
    pub(crate) key: KeyHeader,
    pub(crate) record: DirRecord,
    pub(crate) parent: Option<DirId>,
    pub(crate) keys: Vec<KeyHeader>,
    /// key-list pages currently on disk, as (seek, nbytes).
    pub(crate) pages: Vec<(i64, i32)>,
    pub(crate) children: HashMap<String, DirId>,
    pub(crate) dirty: bool,
    pub(crate) deleted: bool,
}

impl DirState {
    fn class(&self) -> &'static str {
        if self.parent.is_none() {
            "TFile"
        } else {
            "TDirectory"
        }
    }

    /// key_bytes encodes the key holding the directory record.
    fn key_bytes(&self) -> Vec<u8> {
        let mut w = WBuffer::new();
        self.key.marshal(&mut w);
        if self.parent.is_none() {
            w.write_string(&self.key.name);
            w.write_string(&self.key.title);
        }
        self.record.marshal(&mut w);
        w.into_vec()
    }
}

pub(crate) struct FileState {
    pub(crate) header: FileHeader,
    pub(crate) free: FreeList,
    pub(crate) dirs: Vec<DirState>,
    streamers_dirty: bool,
    info_key: Option<(i64, i32)>,
    free_key: Option<(i64, i32)>,
}

type Writes = Vec<(i64, Vec<u8>)>;

/// allocate reserves nbytes in the file, queueing the gap marker of a split gap.
fn allocate(free: &mut FreeList, header: &mut FileHeader, nbytes: i64, writes: &mut Writes) -> i64 {
    let (seek, leftover) = free.allocate(nbytes);
    if let Some(gap) = leftover {
        writes.push((gap.first, gap_marker(gap.len())));
    }
    header.end = free.end();
    tracing::trace!("allocated {} bytes at {}", nbytes, seek);
    seek
}

/// next_cycle is the cycle of a new key named name.
fn next_cycle(keys: &[KeyHeader], name: &str) -> Result<i16> {
    keys.iter()
        .filter(|h| h.name == name)
        .map(|h| h.cycle)
        .max()
        .unwrap_or(0)
        .checked_add(1)
        .ok_or_else(|| Error::InvalidArgument(format!("key {:?} has no cycle left after {}", name, i16::MAX)))
}

/// release returns a byte range to the free list and marks it as a gap.
fn release(free: &mut FreeList, header: &mut FileHeader, seek: i64, nbytes: i64, writes: &mut Writes) {
    if nbytes <= 0 {
        return;
    }
    let seg = free.free(seek, seek + nbytes - 1);
    if seg.last != UNBOUNDED {
        writes.push((seg.first, gap_marker(seg.len())));
    }
    header.end = free.end();
    tracing::trace!("released {} bytes at {}", nbytes, seek);
}

fn gap_marker(len: i64) -> Vec<u8> {
    (-(len.min(i32::MAX as i64) as i32)).to_be_bytes().to_vec()
}

/// NewKey describes a key to be written.
pub(crate) struct NewKey<'a> {
    pub class: &'a str,
    pub name: &'a str,
    pub title: &'a str,
    /// bytes following the key header and counted in keylen.
    pub extra: &'a [u8],
    pub payload: Vec<u8>,
    pub compression: Compression,
    /// whether the key is listed in its directory.
    pub listed: bool,
}

struct FileInner {
    path: PathBuf,
    reader: Arc<dyn RandomAccessFile>,
    writer: Option<Arc<WritableFile>>,
    options: FileOptions,
    registry: StreamerRegistry,
    factory: Factory,
    baskets: BasketCache,
    state: Mutex<FileState>,
    closed: AtomicBool,
}

/// File is an open container. Handles are cheap to clone and share one state.
///
/// Files opened with `create` or `update` must be closed for the directory
/// indexes, streamer record and free list to be persisted.
#[derive(Clone)]
pub struct File {
    inner: Arc<FileInner>,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("path", &self.inner.path)
            .field("writable", &self.is_writable())
            .finish()
    }
}

fn truncated(e: io::Error, what: impl Display) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::corrupted(format!("{}: {}", what, e))
    } else {
        Error::Io(e)
    }
}

impl File {
    /// open opens an existing file read-only.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, FileOptions::default()).await
    }

    pub async fn open_with(path: impl AsRef<Path>, options: FileOptions) -> Result<Self> {
        let reader = Arc::new(MmapReadableFile::open(path.as_ref()).await?);
        Self::load(path.as_ref(), reader, None, options).await
    }

    /// update opens an existing file for reading and writing.
    pub async fn update(path: impl AsRef<Path>) -> Result<Self> {
        Self::update_with(path, FileOptions::default()).await
    }

    pub async fn update_with(path: impl AsRef<Path>, options: FileOptions) -> Result<Self> {
        let writer = Arc::new(WritableFile::open(path.as_ref()).await?);
        let reader: Arc<dyn RandomAccessFile> = writer.clone();
        Self::load(path.as_ref(), reader, Some(writer), options).await
    }

    /// create creates a new file, failing if one exists at path.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::create_with(path, FileOptions::default()).await
    }

    pub async fn create_with(path: impl AsRef<Path>, options: FileOptions) -> Result<Self> {
        let path = path.as_ref();
        let writer = Arc::new(WritableFile::create(path).await?);
        let reader: Arc<dyn RandomAccessFile> = writer.clone();

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut header = FileHeader::new(options.compression.settings());
        let mut free = FreeList::new(BEGIN as i64);

        let mut key = KeyHeader::new("TFile", &name, "")?;
        let names_len = {
            let mut w = WBuffer::new();
            w.write_string(&name);
            w.write_string("");
            w.pos()
        };
        key.objlen = (names_len + DirRecord::LEN) as i32;
        key.nbytes = key.keylen as i32 + key.objlen;
        let mut writes = Vec::new();
        key.seek_key = allocate(&mut free, &mut header, key.nbytes as i64, &mut writes);

        let mut record = DirRecord::new(key.datime);
        record.seek_dir = key.seek_key;
        record.nbytes_name = key.keylen as i32 + names_len as i32;
        header.nbytes_name = record.nbytes_name;

        let root = DirState {
            key,
            record,
            parent: None,
            keys: Vec::new(),
            pages: Vec::new(),
            children: HashMap::new(),
            dirty: true,
            deleted: false,
        };
        let file = Self::from_parts(path, reader, Some(writer), options, header, free, root);
        file.flush().await?;

        tracing::debug!("created file {:?}", path);
        Ok(file)
    }

    fn from_parts(
        path: &Path,
        reader: Arc<dyn RandomAccessFile>,
        writer: Option<Arc<WritableFile>>,
        options: FileOptions,
        header: FileHeader,
        free: FreeList,
        root: DirState,
    ) -> Self {
        let info_key = (header.seek_info > 0).then_some((header.seek_info, header.nbytes_info));
        let free_key = (header.seek_free > 0).then_some((header.seek_free, header.nbytes_free));
        Self {
            inner: Arc::new(FileInner {
                path: path.to_path_buf(),
                reader,
                writer,
                baskets: BasketCache::new(options.basket_cache_bytes),
                options,
                registry: StreamerRegistry::new(),
                factory: Factory::new(),
                state: Mutex::new(FileState {
                    header,
                    free,
                    dirs: vec![root],
                    streamers_dirty: false,
                    info_key,
                    free_key,
                }),
                closed: AtomicBool::new(false),
            }),
        }
    }

    async fn load(
        path: &Path,
        reader: Arc<dyn RandomAccessFile>,
        writer: Option<Arc<WritableFile>>,
        options: FileOptions,
    ) -> Result<Self> {
        let size = reader.size().await?;
        let data = reader
            .read_exact_at(0, size.min(BEGIN as u64) as usize)
            .await
            .map_err(|e| truncated(e, "file header"))?;
        let header = FileHeader::unmarshal(&data)?;

        let (key, raw) = read_key(reader.as_ref(), header.begin as i64).await?;
        let payload = payload_of(&key, &raw)?;
        let mut r = RBuffer::with_origin(&payload, key.keylen as usize);
        let _name = r.read_string()?;
        let _title = r.read_string()?;
        let record = DirRecord::unmarshal(&mut r)?;

        let (keys, pages) = read_key_pages(reader.as_ref(), record.seek_keys).await?;

        let free = if writer.is_some() && header.seek_free > 0 {
            let (fkey, raw) = read_key(reader.as_ref(), header.seek_free).await?;
            let payload = payload_of(&fkey, &raw)?;
            FreeList::unmarshal(&mut RBuffer::new(&payload), header.nfree.max(0) as usize)?
        } else {
            FreeList::new(header.end)
        };

        let root = DirState {
            key,
            record,
            parent: None,
            keys,
            pages,
            children: HashMap::new(),
            dirty: false,
            deleted: false,
        };
        let seek_info = header.seek_info;
        let file = Self::from_parts(path, reader, writer, options, header, free, root);
        if seek_info > 0 {
            file.load_streamers(seek_info).await?;
        }

        tracing::debug!(
            "opened file {:?} ({} keys, {} streamers, writable={})",
            path,
            file.root().keys().len(),
            file.inner.registry.len(),
            file.is_writable()
        );
        Ok(file)
    }

    async fn load_streamers(&self, seek: i64) -> Result<()> {
        let (key, raw) = read_key(self.inner.reader.as_ref(), seek).await?;
        let payload = payload_of(&key, &raw)?;
        let obj = self.decode_object(&key, &payload)?;
        let list: List = downcast(obj, &key.name)?;
        for obj in list.objects {
            if obj.class() != "TStreamerInfo" {
                continue;
            }
            let info: StreamerInfo = downcast(obj, STREAMER_INFO_NAME)?;
            self.inner.registry.register(info)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn is_writable(&self) -> bool {
        self.inner.writer.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn options(&self) -> &FileOptions {
        &self.inner.options
    }

    pub fn registry(&self) -> &StreamerRegistry {
        &self.inner.registry
    }

    pub fn factory(&self) -> &Factory {
        &self.inner.factory
    }

    pub fn header(&self) -> FileHeader {
        self.inner.state.lock().header.clone()
    }

    pub(crate) fn baskets(&self) -> &BasketCache {
        &self.inner.baskets
    }

    pub fn root(&self) -> Directory {
        Directory::new(self.clone(), DirId::ROOT)
    }

    /// get decodes the object at a path such as `dir/obj;2`.
    pub async fn get(&self, path: &str) -> Result<Box<dyn Object>> {
        self.root().get(path).await
    }

    pub async fn get_tree(&self, path: &str) -> Result<Tree> {
        self.root().get_tree(path).await
    }

    /// register_streamer adds the layout of a class written through this file.
    pub fn register_streamer(&self, info: StreamerInfo) -> Result<Arc<StreamerInfo>> {
        let before = self.inner.registry.len();
        let info = self.inner.registry.register(info)?;
        if self.inner.registry.len() != before {
            self.inner.state.lock().streamers_dirty = true;
        }
        Ok(info)
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed("file"));
        }
        Ok(())
    }

    fn writer(&self) -> Result<Arc<WritableFile>> {
        self.check_open()?;
        self.inner
            .writer
            .clone()
            .ok_or_else(|| Error::ReadOnly(self.inner.path.display().to_string()))
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut FileState) -> R) -> R {
        f(&mut self.inner.state.lock())
    }

    /// read_payload reads the key at hdr's offset, checks it against hdr and
    /// returns its decompressed payload.
    pub(crate) async fn read_payload(&self, hdr: &KeyHeader) -> Result<Vec<u8>> {
        self.check_open()?;
        let (disk, raw) = read_key(self.inner.reader.as_ref(), hdr.seek_key).await?;
        if disk.nbytes != hdr.nbytes || disk.objlen != hdr.objlen || disk.keylen != hdr.keylen {
            return Err(Error::corrupted(format!(
                "key {:?} at {}: stored sizes ({}, {}) disagree with its index entry ({}, {})",
                hdr.name, hdr.seek_key, disk.nbytes, disk.objlen, hdr.nbytes, hdr.objlen
            )));
        }
        payload_of(&disk, &raw)
    }

    /// read_raw_key reads the whole key stored at seek.
    pub(crate) async fn read_raw_key(&self, seek: i64) -> Result<(KeyHeader, Vec<u8>)> {
        self.check_open()?;
        read_key(self.inner.reader.as_ref(), seek).await
    }

    pub(crate) fn decode_object(&self, hdr: &KeyHeader, payload: &[u8]) -> Result<Box<dyn Object>> {
        let mut r = RBuffer::with_origin(payload, hdr.keylen as usize);
        self.inner
            .factory
            .decode(&hdr.class, &mut r, &self.inner.registry)
    }

    /// write_key compresses and stores a key, listing it in dir when asked.
    pub(crate) async fn write_key(&self, dir: DirId, k: NewKey<'_>) -> Result<KeyHeader> {
        let writer = self.writer()?;
        let mut hdr = KeyHeader::new(k.class, k.name, k.title)?;
        hdr.keylen = i16::try_from(hdr.keylen as usize + k.extra.len()).map_err(|_| {
            Error::InvalidArgument(format!("key header of {:?} too long", k.name))
        })?;
        hdr.objlen = i32::try_from(k.payload.len()).map_err(|_| {
            Error::InvalidArgument(format!("payload of key {:?} too large: {} bytes", k.name, k.payload.len()))
        })?;

        let data = compress(&k.payload, k.compression)?;
        hdr.nbytes = i32::try_from(hdr.keylen as usize + data.len()).map_err(|_| {
            Error::InvalidArgument(format!("key {:?} too large: {} bytes", k.name, data.len()))
        })?;

        let mut writes = Vec::new();
        {
            let mut st = self.inner.state.lock();
            let FileState {
                header, free, dirs, ..
            } = &mut *st;
            let d = dirs
                .get_mut(dir.0)
                .filter(|d| !d.deleted)
                .ok_or_else(|| Error::NotFound(format!("directory {:?} was deleted", k.name)))?;
            hdr.seek_pdir = d.key.seek_key;
            if k.listed {
                hdr.cycle = next_cycle(&d.keys, k.name)?;
            }
            hdr.seek_key = allocate(free, header, hdr.nbytes as i64, &mut writes);
            if k.listed {
                d.keys.push(hdr.clone());
                d.dirty = true;
            }
        }

        let mut w = WBuffer::new();
        hdr.marshal(&mut w);
        w.write_bytes(k.extra);
        w.write_bytes(&data);
        writes.push((hdr.seek_key, w.into_vec()));
        if let Err(e) = apply(&writer, writes).await {
            self.unlist_key(dir, &hdr, k.listed);
            return Err(e);
        }

        tracing::debug!(
            "wrote key {};{} ({}) at {}: {} bytes, {} uncompressed",
            hdr.name,
            hdr.cycle,
            hdr.class,
            hdr.seek_key,
            hdr.nbytes,
            hdr.objlen
        );
        Ok(hdr)
    }

    /// unlist_key forgets a key whose bytes could not be written.
    fn unlist_key(&self, dir: DirId, hdr: &KeyHeader, listed: bool) {
        let mut st = self.inner.state.lock();
        let FileState {
            header, free, dirs, ..
        } = &mut *st;
        if listed {
            if let Some(d) = dirs.get_mut(dir.0) {
                d.keys.retain(|h| h.seek_key != hdr.seek_key);
            }
        }
        // gap marker writes are dropped.
        release(free, header, hdr.seek_key, hdr.nbytes as i64, &mut Vec::new());
        tracing::warn!("could not write key {};{} at {}", hdr.name, hdr.cycle, hdr.seek_key);
    }

    /// remove_keys unlists the keys of dir named name and frees their bytes.
    pub(crate) async fn remove_keys(&self, dir: DirId, removed: &[KeyHeader]) -> Result<()> {
        let writer = self.writer()?;
        let mut writes = Vec::new();
        {
            let mut st = self.inner.state.lock();
            let FileState {
                header, free, dirs, ..
            } = &mut *st;
            let d = &mut dirs[dir.0];
            d.keys
                .retain(|h| !removed.iter().any(|r| r.seek_key == h.seek_key));
            d.dirty = true;
            for hdr in removed {
                release(free, header, hdr.seek_key, hdr.nbytes as i64, &mut writes);
            }
        }
        apply(&writer, writes).await
    }

    /// release_ranges frees byte ranges not listed in any directory.
    pub(crate) async fn release_ranges(&self, ranges: &[(i64, i64)]) -> Result<()> {
        let writer = self.writer()?;
        let mut writes = Vec::new();
        {
            let mut st = self.inner.state.lock();
            let FileState { header, free, .. } = &mut *st;
            for (seek, nbytes) in ranges {
                release(free, header, *seek, *nbytes, &mut writes);
            }
        }
        apply(&writer, writes).await
    }

    /// load_dir decodes the sub-directory stored under hdr, reusing it when it
    /// was loaded before.
    pub(crate) async fn load_dir(&self, parent: DirId, hdr: &KeyHeader) -> Result<DirId> {
        if let Some(id) = self.with_state(|st| st.dirs[parent.0].children.get(&hdr.name).copied()) {
            return Ok(id);
        }

        let (key, raw) = self.read_raw_key(hdr.seek_key).await?;
        let payload = payload_of(&key, &raw)?;
        let record = DirRecord::unmarshal(&mut RBuffer::with_origin(&payload, key.keylen as usize))?;
        let (keys, pages) = read_key_pages(self.inner.reader.as_ref(), record.seek_keys).await?;

        let mut st = self.inner.state.lock();
        if let Some(id) = st.dirs[parent.0].children.get(&hdr.name) {
            return Ok(*id);
        }
        let id = DirId(st.dirs.len());
        st.dirs.push(DirState {
            key,
            record,
            parent: Some(parent),
            keys,
            pages,
            children: HashMap::new(),
            dirty: false,
            deleted: false,
        });
        st.dirs[parent.0].children.insert(hdr.name.clone(), id);
        Ok(id)
    }

    /// create_dir writes a new empty sub-directory of parent.
    pub(crate) async fn create_dir(&self, parent: DirId, name: &str, title: &str) -> Result<DirId> {
        let exists = self.with_state(|st| st.dirs[parent.0].keys.iter().any(|h| h.name == name));
        if exists {
            return Err(Error::AlreadyExists(format!(
                "directory already contains a key named {:?}",
                name
            )));
        }

        let now = Datime::now();
        let mut record = DirRecord::new(now);
        record.seek_parent = self.with_state(|st| st.dirs[parent.0].key.seek_key);
        let mut w = WBuffer::new();
        record.marshal(&mut w);

        let key = self
            .write_key(
                parent,
                NewKey {
                    class: "TDirectory",
                    name,
                    title,
                    extra: &[],
                    payload: w.into_vec(),
                    compression: Compression::none(),
                    listed: true,
                },
            )
            .await?;

        record.seek_dir = key.seek_key;
        record.nbytes_name = key.keylen as i32;
        let mut st = self.inner.state.lock();
        let id = DirId(st.dirs.len());
        st.dirs.push(DirState {
            key,
            record,
            parent: Some(parent),
            keys: Vec::new(),
            pages: Vec::new(),
            children: HashMap::new(),
            dirty: true,
            deleted: false,
        });
        st.dirs[parent.0].children.insert(name.to_string(), id);
        Ok(id)
    }

    /// drop_dir forgets a deleted sub-directory and frees its key-list pages.
    pub(crate) async fn drop_dir(&self, id: DirId) -> Result<()> {
        let writer = self.writer()?;
        let mut writes = Vec::new();
        {
            let mut st = self.inner.state.lock();
            let FileState {
                header, free, dirs, ..
            } = &mut *st;
            let pages = std::mem::take(&mut dirs[id.0].pages);
            for (seek, nbytes) in pages {
                release(free, header, seek, nbytes as i64, &mut writes);
            }
            dirs[id.0].deleted = true;
            dirs[id.0].dirty = false;
            if let Some(parent) = dirs[id.0].parent {
                let name = dirs[id.0].key.name.clone();
                dirs[parent.0].children.remove(&name);
            }
        }
        apply(&writer, writes).await
    }

    /// flush persists directory indexes, streamers, the free list and the header.
    async fn flush(&self) -> Result<()> {
        let writer = match &self.inner.writer {
            Some(w) => w.clone(),
            None => return Ok(()),
        };

        let info_keylen =
            KeyHeader::header_len(STREAMER_INFO_CLASS, STREAMER_INFO_NAME, STREAMER_INFO_TITLE);
        let info_payload = if self.inner.state.lock().streamers_dirty {
            let infos = self.inner.registry.infos();
            let list = List::new(
                infos
                    .iter()
                    .map(|i| Box::new(i.as_ref().clone()) as Box<dyn Object>)
                    .collect(),
            );
            let mut w = WBuffer::with_origin(info_keylen);
            list.marshal(&mut w, &self.inner.registry)?;
            Some(w.into_vec())
        } else {
            None
        };
        let info_data = match &info_payload {
            Some(p) => Some(compress(p, self.inner.options.compression)?),
            None => None,
        };

        let mut writes = Vec::new();
        {
            let mut st = self.inner.state.lock();
            let per_page = self.inner.options.keys_per_page.max(1);
            for id in 0..st.dirs.len() {
                if st.dirs[id].dirty && !st.dirs[id].deleted {
                    layout_dir(&mut st, id, per_page, &mut writes)?;
                }
            }

            let FileState {
                header,
                free,
                dirs,
                streamers_dirty,
                info_key,
                free_key,
            } = &mut *st;
            let root_seek = dirs[0].key.seek_key;

            if let (Some(payload), Some(data)) = (&info_payload, &info_data) {
                if let Some((seek, nbytes)) = info_key.take() {
                    release(free, header, seek, nbytes as i64, &mut writes);
                }
                let mut key = KeyHeader::new(STREAMER_INFO_CLASS, STREAMER_INFO_NAME, STREAMER_INFO_TITLE)?;
                key.objlen = payload.len() as i32;
                key.nbytes = key.keylen as i32 + data.len() as i32;
                key.seek_pdir = root_seek;
                key.seek_key = allocate(free, header, key.nbytes as i64, &mut writes);
                let mut w = WBuffer::new();
                key.marshal(&mut w);
                w.write_bytes(data);
                writes.push((key.seek_key, w.into_vec()));
                header.seek_info = key.seek_key;
                header.nbytes_info = key.nbytes;
                *info_key = Some((key.seek_key, key.nbytes));
                *streamers_dirty = false;
            }

            if let Some((seek, nbytes)) = free_key.take() {
                release(free, header, seek, nbytes as i64, &mut writes);
            }
            let name = dirs[0].key.name.clone();
            let mut key = KeyHeader::new("TFile", &name, "")?;
            let reserved = free.len() * SEGMENT_LEN;
            key.objlen = reserved as i32;
            key.nbytes = key.keylen as i32 + reserved as i32;
            key.seek_pdir = root_seek;
            key.seek_key = allocate(free, header, key.nbytes as i64, &mut writes);
            let mut w = WBuffer::new();
            key.marshal(&mut w);
            free.marshal(&mut w);
            let mut data = w.into_vec();
            data.resize(key.nbytes as usize, 0);
            writes.push((key.seek_key, data));
            header.seek_free = key.seek_key;
            header.nbytes_free = key.nbytes;
            header.nfree = free.len() as i32;
            *free_key = Some((key.seek_key, key.nbytes));

            header.end = free.end();
            header.nbytes_name = dirs[0].record.nbytes_name;
            writes.push((0, header.marshal()));
        }

        apply(&writer, writes).await?;
        writer.sync().await?;
        Ok(())
    }

    /// close persists pending changes of a writable file and releases the
    /// underlying handle. Calling it again is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let flushed = self.flush().await;
        self.inner.baskets.clear();
        self.inner.reader.close().await?;
        flushed?;

        tracing::debug!("closed file {:?}", self.inner.path);
        Ok(())
    }
}

/// layout_dir writes the key-list pages of a directory and rewrites its record.
fn layout_dir(st: &mut FileState, id: usize, per_page: usize, writes: &mut Writes) -> Result<()> {
    let FileState {
        header, free, dirs, ..
    } = st;

    for (seek, nbytes) in std::mem::take(&mut dirs[id].pages) {
        release(free, header, seek, nbytes as i64, writes);
    }

    let parent_seek = dirs[id]
        .parent
        .map(|p| dirs[p.0].key.seek_key)
        .unwrap_or(0);
    let dir = &mut dirs[id];
    let class = dir.class();
    let chunks: Vec<&[KeyHeader]> = if dir.keys.is_empty() {
        vec![&dir.keys[..]]
    } else {
        dir.keys.chunks(per_page).collect()
    };

    let mut pages = Vec::with_capacity(chunks.len());
    for chunk in &chunks {
        let mut page = KeyHeader::new(class, &dir.key.name, &dir.key.title)?;
        let mut w = WBuffer::new();
        for hdr in chunk.iter() {
            hdr.marshal(&mut w);
        }
        page.objlen = (4 + w.pos() + PAGE_TRAILER_LEN) as i32;
        page.nbytes = page.keylen as i32 + page.objlen;
        page.seek_pdir = dir.key.seek_key;
        page.seek_key = allocate(free, header, page.nbytes as i64, writes);
        pages.push(page);
    }

    for (i, chunk) in chunks.iter().enumerate() {
        let page = &pages[i];
        let mut w = WBuffer::new();
        page.marshal(&mut w);
        w.write_i32(chunk.len() as i32);
        for hdr in chunk.iter() {
            hdr.marshal(&mut w);
        }
        match pages.get(i + 1) {
            Some(next) => {
                w.write_i64(next.seek_key);
                w.write_i32(next.nbytes);
            }
            None => {
                w.write_i64(0);
                w.write_i32(0);
            }
        }
        writes.push((page.seek_key, w.into_vec()));
    }

    dir.record.seek_keys = pages[0].seek_key;
    dir.record.nbytes_keys = pages[0].nbytes;
    dir.record.seek_dir = dir.key.seek_key;
    dir.record.seek_parent = parent_seek;
    dir.record.mtime = Datime::now();
    dir.pages = pages.iter().map(|p| (p.seek_key, p.nbytes)).collect();
    dir.dirty = false;
    writes.push((dir.key.seek_key, dir.key_bytes()));
    Ok(())
}

async fn apply(writer: &WritableFile, writes: Writes) -> Result<()> {
    for (offset, data) in writes {
        writer.write_at(offset as u64, &data).await?;
    }
    Ok(())
}

/// read_key reads the whole key stored at seek.
async fn read_key(reader: &dyn RandomAccessFile, seek: i64) -> Result<(KeyHeader, Vec<u8>)> {
    if seek <= 0 {
        return Err(Error::corrupted(format!("invalid key offset {}", seek)));
    }
    let nbytes = reader
        .read_u32(seek as u64)
        .await
        .map_err(|e| truncated(e, format!("key at {}", seek)))? as i32;
    if nbytes <= 0 {
        return Err(Error::corrupted(format!(
            "no key at offset {}: found a free gap of {} bytes",
            seek, -(nbytes as i64)
        )));
    }

    let raw = reader
        .read_exact_at(seek as u64, nbytes as usize)
        .await
        .map_err(|e| truncated(e, format!("key at {} of {} bytes", seek, nbytes)))?;
    let hdr = KeyHeader::unmarshal(&mut RBuffer::new(&raw))?;
    if hdr.seek_key != seek {
        return Err(Error::corrupted(format!(
            "key {:?} found at {} records offset {}",
            hdr.name, seek, hdr.seek_key
        )));
    }
    Ok((hdr, raw))
}

fn payload_of(hdr: &KeyHeader, raw: &[u8]) -> Result<Vec<u8>> {
    decompress(&raw[hdr.keylen as usize..], hdr.objlen as usize)
}

/// read_key_pages reads a directory key list, following overflow pages.
async fn read_key_pages(
    reader: &dyn RandomAccessFile,
    seek: i64,
) -> Result<(Vec<KeyHeader>, Vec<(i64, i32)>)> {
    let mut keys = Vec::new();
    let mut pages = Vec::new();
    let mut next = seek;
    while next > 0 {
        if pages.iter().any(|(s, _)| *s == next) {
            return Err(Error::corrupted(format!("key-list pages loop at {}", next)));
        }
        let (page, raw) = read_key(reader, next).await?;
        pages.push((next, page.nbytes));

        let payload = payload_of(&page, &raw)?;
        let mut r = RBuffer::new(&payload);
        let n = r.read_i32()?;
        for _ in 0..n.max(0) {
            keys.push(KeyHeader::unmarshal(&mut r)?);
        }
        next = if r.remaining() >= PAGE_TRAILER_LEN {
            let seek = r.read_i64()?;
            let _nbytes = r.read_i32()?;
            seek
        } else {
            0
        };
    }
    Ok((keys, pages))
}

#[cfg(test)]
mod tests {
    use super::next_cycle;
    use crate::error::Error;
    use crate::riofs::{File, KeyHeader};
    use crate::streamer::{BasicType, ElementKind, FieldDesc, Record, StreamerInfo, Value};

    fn key(name: &str, cycle: i16) -> KeyHeader {
        let mut hdr = KeyHeader::new("TNamed", name, "").unwrap();
        hdr.cycle = cycle;
        hdr
    }

    #[test]
    fn test_next_cycle() {
        let keys = vec![key("a", 1), key("b", 4), key("a", 2)];
        assert_eq!(next_cycle(&keys, "a").unwrap(), 3);
        assert_eq!(next_cycle(&keys, "c").unwrap(), 1);

        let keys = vec![key("a", i16::MAX)];
        match next_cycle(&keys, "a") {
            Err(Error::InvalidArgument(msg)) => assert!(msg.contains("no cycle left"), "{}", msg),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unlist_failed_key() {
        let dir = tempfile::tempdir().unwrap();
        let f = File::create(dir.path().join("unlist.root")).await.unwrap();
        f.register_streamer(StreamerInfo::new(
            "Point",
            1,
            vec![FieldDesc::new("x", ElementKind::Basic(BasicType::I32))],
        ))
        .unwrap();
        let root = f.root();
        let point = Record::new("Point", 1).with("x", Value::I32(1));

        let p = root.put("p", &point).await.unwrap();
        f.unlist_key(root.id(), p.header(), true);
        assert!(root.keys().is_empty());

        let q = root.put("q", &point).await.unwrap();
        assert_eq!(q.seek(), p.seek());
        assert_eq!(root.put("p", &point).await.unwrap().cycle(), 1);
        f.close().await.unwrap();
    }
}
