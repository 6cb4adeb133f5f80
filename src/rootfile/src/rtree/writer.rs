use std::collections::HashSet;

use crate::compress::Compression;
use crate::error::{Error, Result};
use crate::riofs::{Directory, KeyHeader, NewKey};
use crate::rtree::basket::{BasketBuilder, BASKET_EXTRA_LEN};
use crate::rtree::{BranchRecord, Leaf, TreeRecord, WriteVar};
use crate::streamer::{ElementKind, Value};

const DEFAULT_BASKET_SIZE: usize = 32 * 1024;

/// WriterConfig collects the settings applied by write options.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub title: String,
    pub compression: Compression,
    /// number of uncompressed bytes buffered per branch before a basket is written.
    pub basket_size: usize,
}

type WriteOptionFn = Box<dyn FnOnce(&mut WriterConfig) -> anyhow::Result<()> + Send>;

/// WriteOption configures a tree writer.
pub struct WriteOption(WriteOptionFn);

impl WriteOption {
    pub fn new(f: impl FnOnce(&mut WriterConfig) -> anyhow::Result<()> + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn with_title(title: impl Into<String>) -> Self {
        let title = title.into();
        Self::new(move |cfg| {
            cfg.title = title;
            Ok(())
        })
    }

    pub fn with_compression(compression: Compression) -> Self {
        Self::new(move |cfg| {
            cfg.compression = compression;
            Ok(())
        })
    }

    pub fn with_basket_size(size: usize) -> Self {
        Self::new(move |cfg| {
            if size == 0 {
                anyhow::bail!("invalid basket size 0");
            }
            cfg.basket_size = size;
            Ok(())
        })
    }
}

struct Column {
    var: WriteVar,
    leaf: Leaf,
    /// index of the column holding the count of a counted leaf.
    count: Option<usize>,
    builder: BasketBuilder,
}

/// Writer appends entries to a new tree, one basket per branch at a time.
///
/// The tree record is stored by `close`; a writer dropped without being
/// closed leaves only orphan baskets behind.
pub struct Writer {
    dir: Directory,
    cfg: WriterConfig,
    record: TreeRecord,
    columns: Vec<Column>,
    closed: bool,
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("name", &self.record.name)
            .field("entries", &self.record.entries)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Writer {
    /// new prepares a tree named name in dir with one branch per variable.
    pub fn new(dir: &Directory, name: &str, wvars: Vec<WriteVar>, options: Vec<WriteOption>) -> Result<Self> {
        let file = dir.file();
        file.check_open()?;
        if !file.is_writable() {
            return Err(Error::ReadOnly(file.path().display().to_string()));
        }

        let mut cfg = WriterConfig {
            title: String::new(),
            compression: file.options().compression,
            basket_size: DEFAULT_BASKET_SIZE,
        };
        for (i, opt) in options.into_iter().enumerate() {
            (opt.0)(&mut cfg).map_err(|source| Error::WriteOption { index: i + 1, source })?;
        }

        let mut seen = HashSet::new();
        for v in &wvars {
            if v.name().is_empty() || !seen.insert(v.name().to_string()) {
                return Err(Error::binding(format!(
                    "invalid or duplicate write variable name {:?}",
                    v.name()
                )));
            }
        }

        let mut columns = Vec::with_capacity(wvars.len());
        let mut record = TreeRecord::new(name, cfg.title.clone());
        for v in &wvars {
            let count = match v.count() {
                Some(count) => {
                    let idx = wvars
                        .iter()
                        .position(|c| c.name() == count)
                        .filter(|&i| matches!(wvars[i].kind(), ElementKind::Basic(t) if t.is_integer()))
                        .ok_or_else(|| {
                            Error::binding(format!(
                                "count {:?} of write variable {:?} is not an integer variable",
                                count,
                                v.name()
                            ))
                        })?;
                    Some(idx)
                }
                None => None,
            };
            for info in v.streamers() {
                file.register_streamer(info.clone())?;
            }

            let leaf = Leaf::new(v.name(), v.kind().clone());
            record.branches.push(BranchRecord::new(
                leaf.clone(),
                cfg.compression.settings(),
                cfg.basket_size as i32,
            ));
            columns.push(Column {
                var: v.clone(),
                builder: BasketBuilder::new(leaf.entry_size()),
                leaf,
                count,
            });
        }

        tracing::debug!(
            "writing tree {:?} in {} with {} branches",
            name,
            dir.path(),
            columns.len()
        );
        Ok(Self {
            dir: dir.clone(),
            cfg,
            record,
            columns,
            closed: false,
        })
    }

    pub fn entries(&self) -> i64 {
        self.record.entries
    }

    /// write appends one entry made of the current values of the write
    /// variables and returns its encoded size.
    pub async fn write(&mut self) -> Result<usize> {
        if self.closed {
            return Err(Error::Closed("tree writer"));
        }
        let values: Vec<Value> = self.columns.iter().map(|c| c.var.value()).collect();

        let reg = self.dir.file().registry();
        let mut encoded = Vec::with_capacity(self.columns.len());
        for (i, c) in self.columns.iter().enumerate() {
            let count = match c.count {
                Some(idx) => {
                    let n = values[idx].as_i64().filter(|n| *n >= 0).ok_or_else(|| {
                        Error::binding(format!(
                            "invalid count {} for leaf {:?}",
                            values[idx],
                            c.leaf.name
                        ))
                    })?;
                    Some(n as usize)
                }
                None => None,
            };
            encoded.push(c.leaf.encode(&values[i], count, reg)?);
        }

        let mut n = 0;
        for (c, data) in self.columns.iter_mut().zip(&encoded) {
            c.builder.push(data);
            n += data.len();
        }
        self.record.entries += 1;

        for i in 0..self.columns.len() {
            if self.columns[i].builder.len() >= self.cfg.basket_size {
                self.flush(i).await?;
            }
        }
        Ok(n)
    }

    /// flush writes the buffered entries of column i as a basket.
    async fn flush(&mut self, i: usize) -> Result<()> {
        let column = &mut self.columns[i];
        if column.builder.is_empty() {
            return Ok(());
        }
        let entries = column.builder.entries() as i64;
        let keylen = KeyHeader::header_len("TBasket", &column.leaf.name, &self.record.name) + BASKET_EXTRA_LEN;
        let (fields, payload) = column.builder.finish(keylen, self.cfg.basket_size as i32);
        let extra = fields.encode();

        let hdr = self
            .dir
            .file()
            .write_key(
                self.dir.id(),
                NewKey {
                    class: "TBasket",
                    name: &column.leaf.name,
                    title: &self.record.name,
                    extra: &extra,
                    payload,
                    compression: self.cfg.compression,
                    listed: false,
                },
            )
            .await?;

        self.record.branches[i].add_basket(hdr.seek_key, hdr.nbytes, hdr.objlen, hdr.keylen as i32, entries);
        Ok(())
    }

    /// close flushes the pending baskets and stores the tree record. Closing
    /// twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        for i in 0..self.columns.len() {
            self.flush(i).await?;
        }
        self.record.tot_bytes = self.record.branches.iter().map(|b| b.tot_bytes).sum();
        self.record.zip_bytes = self.record.branches.iter().map(|b| b.zip_bytes).sum();

        let title = self.record.title.clone();
        self.dir
            .put_with_title(&self.record.name, &title, &self.record)
            .await?;
        self.closed = true;

        tracing::debug!(
            "closed tree {:?}: {} entries, {} bytes",
            self.record.name,
            self.record.entries,
            self.record.zip_bytes
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use crate::compress::Compression;
    use crate::error::Error;
    use crate::riofs::File;
    use crate::rtree::{write_vars, Slot, WriteOption, WriteVar, Writer};
    use crate::streamer::{BasicType, ElementKind};

    #[derive(Debug, Default, Clone)]
    struct Evt {
        n: i32,
        xs: Vec<f64>,
    }

    crate::impl_record!(Evt { n: i32, xs: Vec<f64> => "xs[n]" });

    #[tokio::test]
    async fn test_write_baskets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("w.root");
        let f = File::create(&path).await.unwrap();

        let slot = Slot::new(Evt::default());
        let mut w = Writer::new(
            &f.root(),
            "evts",
            write_vars(&slot).unwrap(),
            vec![
                WriteOption::with_title("events"),
                WriteOption::with_basket_size(64),
                WriteOption::with_compression(Compression::none()),
            ],
        )
        .unwrap();
        for i in 0..100 {
            let mut e = slot.lock();
            e.n = i % 5;
            e.xs = (0..e.n).map(|j| j as f64).collect();
            drop(e);
            w.write().await.unwrap();
        }
        assert_eq!(w.entries(), 100);
        w.close().await.unwrap();
        w.close().await.unwrap();
        assert!(matches!(w.write().await, Err(Error::Closed(_))));
        f.close().await.unwrap();

        let f = File::open(&path).await.unwrap();
        let tree = f.get_tree("evts").await.unwrap();
        assert_eq!(tree.entries(), 100);
        assert_eq!(tree.title(), "events");
        let n = tree.branch("n").unwrap();
        assert!(n.baskets() > 1);
        assert_eq!(n.entries, 100);
        let xs = tree.branch("xs").unwrap();
        assert_eq!(
            xs.leaf.kind,
            ElementKind::Counted {
                elem: BasicType::F64,
                count: "n".to_string()
            }
        );
        assert_eq!(*xs.basket_entry.last().unwrap(), 100);
        f.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_errors() {
        let dir = tempdir().unwrap();
        let f = File::create(dir.path().join("e.root")).await.unwrap();

        let n = Slot::new(2_i32);
        let xs = Slot::new(vec![1.0_f32]);
        let vars = vec![
            WriteVar::new("n", &n).unwrap(),
            WriteVar::new("xs", &xs).unwrap().with_count("n").unwrap(),
        ];
        let mut w = Writer::new(&f.root(), "t", vars, vec![]).unwrap();
        let err = w.write().await.unwrap_err();
        assert!(err.to_string().contains("does not match count \"n\"=2"));
        assert_eq!(w.entries(), 0);
        xs.set(vec![1.0, 2.0]);
        w.write().await.unwrap();
        w.close().await.unwrap();

        let err = Writer::new(
            &f.root(),
            "t",
            vec![WriteVar::new("xs", &xs).unwrap().with_count("m").unwrap()],
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, Error::Binding(_)));

        let err = Writer::new(
            &f.root(),
            "t",
            vec![],
            vec![WriteOption::with_title("ok"), WriteOption::with_basket_size(0)],
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "could not set writer option 2: invalid basket size 0");
        f.close().await.unwrap();
    }
}
