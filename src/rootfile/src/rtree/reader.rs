use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, RangeViolation, Result};
use crate::rtree::binder::compatible;
use crate::rtree::{read_vars_for, BasketData, BranchRecord, ReadVar, Tree};
use crate::streamer::Value;

/// ReaderConfig collects the settings applied by read options.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// first entry to read.
    pub begin: i64,
    /// entry past the last one to read, -1 for the end of the tree.
    pub end: i64,
    pub cancellation: Option<CancellationToken>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            begin: 0,
            end: -1,
            cancellation: None,
        }
    }
}

type ReadOptionFn = Box<dyn FnOnce(&mut ReaderConfig) -> anyhow::Result<()> + Send>;

/// ReadOption configures a tree reader.
pub struct ReadOption(ReadOptionFn);

impl ReadOption {
    pub fn new(f: impl FnOnce(&mut ReaderConfig) -> anyhow::Result<()> + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    /// with_range restricts the scan to the entries `[begin, end)`.
    pub fn with_range(begin: i64, end: i64) -> Self {
        Self::new(move |cfg| {
            cfg.begin = begin;
            cfg.end = end;
            Ok(())
        })
    }

    /// with_cancellation stops the scan, between two entries, once token is cancelled.
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self::new(move |cfg| {
            cfg.cancellation = Some(token);
            Ok(())
        })
    }
}

/// RCtx is handed to the read callback for every entry.
#[derive(Debug)]
pub struct RCtx<'a> {
    entry: i64,
    vars: &'a [ReadVar],
}

impl<'a> RCtx<'a> {
    /// entry is the index of the current entry in the tree.
    pub fn entry(&self) -> i64 {
        self.entry
    }

    pub fn vars(&self) -> &'a [ReadVar] {
        self.vars
    }

    /// value is the decoded value of the leaf named name.
    pub fn value(&self, name: &str) -> Option<Value> {
        self.vars.iter().find(|v| v.name() == name).map(|v| v.value())
    }
}

struct Cursor {
    branch: BranchRecord,
    basket: Option<Arc<BasketData>>,
}

/// Reader scans a range of entries of a tree, decoding the bound leaves of
/// every entry in lock-step.
pub struct Reader {
    tree: Tree,
    vars: Vec<ReadVar>,
    cursors: Vec<Cursor>,
    begin: i64,
    end: i64,
    cancellation: Option<CancellationToken>,
    closed: bool,
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("tree", &self.tree.name())
            .field("begin", &self.begin)
            .field("end", &self.end)
            .field("vars", &self.vars)
            .finish()
    }
}

fn check_range(begin: i64, end: i64, entries: i64) -> Result<()> {
    let violation = if begin < 0 {
        RangeViolation::NegativeStart { start: begin }
    } else if begin > end {
        RangeViolation::StartAfterEnd { start: begin, end }
    } else if begin > entries {
        RangeViolation::StartBeyondEntries { start: begin, entries }
    } else if end > entries {
        RangeViolation::EndBeyondEntries { end, entries }
    } else {
        return Ok(());
    };
    Err(Error::Range {
        begin,
        end,
        violation,
    })
}

impl Reader {
    /// new binds rvars to the leaves of tree, every leaf when rvars is empty.
    /// Options are applied in order and the resulting range is validated
    /// before any basket is read.
    pub fn new(tree: &Tree, rvars: Vec<ReadVar>, options: Vec<ReadOption>) -> Result<Self> {
        tree.file().check_open()?;

        let mut cfg = ReaderConfig::default();
        for (i, opt) in options.into_iter().enumerate() {
            (opt.0)(&mut cfg).map_err(|source| Error::ReadOption { index: i + 1, source })?;
        }
        let entries = tree.entries();
        let end = if cfg.end == -1 { entries } else { cfg.end };
        check_range(cfg.begin, end, entries)?;

        let vars = if rvars.is_empty() {
            read_vars_for(tree)
        } else {
            rvars
        };
        let mut cursors = Vec::with_capacity(vars.len());
        for v in &vars {
            let branch = tree.leaf(v.name()).ok_or_else(|| Error::LeafNotFound {
                tree: tree.name().to_string(),
                name: v.name().to_string(),
            })?;
            if !compatible(&v.type_desc(), &branch.leaf.kind) {
                return Err(Error::binding(format!(
                    "invalid read variable {:?}: {} cannot hold {} entries",
                    v.name(),
                    v.type_desc().name(),
                    branch.leaf.kind
                )));
            }
            cursors.push(Cursor {
                branch: branch.clone(),
                basket: None,
            });
        }

        Ok(Self {
            tree: tree.clone(),
            vars,
            cursors,
            begin: cfg.begin,
            end,
            cancellation: cfg.cancellation,
            closed: false,
        })
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// range is the `[begin, end)` range of entries scanned by read.
    pub fn range(&self) -> (i64, i64) {
        (self.begin, self.end)
    }

    pub fn vars(&self) -> &[ReadVar] {
        &self.vars
    }

    /// read decodes every entry of the range into the read variables and calls
    /// f after each one. The first failure of f stops the scan.
    pub async fn read<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&RCtx<'_>) -> anyhow::Result<()>,
    {
        if self.closed {
            return Err(Error::Closed("tree reader"));
        }
        tracing::debug!(
            "reading entries [{}, {}) of tree {:?}",
            self.begin,
            self.end,
            self.tree.name()
        );

        for entry in self.begin..self.end {
            if let Some(token) = &self.cancellation {
                if token.is_cancelled() {
                    return Err(Error::Cancelled { entry });
                }
            }
            self.load(entry).await?;

            let ctx = RCtx {
                entry,
                vars: &self.vars,
            };
            f(&ctx).map_err(|source| Error::Process { entry, source })?;
        }
        Ok(())
    }

    /// load decodes entry into every read variable, fetching baskets on
    /// basket boundaries.
    async fn load(&mut self, entry: i64) -> Result<()> {
        let reg = self.tree.file().registry();
        for (cur, var) in self.cursors.iter_mut().zip(&self.vars) {
            let fresh = match &cur.basket {
                Some(b) if b.contains(entry) => None,
                _ => {
                    let idx = cur.branch.find_basket(entry).ok_or_else(|| {
                        Error::corrupted(format!(
                            "branch {:?} has no basket holding entry {}",
                            cur.branch.name, entry
                        ))
                    })?;
                    Some(self.tree.basket(&cur.branch, idx).await?)
                }
            };
            if let Some(basket) = fresh {
                cur.basket = Some(basket);
            }
            let basket = match &cur.basket {
                Some(b) => b,
                None => continue,
            };
            let v = cur.branch.leaf.decode(basket.entry(entry)?, reg)?;
            var.store(v)?;
        }
        Ok(())
    }

    /// close releases the baskets held by the reader. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        for cur in &mut self.cursors {
            cur.basket = None;
        }
        self.closed = true;
        Ok(())
    }
}
