use std::io;
use std::io::{ErrorKind, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::{RandomAccessFile, Writable};

/// WritableFile is a read-write file handle supporting positional reads and writes.
/// The handle is shared behind a mutex so that `&self` access is enough for both.
pub struct WritableFile {
    f: Mutex<File>,
    len: AtomicU64,
    closed: AtomicBool,
}

impl WritableFile {
    /// create creates a new file, failing if one already exists at path.
    pub async fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let f = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)
            .await?;

        Ok(Self::with_file(f, 0))
    }

    /// open opens an existing file for reading and writing.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let f = OpenOptions::new().read(true).write(true).open(path).await?;
        let len = f.metadata().await?.len();

        Ok(Self::with_file(f, len))
    }

    fn with_file(f: File, len: u64) -> Self {
        Self {
            f: Mutex::new(f),
            len: AtomicU64::new(len),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(ErrorKind::Other, "file already closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl RandomAccessFile for WritableFile {
    async fn read(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.check_open()?;

        let len = self.len.load(Ordering::Acquire);
        if offset + buf.len() as u64 > len {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!(
                    "read [{}, {}) beyond end of file ({})",
                    offset,
                    offset + buf.len() as u64,
                    len
                ),
            ));
        }

        let mut f = self.f.lock().await;
        f.seek(SeekFrom::Start(offset)).await?;
        f.read_exact(buf).await?;
        Ok(buf.len())
    }

    async fn size(&self) -> io::Result<u64> {
        Ok(self.len.load(Ordering::Acquire))
    }

    async fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut f = self.f.lock().await;
        f.flush().await?;
        f.sync_all().await
    }
}

#[async_trait]
impl Writable for WritableFile {
    async fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.check_open()?;

        let mut f = self.f.lock().await;
        f.seek(SeekFrom::Start(offset)).await?;
        f.write_all(data).await?;
        self.len
            .fetch_max(offset + data.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        self.check_open()?;
        self.f.lock().await.flush().await
    }

    async fn sync(&self) -> io::Result<()> {
        self.check_open()?;
        let mut f = self.f.lock().await;
        f.flush().await?;
        f.sync_all().await
    }
}
