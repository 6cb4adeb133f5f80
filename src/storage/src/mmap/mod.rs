use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::{io, ptr};

use memmap2::{Mmap, MmapOptions};
use tokio::fs::File;

use crate::RandomAccessFile;

/// MmapReadableFile serves reads from a read-only memory map of the whole file.
pub struct MmapReadableFile {
    _f: File,
    len: usize,
    mmap: Option<Mmap>,
    closed: AtomicBool,
}

impl MmapReadableFile {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let f = File::open(path).await?;

        let meta = f.metadata().await?;
        let len = meta.len() as usize;

        // an empty file cannot be mapped on every platform.
        let mmap = if len == 0 {
            None
        } else {
            Some(unsafe { MmapOptions::new().offset(0).len(len).map(&f)? })
        };

        Ok(Self {
            _f: f,
            len,
            mmap,
            closed: AtomicBool::new(false),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[async_trait]
impl RandomAccessFile for MmapReadableFile {
    async fn read(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let size = buf.len();
        if size == 0 {
            return Ok(0);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(ErrorKind::Other, "file already closed"));
        }

        let offset = offset as usize;
        let upper = offset.checked_add(size).unwrap_or(usize::MAX);
        let mmap = match &self.mmap {
            Some(mmap) if upper <= self.len => mmap,
            _ => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("read [{}, {}) beyond end of file ({})", offset, upper, self.len),
                ))
            }
        };

        let data = &mmap[offset..upper];
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), buf.as_mut_ptr(), size);
        }

        Ok(size)
    }

    async fn size(&self) -> io::Result<u64> {
        Ok(self.len as u64)
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::fs::File;
    use tokio::io;
    use tokio::io::AsyncWriteExt;

    use crate::mmap::MmapReadableFile;
    use crate::{RandomAccessFile, RandomAccessFileExt};

    #[tokio::test]
    async fn test_mmap_readable_file() -> io::Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.as_ref().join("mmap_test");

        let data = "0123456789".as_bytes();
        let len = {
            let mut f = File::create(&path).await?;
            let len = f.write(data).await?;
            f.sync_all().await?;
            drop(f);
            len
        };

        let accessor = MmapReadableFile::open(&path).await?;
        assert_eq!(accessor.size().await?, len as u64);

        let mut buf = vec![0_u8; len];
        accessor.read(0, &mut buf[..]).await?;
        assert_eq!(buf.as_slice(), data);

        let tail = accessor.read_exact_at(8, 2).await?;
        assert_eq!(tail.as_slice(), b"89");

        let err = accessor.read_exact_at(8, 3).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);

        accessor.close().await?;
        accessor.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_mmap_empty_file() -> io::Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.as_ref().join("empty");
        File::create(&path).await?;

        let accessor = MmapReadableFile::open(&path).await?;
        assert!(accessor.is_empty());
        assert!(accessor.read_u32(0).await.is_err());
        Ok(())
    }
}
