#[macro_use]
extern crate async_trait;

use std::io;
use std::io::ErrorKind;

pub mod file;
pub mod mmap;

/// RandomAccessFile reads bytes at arbitrary offsets without moving a shared cursor.
#[async_trait]
pub trait RandomAccessFile: Send + Sync {
    /// read fills buf starting at offset and returns the number of bytes read.
    /// A read past the end of the file is an `UnexpectedEof` error.
    async fn read(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// size returns the current length of the file in bytes.
    async fn size(&self) -> io::Result<u64>;

    /// close releases the underlying handle. Calling it more than once is a no-op.
    async fn close(&self) -> io::Result<()>;
}

#[async_trait]
pub trait RandomAccessFileExt: RandomAccessFile {
    /// read_exact_at returns exactly len bytes starting at offset.
    async fn read_exact_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0_u8; len];
        let n = self.read(offset, &mut buf).await?;
        if n != len {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("short read at {}: got {} of {} bytes", offset, n, len),
            ));
        }
        Ok(buf)
    }

    /// read_u32 reads a big-endian u32 at offset.
    async fn read_u32(&self, offset: u64) -> io::Result<u32> {
        let buf = self.read_exact_at(offset, 4).await?;
        Ok(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
    }
}

impl<R: RandomAccessFile + ?Sized> RandomAccessFileExt for R {}

/// Writable writes bytes at arbitrary offsets, growing the file as needed.
#[async_trait]
pub trait Writable: Send + Sync {
    async fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;

    async fn flush(&self) -> io::Result<()>;

    async fn sync(&self) -> io::Result<()>;
}
