//! Block compression of key payloads.
//!
//! A compressed payload is a sequence of blocks, each at most `MAX_BLOCK_SIZE`
//! uncompressed bytes and each preceded by a 9-byte header:
//!
//! ```text
//! +-----+--------+-------------+---------------+
//! | tag | method | csize (u24) | usize (u24)   |
//! | 2B  | 1B     | 3B LE       | 3B LE         |
//! +-----+--------+-------------+---------------+
//! ```
//!
//! A payload whose compressed form is not smaller than the input is stored raw,
//! without any header; readers tell the two apart by comparing the stored and
//! the declared uncompressed lengths.

use std::fmt::{Display, Formatter};
use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const HEADER_SIZE: usize = 9;
pub const MAX_BLOCK_SIZE: usize = 0xff_ffff;

const ZLIB_TAG: &[u8; 2] = b"ZL";
const LZ4_TAG: &[u8; 2] = b"L4";
const ZSTD_TAG: &[u8; 2] = b"ZS";
const LZMA_TAG: &[u8; 2] = b"XZ";
const OLD_ZLIB_TAG: &[u8; 2] = b"CS";

const ZLIB_METHOD: u8 = 8;
const LZ4_VERSION: u8 = 1;
const ZSTD_VERSION: u8 = 1;

const LZ4_CHECKSUM_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    Zlib,
    Lzma,
    Lz4,
    Zstd,
}

impl Algorithm {
    fn code(&self) -> i32 {
        match self {
            Self::Zlib => 1,
            Self::Lzma => 2,
            Self::Lz4 => 4,
            Self::Zstd => 5,
        }
    }
}

/// Compression is a codec choice plus level; level 0 disables compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compression {
    pub algorithm: Algorithm,
    pub level: u32,
}

impl Default for Compression {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Zlib,
            level: 1,
        }
    }
}

impl Compression {
    pub fn new(algorithm: Algorithm, level: u32) -> Self {
        Self {
            algorithm,
            level: level.min(99),
        }
    }

    pub fn none() -> Self {
        Self::new(Algorithm::Zlib, 0)
    }

    /// settings encodes the compression as stored in file and branch headers:
    /// `algorithm * 100 + level`.
    pub fn settings(&self) -> i32 {
        if self.level == 0 {
            return 0;
        }
        self.algorithm.code() * 100 + self.level as i32
    }

    pub fn from_settings(settings: i32) -> Result<Self> {
        if settings < 0 {
            return Err(Error::corrupted(format!(
                "invalid compression settings {}",
                settings
            )));
        }
        let level = (settings % 100) as u32;
        let algorithm = match settings / 100 {
            0 | 1 | 3 => Algorithm::Zlib,
            2 => Algorithm::Lzma,
            4 => Algorithm::Lz4,
            5 => Algorithm::Zstd,
            alg => {
                return Err(Error::corrupted(format!(
                    "unknown compression algorithm {} in settings {}",
                    alg, settings
                )))
            }
        };
        Ok(Self { algorithm, level })
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.level == 0 {
            return write!(f, "none");
        }
        write!(f, "{:?}({})", self.algorithm, self.level)
    }
}

/// compress compresses src block by block. The input is returned unchanged when
/// compression is disabled or does not shrink it.
pub fn compress(src: &[u8], compression: Compression) -> Result<Vec<u8>> {
    if compression.level == 0 || src.is_empty() {
        return Ok(src.to_vec());
    }

    let mut dst = Vec::with_capacity(src.len());
    for chunk in src.chunks(MAX_BLOCK_SIZE) {
        let (tag, method, body) = match compression.algorithm {
            Algorithm::Zlib => (ZLIB_TAG, ZLIB_METHOD, zlib_compress(chunk, compression.level)?),
            Algorithm::Lz4 => (LZ4_TAG, LZ4_VERSION, lz4_compress(chunk)),
            Algorithm::Zstd => (ZSTD_TAG, ZSTD_VERSION, zstd_compress(chunk, compression.level)?),
            Algorithm::Lzma => return Err(unsupported(LZMA_TAG)),
        };
        if body.len() > MAX_BLOCK_SIZE || dst.len() + HEADER_SIZE + body.len() >= src.len() {
            return Ok(src.to_vec());
        }

        let mut hdr = [0_u8; HEADER_SIZE];
        hdr[..2].copy_from_slice(tag);
        hdr[2] = method;
        LittleEndian::write_u24(&mut hdr[3..6], body.len() as u32);
        LittleEndian::write_u24(&mut hdr[6..9], chunk.len() as u32);
        dst.extend_from_slice(&hdr);
        dst.extend_from_slice(&body);
    }

    Ok(dst)
}

/// decompress restores a payload of ulen bytes. A source of exactly ulen
/// bytes was stored raw.
pub fn decompress(src: &[u8], ulen: usize) -> Result<Vec<u8>> {
    if src.len() == ulen {
        return Ok(src.to_vec());
    }

    let mut dst = Vec::with_capacity(ulen.min(MAX_BLOCK_SIZE));
    let mut rest = src;
    while dst.len() < ulen {
        let (block, n) = decompress_block(rest)?;
        dst.extend_from_slice(&block);
        rest = &rest[n..];
    }

    if dst.len() != ulen || !rest.is_empty() {
        return Err(Error::corrupted(format!(
            "decompressed {} bytes with {} left over, expected {}",
            dst.len(),
            rest.len(),
            ulen
        )));
    }
    Ok(dst)
}

/// decompress_block decodes the block at the start of src and returns it with
/// the number of source bytes it occupied.
pub fn decompress_block(src: &[u8]) -> Result<(Vec<u8>, usize)> {
    if src.len() < HEADER_SIZE {
        return Err(Error::TruncatedHeader(src.len()));
    }

    let tag = [src[0], src[1]];
    let csize = LittleEndian::read_u24(&src[3..6]) as usize;
    let ulen = LittleEndian::read_u24(&src[6..9]) as usize;
    if csize > src.len() - HEADER_SIZE {
        return Err(Error::corrupted(format!(
            "compressed block claims {} bytes, {} available",
            csize,
            src.len() - HEADER_SIZE
        )));
    }
    let body = &src[HEADER_SIZE..HEADER_SIZE + csize];

    let block = match &tag {
        ZLIB_TAG | OLD_ZLIB_TAG => zlib_decompress(body, ulen)?,
        LZ4_TAG => lz4_decompress(body, ulen)?,
        ZSTD_TAG => zstd_decompress(body, ulen)?,
        _ => return Err(unsupported(&tag)),
    };
    if block.len() != ulen {
        return Err(Error::corrupted(format!(
            "block decompressed to {} bytes, header declares {}",
            block.len(),
            ulen
        )));
    }

    Ok((block, HEADER_SIZE + csize))
}

fn unsupported(tag: &[u8; 2]) -> Error {
    Error::UnsupportedCodec {
        tag: String::from_utf8_lossy(tag).into_owned(),
    }
}

fn zlib_compress(src: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::new(level.min(9)));
    encoder.write_all(src)?;
    Ok(encoder.finish()?)
}

fn zlib_decompress(src: &[u8], ulen: usize) -> Result<Vec<u8>> {
    read_bounded(flate2::read::ZlibDecoder::new(src), ulen, "zlib")
}

/// read_bounded inflates at most ulen bytes, failing when the stream holds more.
fn read_bounded(r: impl Read, ulen: usize, codec: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(ulen);
    r.take(ulen as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| Error::corrupted(format!("{}: {}", codec, e)))?;
    if out.len() > ulen {
        return Err(Error::corrupted(format!(
            "{} block inflates past its declared {} bytes",
            codec, ulen
        )));
    }
    Ok(out)
}

fn lz4_compress(src: &[u8]) -> Vec<u8> {
    let data = lz4_flex::block::compress(src);
    let mut body = Vec::with_capacity(LZ4_CHECKSUM_SIZE + data.len());
    body.extend_from_slice(&xxhash_rust::xxh64::xxh64(&data, 0).to_be_bytes());
    body.extend_from_slice(&data);
    body
}

fn lz4_decompress(src: &[u8], ulen: usize) -> Result<Vec<u8>> {
    if src.len() < LZ4_CHECKSUM_SIZE {
        return Err(Error::corrupted("lz4 block shorter than its checksum"));
    }
    let (sum, data) = src.split_at(LZ4_CHECKSUM_SIZE);
    let mut want = [0_u8; LZ4_CHECKSUM_SIZE];
    want.copy_from_slice(sum);
    let got = xxhash_rust::xxh64::xxh64(data, 0);
    if got != u64::from_be_bytes(want) {
        return Err(Error::corrupted(format!(
            "lz4 checksum mismatch: got {:#018x}, want {:#018x}",
            got,
            u64::from_be_bytes(want)
        )));
    }
    lz4_flex::block::decompress(data, ulen).map_err(|e| Error::corrupted(format!("lz4: {}", e)))
}

fn zstd_compress(src: &[u8], level: u32) -> Result<Vec<u8>> {
    Ok(zstd::encode_all(src, level.min(22) as i32)?)
}

fn zstd_decompress(src: &[u8], ulen: usize) -> Result<Vec<u8>> {
    let decoder = zstd::stream::read::Decoder::with_buffer(src)
        .map_err(|e| Error::corrupted(format!("zstd: {}", e)))?;
    read_bounded(decoder, ulen, "zstd")
}

#[cfg(test)]
mod tests {
    use quickcheck::{quickcheck, TestResult};
    use rand::{Rng, SeedableRng};

    use crate::compress::{
        compress, decompress, decompress_block, Algorithm, Compression, HEADER_SIZE,
    };
    use crate::error::Error;

    fn codecs() -> Vec<Compression> {
        vec![
            Compression::new(Algorithm::Zlib, 1),
            Compression::new(Algorithm::Zlib, 9),
            Compression::new(Algorithm::Lz4, 4),
            Compression::new(Algorithm::Zstd, 5),
        ]
    }

    fn compressible(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 7) as u8).collect()
    }

    #[test]
    fn test_roundtrip() {
        let src = compressible(10_000);
        for c in codecs() {
            let dst = compress(&src, c).unwrap();
            assert!(dst.len() < src.len(), "{} did not shrink", c);
            assert_eq!(decompress(&dst, src.len()).unwrap(), src, "{}", c);
        }
    }

    #[test]
    fn test_roundtrip_quickcheck() {
        fn prop(data: Vec<u8>) -> TestResult {
            for c in codecs() {
                let dst = match compress(&data, c) {
                    Ok(dst) => dst,
                    Err(_) => return TestResult::failed(),
                };
                match decompress(&dst, data.len()) {
                    Ok(out) if out == data => {}
                    _ => return TestResult::failed(),
                }
            }
            TestResult::passed()
        }
        quickcheck(prop as fn(Vec<u8>) -> TestResult);
    }

    #[test]
    fn test_incompressible_stored_raw() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let src: Vec<u8> = (0..512).map(|_| rng.gen()).collect();
        let dst = compress(&src, Compression::default()).unwrap();
        assert_eq!(dst, src);
        assert_eq!(decompress(&dst, src.len()).unwrap(), src);

        assert_eq!(compress(&src, Compression::none()).unwrap(), src);
    }

    #[test]
    fn test_header_layout() {
        let src = compressible(1000);
        let dst = compress(&src, Compression::new(Algorithm::Zlib, 6)).unwrap();
        assert_eq!(&dst[..3], b"ZL\x08");
        assert_eq!(&dst[6..9], &[0xe8, 0x03, 0x00]);

        let csize = dst[3] as usize | (dst[4] as usize) << 8 | (dst[5] as usize) << 16;
        assert_eq!(csize + HEADER_SIZE, dst.len());

        let dst = compress(&src, Compression::new(Algorithm::Lz4, 1)).unwrap();
        assert_eq!(&dst[..3], b"L4\x01");
    }

    #[test]
    fn test_multi_block() {
        let src = compressible(super::MAX_BLOCK_SIZE + 1000);
        let dst = compress(&src, Compression::new(Algorithm::Zstd, 1)).unwrap();
        let (first, n) = decompress_block(&dst).unwrap();
        assert_eq!(first.len(), super::MAX_BLOCK_SIZE);
        let (second, m) = decompress_block(&dst[n..]).unwrap();
        assert_eq!(second.len(), 1000);
        assert_eq!(n + m, dst.len());
        assert_eq!(decompress(&dst, src.len()).unwrap(), src);
    }

    #[test]
    fn test_corrupted_blocks() {
        let src = compressible(4096);
        let dst = compress(&src, Compression::new(Algorithm::Zlib, 1)).unwrap();

        match decompress(&dst[..5], src.len()) {
            Err(Error::TruncatedHeader(5)) => {}
            r => panic!("unexpected {:?}", r.map(|v| v.len())),
        }

        // a compressed size pointing past the block.
        let mut bad = dst.clone();
        bad[5] = 0x7f;
        assert!(matches!(decompress(&bad, src.len()), Err(Error::Corrupted(_))));

        // an uncompressed size that disagrees with the data.
        let mut bad = dst.clone();
        bad[6] = bad[6].wrapping_add(1);
        assert!(matches!(decompress(&bad, src.len()), Err(Error::Corrupted(_))));

        // declared total length differs from the block contents.
        assert!(decompress(&dst, src.len() + 1).is_err());

        let mut bad = dst.clone();
        bad[0] = b'Q';
        match decompress(&bad, src.len()) {
            Err(Error::UnsupportedCodec { tag }) => assert_eq!(tag, "QL"),
            r => panic!("unexpected {:?}", r.map(|v| v.len())),
        }

        let mut bad = dst;
        bad[..2].copy_from_slice(b"XZ");
        assert!(matches!(
            decompress(&bad, src.len()),
            Err(Error::UnsupportedCodec { .. })
        ));
    }

    #[test]
    fn test_inflate_past_declared_size() {
        let src = vec![0_u8; 1 << 20];
        for c in [
            Compression::new(Algorithm::Zlib, 6),
            Compression::new(Algorithm::Zstd, 3),
        ] {
            let mut dst = compress(&src, c).unwrap();
            dst[6..9].copy_from_slice(&[16, 0, 0]);
            match decompress_block(&dst) {
                Err(Error::Corrupted(msg)) => assert!(msg.contains("inflates past"), "{}: {}", c, msg),
                r => panic!("{}: unexpected {:?}", c, r.map(|(v, _)| v.len())),
            }
            assert!(matches!(decompress(&dst, 16), Err(Error::Corrupted(_))));
        }
    }

    #[test]
    fn test_lz4_checksum() {
        let src = compressible(4096);
        let mut dst = compress(&src, Compression::new(Algorithm::Lz4, 1)).unwrap();
        let last = dst.len() - 1;
        dst[last] ^= 0xff;
        let err = decompress(&dst, src.len()).unwrap_err();
        assert!(err.to_string().contains("checksum"), "{}", err);
    }

    #[test]
    fn test_settings() {
        let c = Compression::new(Algorithm::Lz4, 4);
        assert_eq!(c.settings(), 404);
        assert_eq!(Compression::from_settings(404).unwrap(), c);
        assert_eq!(Compression::from_settings(1).unwrap(), Compression::default());
        assert_eq!(Compression::none().settings(), 0);
        assert!(Compression::from_settings(901).is_err());
    }
}
