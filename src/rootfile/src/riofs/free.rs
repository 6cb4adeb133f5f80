use crate::error::{Error, Result};
use crate::rbytes::{RBuffer, WBuffer};

const FREE_VERSION: i16 = 1;
const BIG_FREE_VERSION: i16 = 1000;

/// Last byte of the open-ended segment past the end of the file.
pub const UNBOUNDED: i64 = 1 << 62;

/// Encoded length of one segment.
pub const SEGMENT_LEN: usize = 2 + 8 + 8;

/// FreeSegment is the inclusive byte range `[first, last]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSegment {
    pub first: i64,
    pub last: i64,
}

impl FreeSegment {
    pub fn len(&self) -> i64 {
        self.last - self.first + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 0
    }
}

/// FreeList tracks the unused byte ranges of a file, ordered by offset. The
/// last segment always starts at the end of the file and is unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeList {
    segments: Vec<FreeSegment>,
}

impl FreeList {
    pub fn new(end: i64) -> Self {
        Self {
            segments: vec![FreeSegment {
                first: end,
                last: UNBOUNDED,
            }],
        }
    }

    pub fn segments(&self) -> &[FreeSegment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// end is the offset past the last allocated byte.
    pub fn end(&self) -> i64 {
        self.segments.last().map(|s| s.first).unwrap_or(UNBOUNDED)
    }

    /// allocate reserves nbytes and returns their offset, reusing the first gap
    /// that fits exactly or leaves room for a gap marker, else appending at the
    /// end. When a gap is split, the remaining range is returned as well.
    pub fn allocate(&mut self, nbytes: i64) -> (i64, Option<FreeSegment>) {
        let last = self.segments.len() - 1;
        let mut pick = last;
        for (i, s) in self.segments.iter().enumerate() {
            if i != last && s.len() == nbytes {
                pick = i;
                break;
            }
            if i != last && s.len() >= nbytes + 4 && pick == last {
                pick = i;
            }
        }

        let seek = self.segments[pick].first;
        if pick != last && self.segments[pick].len() == nbytes {
            self.segments.remove(pick);
            return (seek, None);
        }

        self.segments[pick].first += nbytes;
        let leftover = if pick == last {
            None
        } else {
            Some(self.segments[pick])
        };
        (seek, leftover)
    }

    /// free returns `[first, last]` to the list, merging it with adjacent
    /// segments, and returns the merged segment.
    pub fn free(&mut self, first: i64, last: i64) -> FreeSegment {
        let idx = self.segments.partition_point(|s| s.first < first);
        self.segments.insert(idx, FreeSegment { first, last });

        // merge with the following segments.
        while idx + 1 < self.segments.len() && self.segments[idx].last + 1 >= self.segments[idx + 1].first {
            let next = self.segments.remove(idx + 1);
            self.segments[idx].last = self.segments[idx].last.max(next.last);
        }

        // merge with the preceding segment.
        if idx > 0 && self.segments[idx - 1].last + 1 >= self.segments[idx].first {
            let cur = self.segments.remove(idx);
            self.segments[idx - 1].last = self.segments[idx - 1].last.max(cur.last);
            return self.segments[idx - 1];
        }
        self.segments[idx]
    }

    pub fn marshal(&self, w: &mut WBuffer) {
        for s in &self.segments {
            w.write_i16(FREE_VERSION + BIG_FREE_VERSION);
            w.write_i64(s.first);
            w.write_i64(s.last);
        }
    }

    pub fn unmarshal(r: &mut RBuffer, n: usize) -> Result<Self> {
        let mut segments = Vec::with_capacity(n.min(r.remaining() / SEGMENT_LEN));
        for _ in 0..n {
            let version = r.read_i16()?;
            let (first, last) = if version > BIG_FREE_VERSION {
                (r.read_i64()?, r.read_i64()?)
            } else {
                (r.read_i32()? as i64, r.read_i32()? as i64)
            };
            segments.push(FreeSegment { first, last });
        }

        let sorted = segments.windows(2).all(|w| w[0].last < w[1].first);
        if segments.is_empty() || !sorted {
            return Err(Error::corrupted(format!(
                "invalid free segment list of {} segments",
                segments.len()
            )));
        }
        Ok(Self { segments })
    }
}

#[cfg(test)]
mod tests {
    use crate::rbytes::{RBuffer, WBuffer};
    use crate::riofs::free::{FreeList, FreeSegment, UNBOUNDED};

    #[test]
    fn test_append() {
        let mut free = FreeList::new(100);
        assert_eq!(free.allocate(50), (100, None));
        assert_eq!(free.allocate(10), (150, None));
        assert_eq!(free.end(), 160);
        assert_eq!(free.len(), 1);
    }

    #[test]
    fn test_reuse_and_merge() {
        let mut free = FreeList::new(100);
        let a = free.allocate(40).0;
        let b = free.allocate(40).0;
        let c = free.allocate(40).0;
        assert_eq!((a, b, c), (100, 140, 180));

        free.free(b, b + 39);
        assert_eq!(free.len(), 2);

        // exact fit.
        assert_eq!(free.allocate(40), (140, None));
        assert_eq!(free.len(), 1);

        free.free(a, a + 39);
        free.free(b, b + 39);
        assert_eq!(
            free.segments()[0],
            FreeSegment {
                first: 100,
                last: 179
            }
        );

        // a split leaves the rest of the gap, which must hold a marker.
        let (seek, left) = free.allocate(30);
        assert_eq!(seek, 100);
        assert_eq!(left, Some(FreeSegment { first: 130, last: 179 }));

        // too small to split with room for a marker: goes to the end.
        let (seek, _) = free.allocate(48);
        assert_eq!(seek, 220);

        free.free(180, 219);
        assert_eq!(free.segments()[0], FreeSegment { first: 130, last: 219 });

        // freeing the last key merges everything into the open segment.
        free.free(220, 267);
        assert_eq!(free.len(), 1);
        assert_eq!(free.end(), 130);
        assert_eq!(free.segments()[0].last, UNBOUNDED);
    }

    #[test]
    fn test_marshal() {
        let mut free = FreeList::new(100);
        free.allocate(100);
        free.allocate(100);
        free.free(100, 149);

        let mut w = WBuffer::new();
        free.marshal(&mut w);
        let data = w.into_vec();
        assert_eq!(data.len(), 2 * super::SEGMENT_LEN);

        let got = FreeList::unmarshal(&mut RBuffer::new(&data), 2).unwrap();
        assert_eq!(got, free);
        assert!(FreeList::unmarshal(&mut RBuffer::new(&data), 0).is_err());
    }
}
