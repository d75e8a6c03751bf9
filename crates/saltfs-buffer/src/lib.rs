//! saltfs-buffer: merge an unordered pile of possibly-overlapping write
//! buffers into a disjoint, ordered set of contiguous spaces.
//!
//! The algebra is pure and generic over the buffer payload: the engine mixes
//! in-RAM writes, dirty blocks and clean blocks in a single pass and lets
//! insertion order decide precedence: for any overlapping byte, the
//! later-inserted buffer wins.
//!
//! ```text
//! insert [0,3)="AAA"   spaces: [0,3)→AAA
//! insert [1,3)="BB"    spaces: [0,1)→A, [1,3)→BB        (one contiguous space)
//! insert [7,9)="CC"    spaces: [0,3), [7,9)             (two spaces, hole at 3..7)
//! ```

use std::sync::Arc;

/// One write buffer: payload `data` covers the absolute range `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer<T> {
    pub start: u64,
    pub end: u64,
    pub data: T,
}

impl<T> Buffer<T> {
    pub fn new(start: u64, end: u64, data: T) -> Self {
        debug_assert!(end >= start);
        Self { start, end, data }
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// A surviving window into one buffer: the absolute range `[start, end)`
/// still visible after later buffers trimmed the rest.
#[derive(Debug)]
pub struct BufferSlice<T> {
    pub buffer: Arc<Buffer<T>>,
    pub start: u64,
    pub end: u64,
}

impl<T> BufferSlice<T> {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Offset of this slice within its buffer's payload.
    pub fn buffer_offset(&self) -> u64 {
        self.start - self.buffer.start
    }

    /// True when the slice exposes its whole buffer untrimmed.
    pub fn covers_whole_buffer(&self) -> bool {
        self.start == self.buffer.start && self.end == self.buffer.end
    }
}

impl<T> Clone for BufferSlice<T> {
    fn clone(&self) -> Self {
        Self {
            buffer: Arc::clone(&self.buffer),
            start: self.start,
            end: self.end,
        }
    }
}

/// A hole-free run of slices spanning exactly `[start, end)`.
#[derive(Debug)]
pub struct ContiguousSpace<T> {
    pub start: u64,
    pub end: u64,
    /// Sorted by `start`; tiles `[start, end)` with no gap or overlap.
    pub slices: Vec<BufferSlice<T>>,
}

impl<T> ContiguousSpace<T> {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

impl<T> Clone for ContiguousSpace<T> {
    fn clone(&self) -> Self {
        Self {
            start: self.start,
            end: self.end,
            slices: self.slices.clone(),
        }
    }
}

/// Ordered, pairwise-disjoint contiguous spaces.
#[derive(Debug)]
pub struct UncontiguousSpace<T> {
    pub start: u64,
    pub end: u64,
    pub spaces: Vec<ContiguousSpace<T>>,
}

impl<T> UncontiguousSpace<T> {
    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }
}

impl<T> Clone for UncontiguousSpace<T> {
    fn clone(&self) -> Self {
        Self {
            start: self.start,
            end: self.end,
            spaces: self.spaces.clone(),
        }
    }
}

/// Merge buffers in insertion order; later buffers win on overlap.
/// Zero-size buffers are dropped.
pub fn merge<T>(buffers: impl IntoIterator<Item = Arc<Buffer<T>>>) -> UncontiguousSpace<T> {
    let mut spaces: Vec<ContiguousSpace<T>> = Vec::new();
    for buffer in buffers {
        if buffer.end <= buffer.start {
            continue;
        }
        insert_buffer(&mut spaces, buffer);
    }
    let (start, end) = match (spaces.first(), spaces.last()) {
        (Some(first), Some(last)) => (first.start, last.end),
        _ => (0, 0),
    };
    UncontiguousSpace { start, end, spaces }
}

/// Merge, then discard everything outside `[start, end)`.
pub fn merge_with_limits<T>(
    buffers: impl IntoIterator<Item = Arc<Buffer<T>>>,
    start: u64,
    end: u64,
) -> UncontiguousSpace<T> {
    let merged = merge(buffers);
    let mut spaces = Vec::new();
    for cs in merged.spaces {
        if cs.end <= start || cs.start >= end {
            continue;
        }
        let s = cs.start.max(start);
        let e = cs.end.min(end);
        let mut slices = Vec::with_capacity(cs.slices.len());
        for slice in cs.slices {
            if slice.end <= s || slice.start >= e {
                continue;
            }
            slices.push(BufferSlice {
                buffer: slice.buffer,
                start: slice.start.max(s),
                end: slice.end.min(e),
            });
        }
        spaces.push(ContiguousSpace {
            start: s,
            end: e,
            slices,
        });
    }
    // An empty result collapses to the degenerate range [start, start)
    let end = if spaces.is_empty() { start } else { end };
    UncontiguousSpace { start, end, spaces }
}

/// Merge with limits first aligned outward to `block_size` multiples:
/// `start` rounded down, `end` rounded up.
pub fn merge_with_limits_and_alignment<T>(
    buffers: impl IntoIterator<Item = Arc<Buffer<T>>>,
    start: u64,
    end: u64,
    block_size: u64,
) -> UncontiguousSpace<T> {
    debug_assert!(block_size > 0);
    let aligned_start = start - start % block_size;
    let aligned_end = end.div_ceil(block_size) * block_size;
    merge_with_limits(buffers, aligned_start, aligned_end)
}

fn insert_buffer<T>(spaces: &mut Vec<ContiguousSpace<T>>, buffer: Arc<Buffer<T>>) {
    // Spaces overlapping or touching the new buffer collapse into one.
    let lo = spaces.partition_point(|cs| cs.end < buffer.start);
    let hi = spaces.partition_point(|cs| cs.start <= buffer.end);

    let mut slices: Vec<BufferSlice<T>> = Vec::new();
    for cs in spaces.drain(lo..hi) {
        for slice in cs.slices {
            if slice.end <= buffer.start || slice.start >= buffer.end {
                slices.push(slice);
                continue;
            }
            // Trim the older slice on the overlap; keep what sticks out.
            if slice.start < buffer.start {
                slices.push(BufferSlice {
                    buffer: Arc::clone(&slice.buffer),
                    start: slice.start,
                    end: buffer.start,
                });
            }
            if slice.end > buffer.end {
                slices.push(BufferSlice {
                    buffer: Arc::clone(&slice.buffer),
                    start: buffer.end,
                    end: slice.end,
                });
            }
        }
    }
    slices.push(BufferSlice {
        buffer: Arc::clone(&buffer),
        start: buffer.start,
        end: buffer.end,
    });
    slices.sort_by_key(|s| s.start);

    let start = slices.first().map(|s| s.start).unwrap_or(buffer.start);
    let end = slices.iter().map(|s| s.end).max().unwrap_or(buffer.end);
    spaces.insert(lo, ContiguousSpace { start, end, slices });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(start: u64, data: &[u8]) -> Arc<Buffer<Vec<u8>>> {
        Arc::new(Buffer::new(start, start + data.len() as u64, data.to_vec()))
    }

    /// Resolve a merged view back into bytes (holes are not allowed here).
    fn resolve(space: &UncontiguousSpace<Vec<u8>>) -> Vec<u8> {
        let mut out = Vec::new();
        for cs in &space.spaces {
            for slice in &cs.slices {
                let off = slice.buffer_offset() as usize;
                out.extend_from_slice(&slice.buffer.data[off..off + slice.size() as usize]);
            }
        }
        out
    }

    #[test]
    fn empty_input() {
        let merged = merge(Vec::<Arc<Buffer<Vec<u8>>>>::new());
        assert!(merged.is_empty());
        assert_eq!((merged.start, merged.end), (0, 0));
    }

    #[test]
    fn zero_size_buffers_dropped() {
        let merged = merge(vec![Arc::new(Buffer::new(5, 5, Vec::<u8>::new()))]);
        assert!(merged.is_empty());
    }

    #[test]
    fn later_buffer_wins_on_overlap() {
        let merged = merge(vec![buf(0, b"AAA"), buf(1, b"BB")]);
        assert_eq!(merged.spaces.len(), 1);
        assert_eq!((merged.start, merged.end), (0, 3));
        assert_eq!(resolve(&merged), b"ABB");
    }

    #[test]
    fn disjoint_buffers_make_two_spaces() {
        let merged = merge(vec![buf(0, b"AA"), buf(5, b"BB")]);
        assert_eq!(merged.spaces.len(), 2);
        assert_eq!(merged.spaces[0].end, 2);
        assert_eq!(merged.spaces[1].start, 5);
    }

    #[test]
    fn touching_buffers_fuse_into_one_space() {
        let merged = merge(vec![buf(0, b"AA"), buf(2, b"BB")]);
        assert_eq!(merged.spaces.len(), 1);
        assert_eq!(resolve(&merged), b"AABB");
    }

    #[test]
    fn buffer_split_by_newer_middle_write() {
        let merged = merge(vec![buf(0, b"AAAAA"), buf(1, b"BBB")]);
        assert_eq!(merged.spaces.len(), 1);
        assert_eq!(resolve(&merged), b"ABBBA");
        // Old buffer survives as two trimmed slices around the new one
        assert_eq!(merged.spaces[0].slices.len(), 3);
    }

    #[test]
    fn bridge_buffer_fuses_spaces() {
        let merged = merge(vec![buf(0, b"AA"), buf(6, b"CC"), buf(2, b"BBBB")]);
        assert_eq!(merged.spaces.len(), 1);
        assert_eq!(resolve(&merged), b"AABBBBCC");
    }

    #[test]
    fn limits_trim_and_drop() {
        let merged = merge_with_limits(vec![buf(0, b"AAAA"), buf(10, b"BBBB")], 2, 11);
        assert_eq!((merged.start, merged.end), (2, 11));
        assert_eq!(merged.spaces.len(), 2);
        assert_eq!((merged.spaces[0].start, merged.spaces[0].end), (2, 4));
        assert_eq!((merged.spaces[1].start, merged.spaces[1].end), (10, 11));
        assert_eq!(resolve(&merged), b"AAB");
    }

    #[test]
    fn limits_on_empty_collapse_to_degenerate_range() {
        let merged = merge_with_limits(Vec::<Arc<Buffer<Vec<u8>>>>::new(), 7, 20);
        assert_eq!((merged.start, merged.end), (7, 7));
        assert!(merged.is_empty());
    }

    #[test]
    fn alignment_rounds_limits_outward() {
        let merged = merge_with_limits_and_alignment(vec![buf(3, b"XYZ")], 3, 6, 4);
        // [3,6) aligned to 4-byte blocks becomes [0,8)
        assert_eq!((merged.start, merged.end), (0, 8));
        assert_eq!(resolve(&merged), b"XYZ");
    }

    #[test]
    fn slice_bookkeeping() {
        let merged = merge(vec![buf(4, b"ABCD"), buf(6, b"X")]);
        let cs = &merged.spaces[0];
        // First slice: bytes [4,6) of the old buffer
        assert_eq!(cs.slices[0].buffer_offset(), 0);
        assert_eq!(cs.slices[0].size(), 2);
        assert!(!cs.slices[0].covers_whole_buffer());
        // Second slice: the newer one-byte buffer, untouched
        assert!(cs.slices[1].covers_whole_buffer());
    }

    mod proptest_suite {
        use super::*;
        use proptest::prelude::*;

        fn arb_buffers() -> impl Strategy<Value = Vec<(u64, Vec<u8>)>> {
            proptest::collection::vec(
                (0u64..200, proptest::collection::vec(any::<u8>(), 0..40)),
                0..12,
            )
        }

        /// Reference model: apply writes in order into a flat byte map.
        fn model(buffers: &[(u64, Vec<u8>)]) -> std::collections::BTreeMap<u64, u8> {
            let mut map = std::collections::BTreeMap::new();
            for (start, data) in buffers {
                for (i, b) in data.iter().enumerate() {
                    map.insert(start + i as u64, *b);
                }
            }
            map
        }

        proptest! {
            #[test]
            fn spaces_disjoint_sorted_within_limits(buffers in arb_buffers(), s in 0u64..100, len in 0u64..150) {
                let e = s + len;
                let merged = merge_with_limits(
                    buffers.iter().map(|(st, d)| buf(*st, d)),
                    s,
                    e,
                );
                let mut prev_end = None;
                for cs in &merged.spaces {
                    prop_assert!(cs.start < cs.end);
                    prop_assert!(cs.start >= s && cs.end <= e);
                    if let Some(p) = prev_end {
                        prop_assert!(cs.start > p, "spaces must be disjoint and sorted");
                    }
                    prev_end = Some(cs.end);
                }
            }

            #[test]
            fn slices_tile_their_space(buffers in arb_buffers()) {
                let merged = merge(buffers.iter().map(|(st, d)| buf(*st, d)));
                for cs in &merged.spaces {
                    let mut cursor = cs.start;
                    for slice in &cs.slices {
                        prop_assert_eq!(slice.start, cursor, "no hole or overlap inside a space");
                        prop_assert!(slice.size() > 0);
                        cursor = slice.end;
                    }
                    prop_assert_eq!(cursor, cs.end);
                }
            }

            #[test]
            fn later_wins_matches_model(buffers in arb_buffers()) {
                let merged = merge(buffers.iter().map(|(st, d)| buf(*st, d)));
                let expected = model(&buffers);

                let mut actual = std::collections::BTreeMap::new();
                for cs in &merged.spaces {
                    for slice in &cs.slices {
                        let off = slice.buffer_offset() as usize;
                        for i in 0..slice.size() as usize {
                            actual.insert(slice.start + i as u64, slice.buffer.data[off + i]);
                        }
                    }
                }
                prop_assert_eq!(actual, expected);
            }
        }
    }
}
