//! Per-open-file buffered writes.
//!
//! An [`OpenedFile`] snapshots the file manifest at open time and records
//! every mutation as a command: `Write`, `Truncate`, or `Marker` (a sync's
//! in-flight cut). Nothing touches storage until the engine asks for a
//! flush map (RAM → dirty blocks) or a sync map (all layers, block-aligned,
//! for upload).
//!
//! Read resolution layers a byte through, highest wins:
//! in-RAM writes > dirty blocks > clean blocks. The buffer algebra gives
//! this for free from insertion order.
//!
//! Truncate-to-larger zero-fills: the logical size grows and unwritten
//! bytes read as zeros.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use saltfs_buffer::{
    merge_with_limits, merge_with_limits_and_alignment, Buffer, UncontiguousSpace,
};
use saltfs_core::{BlockAccess, DirtyBlockAccess, LocalFileManifest, Timestamp};

/// What a resolved slice points at.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Bytes staged in RAM by a write command.
    Ram(Bytes),
    /// A locally persisted, not-yet-uploaded chunk.
    Dirty(DirtyBlockAccess),
    /// A synced block (local clean cache or remote).
    Clean(BlockAccess),
}

#[derive(Debug, Clone)]
enum Cmd {
    Write {
        offset: u64,
        data: Bytes,
        ts: Timestamp,
    },
    Truncate {
        length: u64,
        ts: Timestamp,
    },
    Marker(u64),
}

/// Opaque token delimiting a sync's cut in the command log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker(u64);

#[derive(Debug)]
pub struct OpenedFile {
    manifest: LocalFileManifest,
    size: u64,
    cmds: Vec<Cmd>,
    next_marker: u64,
}

impl OpenedFile {
    pub fn new(manifest: LocalFileManifest) -> Self {
        let size = manifest.size;
        Self {
            manifest,
            size,
            cmds: Vec::new(),
            next_marker: 0,
        }
    }

    /// Logical size, all staged commands applied.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn manifest(&self) -> &LocalFileManifest {
        &self.manifest
    }

    /// Any staged write or truncate (markers don't count)?
    pub fn has_pending_data(&self) -> bool {
        self.cmds
            .iter()
            .any(|c| matches!(c, Cmd::Write { .. } | Cmd::Truncate { .. }))
    }

    /// Timestamp of the newest staged mutation.
    pub fn latest_ts(&self) -> Option<Timestamp> {
        self.cmds
            .iter()
            .filter_map(|c| match c {
                Cmd::Write { ts, .. } | Cmd::Truncate { ts, .. } => Some(*ts),
                Cmd::Marker(_) => None,
            })
            .max()
    }

    /// Stage a write. `None` (or an offset past the end) appends at `size`.
    pub fn write(&mut self, data: Bytes, offset: Option<u64>, ts: Timestamp) {
        let offset = match offset {
            Some(o) if o <= self.size => o,
            _ => self.size,
        };
        self.size = self.size.max(offset + data.len() as u64);
        self.cmds.push(Cmd::Write { offset, data, ts });
    }

    /// Stage a truncate. Shrinks drop bytes; growth zero-fills.
    pub fn truncate(&mut self, length: u64, ts: Timestamp) {
        self.cmds.push(Cmd::Truncate { length, ts });
        self.size = length;
    }

    /// Resolution map for `[offset, offset + min(size, self.size - offset))`.
    /// Holes between spaces read as zeros.
    pub fn read_map(&self, size: u64, offset: u64) -> UncontiguousSpace<Payload> {
        let end = if offset >= self.size {
            offset
        } else {
            offset + size.min(self.size - offset)
        };
        merge_with_limits(self.layers(), offset, end)
    }

    /// Consolidate all in-RAM writes into minimal non-overlapping buffers to
    /// persist as dirty blocks. Pure: same commands, same buffers.
    pub fn flush_map(&self) -> (u64, Vec<Buffer<Bytes>>) {
        let (ram, _) = self.replay();
        let merged = merge_with_limits(ram, 0, self.size);
        let mut buffers = Vec::with_capacity(merged.spaces.len());
        for cs in &merged.spaces {
            let mut data = BytesMut::with_capacity(cs.size() as usize);
            for slice in &cs.slices {
                let Payload::Ram(bytes) = &slice.buffer.data else {
                    unreachable!("flush map only sees RAM buffers")
                };
                let off = slice.buffer_offset() as usize;
                data.extend_from_slice(&bytes[off..off + slice.size() as usize]);
            }
            buffers.push(Buffer::new(cs.start, cs.end, data.freeze()));
        }
        (self.size, buffers)
    }

    /// Lowest truncate point among the staged commands (the open size when
    /// none was staged). Persisted layers past it must not survive a
    /// flush, even when a later truncate regrew the file over the cut.
    pub fn truncate_cap(&self) -> u64 {
        self.replay().1
    }

    /// All layers merged and block-aligned over `[0, size)`, ready for the
    /// synchronizer to turn into an upload plan.
    pub fn sync_map(&self, block_size: u64) -> UncontiguousSpace<Payload> {
        merge_with_limits_and_alignment(self.layers(), 0, self.size, block_size)
    }

    /// Push a sync cut into the command log.
    pub fn create_marker(&mut self) -> Marker {
        self.next_marker += 1;
        let marker = Marker(self.next_marker);
        self.cmds.push(Cmd::Marker(marker.0));
        marker
    }

    /// Drop every command up to and including `marker`, iff it is still in
    /// the log. Returns false (log untouched) when another sync superseded
    /// it or a flush consumed the log.
    pub fn drop_until_marker(&mut self, marker: Marker) -> bool {
        match self
            .cmds
            .iter()
            .position(|c| matches!(c, Cmd::Marker(m) if *m == marker.0))
        {
            Some(pos) => {
                self.cmds.drain(..=pos);
                true
            }
            None => false,
        }
    }

    /// Clear staged commands after a successful flush.
    pub fn clear_commands(&mut self) {
        self.cmds.clear();
    }

    /// Install a new base manifest (post-flush or post-sync fast-forward)
    /// and recompute the logical size from the surviving commands.
    pub fn rebase(&mut self, manifest: LocalFileManifest) {
        let mut size = manifest.size;
        for cmd in &self.cmds {
            match cmd {
                Cmd::Write { offset, data, .. } => {
                    size = size.max(offset + data.len() as u64);
                }
                Cmd::Truncate { length, .. } => size = *length,
                Cmd::Marker(_) => {}
            }
        }
        self.manifest = manifest;
        self.size = size;
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Replay the command log into the surviving RAM buffers plus the cap
    /// truncates put on the persisted layers (blocks and dirty blocks).
    fn replay(&self) -> (Vec<Arc<Buffer<Payload>>>, u64) {
        let mut ram: Vec<Arc<Buffer<Payload>>> = Vec::new();
        let mut base_cap = self.manifest.size;
        for cmd in &self.cmds {
            match cmd {
                Cmd::Write { offset, data, .. } => {
                    ram.push(Arc::new(Buffer::new(
                        *offset,
                        offset + data.len() as u64,
                        Payload::Ram(data.clone()),
                    )));
                }
                Cmd::Truncate { length, .. } => {
                    let l = *length;
                    base_cap = base_cap.min(l);
                    ram = ram
                        .into_iter()
                        .filter_map(|b| {
                            if b.start >= l {
                                return None;
                            }
                            if b.end <= l {
                                return Some(b);
                            }
                            let Payload::Ram(data) = &b.data else {
                                unreachable!()
                            };
                            Some(Arc::new(Buffer::new(
                                b.start,
                                l,
                                Payload::Ram(data.slice(0..(l - b.start) as usize)),
                            )))
                        })
                        .collect();
                }
                Cmd::Marker(_) => {}
            }
        }
        (ram, base_cap)
    }

    /// Precedence-ordered buffers: clean blocks, then dirty blocks, then RAM
    /// writes in submission order. Later insertion wins in the algebra, so
    /// this encodes RAM > dirty > clean.
    fn layers(&self) -> Vec<Arc<Buffer<Payload>>> {
        let (ram, cap) = self.replay();
        let mut layers = Vec::with_capacity(
            self.manifest.blocks.len() + self.manifest.dirty_blocks.len() + ram.len(),
        );
        for block in &self.manifest.blocks {
            let end = block.end().min(cap);
            if end > block.offset {
                layers.push(Arc::new(Buffer::new(
                    block.offset,
                    end,
                    Payload::Clean(block.clone()),
                )));
            }
        }
        for dirty in &self.manifest.dirty_blocks {
            let end = dirty.end().min(cap);
            if end > dirty.offset {
                layers.push(Arc::new(Buffer::new(
                    dirty.offset,
                    end,
                    Payload::Dirty(dirty.clone()),
                )));
            }
        }
        layers.extend(ram);
        layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saltfs_crypto::SecretKey;
    use uuid::Uuid;

    fn empty_file() -> OpenedFile {
        OpenedFile::new(LocalFileManifest::new("alice@laptop", 1000))
    }

    /// Resolve a RAM-only view into bytes, zero-filling holes.
    fn read_bytes(file: &OpenedFile, size: u64, offset: u64) -> Vec<u8> {
        let map = file.read_map(size, offset);
        let mut out = vec![0u8; (map.end - map.start) as usize];
        for cs in &map.spaces {
            for slice in &cs.slices {
                let Payload::Ram(bytes) = &slice.buffer.data else {
                    panic!("test resolves RAM payloads only")
                };
                let src = slice.buffer_offset() as usize;
                let dst = (slice.start - map.start) as usize;
                let len = slice.size() as usize;
                out[dst..dst + len].copy_from_slice(&bytes[src..src + len]);
            }
        }
        out
    }

    #[test]
    fn overlapping_writes_collapse() {
        let mut file = empty_file();
        file.write(Bytes::from_static(b"AAA"), Some(0), 1);
        file.write(Bytes::from_static(b"BB"), Some(1), 2);

        assert_eq!(file.size(), 3);
        assert_eq!(read_bytes(&file, 10, 0), b"ABB");

        let (new_size, buffers) = file.flush_map();
        assert_eq!(new_size, 3);
        assert_eq!(buffers.len(), 1);
        assert_eq!((buffers[0].start, buffers[0].end), (0, 3));
        assert_eq!(&buffers[0].data[..], b"ABB");
    }

    #[test]
    fn append_semantics() {
        let mut file = empty_file();
        file.write(Bytes::from_static(b"ab"), None, 1);
        // Offset past the end appends at size, not at the requested offset
        file.write(Bytes::from_static(b"cd"), Some(100), 2);
        assert_eq!(file.size(), 4);
        assert_eq!(read_bytes(&file, 10, 0), b"abcd");
    }

    #[test]
    fn truncate_shrinks_then_zero_fills_growth() {
        let mut file = empty_file();
        file.write(Bytes::from_static(b"hello world"), Some(0), 1);
        file.truncate(5, 2);

        assert_eq!(file.size(), 5);
        assert_eq!(read_bytes(&file, 20, 0), b"hello");

        file.truncate(8, 3);
        assert_eq!(file.size(), 8);
        assert_eq!(read_bytes(&file, 20, 0), b"hello\0\0\0");
    }

    #[test]
    fn write_after_truncate_reuses_range() {
        let mut file = empty_file();
        file.write(Bytes::from_static(b"abcdef"), Some(0), 1);
        file.truncate(2, 2);
        file.write(Bytes::from_static(b"XY"), Some(1), 3);

        assert_eq!(file.size(), 3);
        assert_eq!(read_bytes(&file, 10, 0), b"aXY");
    }

    #[test]
    fn read_window_clamped_to_size() {
        let mut file = empty_file();
        file.write(Bytes::from_static(b"abcdef"), Some(0), 1);

        assert_eq!(read_bytes(&file, 3, 2), b"cde");
        assert_eq!(read_bytes(&file, 100, 4), b"ef");
        // Offset past the end yields an empty range
        let map = file.read_map(10, 99);
        assert!(map.is_empty());
        assert_eq!(map.start, map.end);
    }

    #[test]
    fn layer_precedence_ram_over_dirty_over_clean() {
        let mut manifest = LocalFileManifest::new("alice@laptop", 1000);
        manifest.size = 10;
        manifest.blocks.push(BlockAccess {
            id: Uuid::new_v4(),
            key: SecretKey::generate(),
            offset: 0,
            size: 10,
            digest: None,
        });
        manifest.dirty_blocks.push(DirtyBlockAccess::new(5, 5));

        let mut file = OpenedFile::new(manifest);
        file.write(Bytes::from_static(b"zz"), Some(8), 1);

        let map = file.read_map(10, 0);
        let kinds: Vec<&'static str> = map.spaces[0]
            .slices
            .iter()
            .map(|s| match s.buffer.data {
                Payload::Ram(_) => "ram",
                Payload::Dirty(_) => "dirty",
                Payload::Clean(_) => "clean",
            })
            .collect();
        assert_eq!(kinds, ["clean", "dirty", "ram"]);
        assert_eq!(map.spaces[0].slices[0].size(), 5); // [0,5) clean
        assert_eq!(map.spaces[0].slices[1].size(), 3); // [5,8) dirty
        assert_eq!(map.spaces[0].slices[2].size(), 2); // [8,10) ram
    }

    #[test]
    fn truncate_caps_persisted_layers() {
        let mut manifest = LocalFileManifest::new("alice@laptop", 1000);
        manifest.size = 10;
        manifest.blocks.push(BlockAccess {
            id: Uuid::new_v4(),
            key: SecretKey::generate(),
            offset: 0,
            size: 10,
            digest: None,
        });

        let mut file = OpenedFile::new(manifest);
        file.truncate(4, 1);
        file.truncate(10, 2);

        // Bytes [4,10) must not resurface from the clean block
        let map = file.read_map(10, 0);
        assert_eq!(map.spaces.len(), 1);
        assert_eq!((map.spaces[0].start, map.spaces[0].end), (0, 4));
    }

    #[test]
    fn flush_map_is_pure() {
        let mut file = empty_file();
        file.write(Bytes::from_static(b"xyz"), Some(0), 1);
        file.write(Bytes::from_static(b"q"), Some(1), 2);

        let (size_a, map_a) = file.flush_map();
        let (size_b, map_b) = file.flush_map();
        assert_eq!(size_a, size_b);
        assert_eq!(map_a.len(), map_b.len());
        for (a, b) in map_a.iter().zip(&map_b) {
            assert_eq!((a.start, a.end, &a.data), (b.start, b.end, &b.data));
        }
    }

    #[test]
    fn marker_cut_separates_writes() {
        let mut file = empty_file();
        file.write(Bytes::from_static(b"before"), Some(0), 1);
        let marker = file.create_marker();
        file.write(Bytes::from_static(b"after"), Some(6), 2);

        assert!(file.drop_until_marker(marker));
        let (_, buffers) = file.flush_map();
        assert_eq!(buffers.len(), 1);
        assert_eq!(&buffers[0].data[..], b"after");
        assert_eq!((buffers[0].start, buffers[0].end), (6, 11));
    }

    #[test]
    fn stale_marker_leaves_log_unchanged() {
        let mut file = empty_file();
        file.write(Bytes::from_static(b"data"), Some(0), 1);
        let marker = file.create_marker();
        file.clear_commands(); // a flush consumed the log

        assert!(!file.drop_until_marker(marker));
        assert!(!file.has_pending_data());
    }

    #[test]
    fn truncate_cap_is_the_session_minimum() {
        let mut manifest = LocalFileManifest::new("alice@laptop", 1000);
        manifest.size = 10;
        let mut file = OpenedFile::new(manifest);
        assert_eq!(file.truncate_cap(), 10);

        file.truncate(4, 1);
        file.truncate(8, 2);
        assert_eq!(file.truncate_cap(), 4);
        // Writes never raise the cap back
        file.write(Bytes::from_static(b"x"), Some(0), 3);
        assert_eq!(file.truncate_cap(), 4);
    }

    #[test]
    fn sync_map_is_block_aligned() {
        let mut file = empty_file();
        // Extend first so the write lands at [3,6) instead of appending
        file.truncate(6, 1);
        file.write(Bytes::from_static(b"XYZ"), Some(3), 2);

        let map = file.sync_map(4);
        // size 6 → aligned limits [0, 8); data only covers [3,6)
        assert_eq!((map.start, map.end), (0, 8));
        assert_eq!(map.spaces.len(), 1);
        assert_eq!((map.spaces[0].start, map.spaces[0].end), (3, 6));
    }

    #[test]
    fn rebase_recomputes_size() {
        let mut file = empty_file();
        file.write(Bytes::from_static(b"abcd"), Some(0), 1);
        let marker = file.create_marker();
        file.write(Bytes::from_static(b"ef"), Some(4), 2);

        // Sync consumed everything up to the marker and installed a new base
        let mut base = LocalFileManifest::new("alice@laptop", 1000);
        base.size = 4;
        base.base_version = 1;
        assert!(file.drop_until_marker(marker));
        file.rebase(base);

        assert_eq!(file.size(), 6);
        assert!(file.has_pending_data());
    }
}
