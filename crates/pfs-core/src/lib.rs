#![forbid(unsafe_code)]
//! The PicoFS volume.
//!
//! Ties the layers together: group metadata discovery at mount, the
//! volume-wide exclusion domain, inode record load/store, and the
//! name-space operations (lookup, link, unlink, rename, mkdir, rmdir,
//! symlink) built on the directory store and the block-mapping tree.
//!
//! Concurrency model: one `RwLock` scoped to the volume. Mutating
//! operations hold the write half for their full duration; lookups,
//! enumeration and statistics share the read half. There is no
//! finer-grained locking: the volumes this filesystem serves top out at
//! 64 MB.

use parking_lot::RwLock;
use pfs_alloc::GroupSet;
use pfs_block::{BlockBuf, BlockDevice, BufferCache, ByteBlockDevice, FileByteDevice};
use pfs_error::{PfsError, Result};
use pfs_itree::MapCtx;
use pfs_ondisk::{FileKind, GroupMeta, InodeRecord, ItableSlot, S_IFDIR, S_IFLNK};
use pfs_types::{
    group_count, BlockNo, GroupNo, InodeNo, ParseError, BLOCKS_PER_GROUP, BLOCK_SIZE,
    FIRST_ITABLE_BLOCK, GROUP0_META_BLOCK, MAX_LINK_COUNT, MAX_NAME_LEN, MAX_VOLUME_BLOCKS,
    MIN_BLOCKS_PER_GROUP, MIN_VOLUME_BLOCKS, ROOT_DIR_BLOCK, ROOT_INO, STATE_ERROR, STATE_VALID,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn corrupt_at(block: BlockNo, err: ParseError) -> PfsError {
    PfsError::Corruption {
        block: block.0,
        detail: err.to_string(),
    }
}

/// Mount-time options.
#[derive(Debug, Clone, Copy, Default)]
pub struct MountOptions {
    /// Synchronous mode: every metadata mutation is flushed to the device
    /// and waited on before the operation returns. Without it, dirty
    /// buffers stay in the cache until [`Volume::flush`].
    pub sync: bool,
}

/// Aggregate volume statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statfs {
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub free_inodes: u32,
    pub block_size: u32,
    pub max_name_len: u32,
}

/// Ownership carried onto new inodes. Stored verbatim, never interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Owner {
    pub uid: u16,
    pub gid: u16,
}

/// One directory entry as seen by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub ino: InodeNo,
    pub name: Vec<u8>,
    /// Byte offset of the record inside the directory; feeding it back as
    /// the cursor re-emits this entry and everything after it.
    pub offset: u32,
}

/// A batch of directory entries plus the cursor past the directory's end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirPage {
    pub entries: Vec<DirEntryInfo>,
    pub next_cursor: u32,
}

/// A located directory entry: where it lives and what it points at.
#[derive(Debug, Clone, Copy)]
struct FoundEntry {
    block: BlockNo,
    offset: usize,
    ino: InodeNo,
}

// ── Volume formatting ───────────────────────────────────────────────────────

/// Initialize a PicoFS volume on `dev` and return the formatted block
/// count.
///
/// Lays down every group's metadata block, the first inode-table block,
/// the root directory's data block and the root inode. A trailing device
/// fragment too small to be worth a group (fewer than 3 blocks) is left
/// outside the formatted size.
pub fn format<D: BlockDevice>(dev: &D) -> Result<u32> {
    let mut total = dev.block_count().min(MAX_VOLUME_BLOCKS);
    if total < MIN_VOLUME_BLOCKS {
        return Err(PfsError::Format(format!(
            "device too small: {total} blocks, need at least {MIN_VOLUME_BLOCKS}"
        )));
    }
    let fragment = total % BLOCKS_PER_GROUP;
    if fragment > 0 && fragment < MIN_BLOCKS_PER_GROUP {
        total -= fragment;
    }

    let groups = group_count(total);
    let mut block = vec![0_u8; BLOCK_SIZE as usize];
    for g in 0..groups {
        let group = GroupNo(g as u16);
        let mut meta = GroupMeta {
            state: STATE_VALID,
            total_blocks: total as u16,
            ..GroupMeta::default()
        };
        if g == 0 {
            for bit in 0..=u32::from(ROOT_DIR_BLOCK) {
                pfs_alloc::bitmap_set(&mut meta.block_map, bit);
                pfs_alloc::bitmap_set(&mut meta.inode_map, bit);
            }
            meta.itable[0] = ItableSlot {
                block: FIRST_ITABLE_BLOCK,
                live: 4,
            };
        } else {
            pfs_alloc::bitmap_set(&mut meta.block_map, 0);
            pfs_alloc::bitmap_set(&mut meta.inode_map, 0);
        }
        meta.encode_into(&mut block)
            .map_err(|e| corrupt_at(group.meta_block(), e))?;
        dev.write_block(group.meta_block(), &block)?;
    }

    // Root directory data: "." and ".." both point at the root.
    block.fill(0);
    pfs_dir::init_block(&mut block, ROOT_INO, ROOT_INO);
    dev.write_block(BlockNo(ROOT_DIR_BLOCK), &block)?;

    // Root inode, record 3 of the first inode-table block.
    block.fill(0);
    let root = InodeRecord {
        mode: S_IFDIR | 0o755,
        links: 2,
        time: unix_now(),
        size: BLOCK_SIZE,
        blocks: (BLOCK_SIZE / 512) as u16,
        block: {
            let mut slots = [0_u16; pfs_types::N_BLOCK_SLOTS];
            slots[0] = ROOT_DIR_BLOCK;
            slots
        },
        ..InodeRecord::default()
    };
    let offset = InodeRecord::offset_in_table_block(InodeNo::ROOT.table_offset());
    root.encode_into(&mut block[offset..offset + InodeRecord::DISK_SIZE])
        .map_err(|e| corrupt_at(BlockNo(FIRST_ITABLE_BLOCK), e))?;
    dev.write_block(BlockNo(FIRST_ITABLE_BLOCK), &block)?;
    dev.sync()?;

    info!(total, groups, "formatted volume");
    Ok(total)
}

// ── Volume ──────────────────────────────────────────────────────────────────

/// A mounted volume.
#[derive(Debug)]
pub struct Volume<D: BlockDevice> {
    cache: BufferCache<D>,
    state: RwLock<GroupSet>,
    sync: bool,
}

impl Volume<ByteBlockDevice<FileByteDevice>> {
    /// Mount the image file at `path`.
    pub fn mount_path(path: impl AsRef<Path>, options: MountOptions) -> Result<Self> {
        let dev = ByteBlockDevice::new(FileByteDevice::open(path)?)?;
        Self::mount(dev, options)
    }
}

impl<D: BlockDevice> Volume<D> {
    /// Mount a device: read and validate every group's metadata, then
    /// sanity-check the root inode. Any failure releases whatever was
    /// loaded and aborts the mount.
    pub fn mount(dev: D, options: MountOptions) -> Result<Self> {
        let cache = BufferCache::new(dev);

        let buf = cache.read(BlockNo(GROUP0_META_BLOCK))?;
        let g0 = GroupMeta::parse(buf.as_slice())
            .map_err(|e| PfsError::Format(format!("group 0 metadata: {e}")))?;
        if g0.state == STATE_ERROR {
            warn!("mounting a volume with recorded errors");
        } else if g0.state != STATE_VALID {
            warn!(state = g0.state, "mounting an unchecked volume");
        }

        let total = u32::from(g0.total_blocks);
        if !(MIN_VOLUME_BLOCKS..=MAX_VOLUME_BLOCKS).contains(&total) {
            cache.release();
            return Err(PfsError::Format(format!(
                "total block count {total} outside {MIN_VOLUME_BLOCKS}..={MAX_VOLUME_BLOCKS}"
            )));
        }
        if total > cache.block_count() {
            cache.release();
            return Err(PfsError::Format(format!(
                "volume claims {total} blocks but the device has {}",
                cache.block_count()
            )));
        }

        let groups = group_count(total);
        let mut metas = vec![g0];
        for g in 1..groups {
            let group = GroupNo(g as u16);
            let meta = cache
                .read(group.meta_block())
                .and_then(|buf| {
                    GroupMeta::parse(buf.as_slice())
                        .map_err(|e| PfsError::Format(format!("group {group} metadata: {e}")))
                })
                .inspect_err(|_| cache.release())?;
            metas.push(meta);
        }
        debug!(total, groups, "loaded group metadata");

        let volume = Self {
            cache,
            state: RwLock::new(GroupSet::new(metas, total)?),
            sync: options.sync,
        };

        let root = {
            let groups = volume.state.read();
            volume.load_record(&groups, InodeNo::ROOT)
        }
        .inspect_err(|_| volume.cache.release())?;
        if !root.kind().is_dir() || root.blocks == 0 || root.size == 0 {
            volume.cache.release();
            return Err(PfsError::Format("root inode corrupted".to_owned()));
        }

        info!(total, groups, sync = options.sync, "mounted volume");
        Ok(volume)
    }

    /// Aggregate free-space accounting. The free-inode count is capped at
    /// the free-block count: an inode with no possible data block is
    /// meaningless here.
    pub fn statfs(&self) -> Statfs {
        let groups = self.state.read();
        let free_blocks = groups.free_block_count();
        let free_inodes = groups.free_inode_count().min(free_blocks);
        Statfs {
            total_blocks: groups.total_blocks(),
            free_blocks,
            free_inodes,
            block_size: BLOCK_SIZE,
            max_name_len: MAX_NAME_LEN as u32,
        }
    }

    /// Write every dirty group metadata block and all dirty cached blocks
    /// back to the device, waiting for completion.
    pub fn flush(&self) -> Result<()> {
        let mut groups = self.state.write();
        self.write_back_groups(&mut groups)?;
        self.cache.flush_all()
    }

    /// Flush and drop all cached state.
    pub fn unmount(self) -> Result<()> {
        self.flush()?;
        self.cache.release();
        Ok(())
    }

    // ── Group write-back ────────────────────────────────────────────────

    fn write_back_groups(&self, groups: &mut GroupSet) -> Result<()> {
        let mut block = vec![0_u8; BLOCK_SIZE as usize];
        for gno in groups.take_dirty() {
            let meta = groups.group(gno)?;
            meta.encode_into(&mut block)
                .map_err(|e| corrupt_at(gno.meta_block(), e))?;
            self.cache.write(gno.meta_block(), &block)?;
            self.cache.flush_block(gno.meta_block())?;
        }
        Ok(())
    }

    /// In synchronous mode, push dirty group metadata out immediately;
    /// otherwise leave it for `flush`.
    fn commit(&self, groups: &mut GroupSet) -> Result<()> {
        if self.sync {
            self.write_back_groups(groups)?;
        }
        Ok(())
    }

    fn flush_if_sync(&self, block: BlockNo) -> Result<()> {
        if self.sync {
            self.cache.flush_block(block)?;
        }
        Ok(())
    }

    // ── Inode records ───────────────────────────────────────────────────

    fn load_record(&self, groups: &GroupSet, ino: InodeNo) -> Result<InodeRecord> {
        if ino.0 < ROOT_INO {
            return Err(PfsError::Format(format!("inode {ino} is reserved")));
        }
        let table_block = groups.itable_block(ino)?;
        let buf = self.cache.read(table_block)?;
        let offset = InodeRecord::offset_in_table_block(ino.table_offset());
        InodeRecord::parse(&buf.as_slice()[offset..offset + InodeRecord::DISK_SIZE])
            .map_err(|e| corrupt_at(table_block, e))
    }

    fn store_record(
        &self,
        groups: &GroupSet,
        ino: InodeNo,
        record: &InodeRecord,
        sync: bool,
    ) -> Result<()> {
        if ino.0 < ROOT_INO {
            return Err(PfsError::Format(format!("inode {ino} is reserved")));
        }
        let table_block = groups.itable_block(ino)?;
        let mut buf = self.cache.read(table_block)?;
        let offset = InodeRecord::offset_in_table_block(ino.table_offset());
        record
            .encode_into(&mut buf.as_mut_slice()[offset..offset + InodeRecord::DISK_SIZE])
            .map_err(|e| corrupt_at(table_block, e))?;
        self.cache.write(table_block, buf.as_slice())?;
        if sync {
            self.cache.flush_block(table_block)?;
        }
        Ok(())
    }

    /// Read an inode record.
    pub fn read_inode(&self, ino: InodeNo) -> Result<InodeRecord> {
        let groups = self.state.read();
        self.load_record(&groups, ino)
    }

    /// Persist an inode record, synchronously when asked (or when the
    /// volume is mounted synchronous).
    pub fn write_inode(&self, ino: InodeNo, record: &InodeRecord, sync: bool) -> Result<()> {
        let groups = self.state.write();
        self.store_record(&groups, ino, record, sync || self.sync)
    }

    /// Reclaim an inode: truncate its data away, clear its record, free
    /// its number, and free the inode-table block once the last record in
    /// it is gone.
    pub fn delete_inode(&self, ino: InodeNo) -> Result<()> {
        let mut groups = self.state.write();
        let record = self.load_record(&groups, ino)?;
        self.delete_inode_locked(&mut groups, ino, record)?;
        self.commit(&mut groups)
    }

    fn delete_inode_locked(
        &self,
        groups: &mut GroupSet,
        ino: InodeNo,
        mut record: InodeRecord,
    ) -> Result<()> {
        debug!(ino = ino.0, "deleting inode");
        if record.kind().is_mappable() && (record.blocks > 0 || record.size > 0) {
            let mut ctx = MapCtx {
                cache: &self.cache,
                groups: &mut *groups,
            };
            pfs_itree::truncate(&mut ctx, ino, &mut record, 0)?;
        }
        // Clear the record while its table block is still attached.
        self.store_record(groups, ino, &InodeRecord::default(), self.sync)?;
        self.free_inode_and_table(groups, ino)
    }

    fn free_inode_and_table(&self, groups: &mut GroupSet, ino: InodeNo) -> Result<()> {
        let freed = groups.free_inode(ino)?;
        if freed.remaining == 0 {
            // Last record in the slot: the table block itself goes back to
            // the pool, and its cached frame must not be written back.
            self.cache.forget(freed.table_block);
            groups.free_blocks(freed.table_block, 1)?;
        }
        Ok(())
    }

    fn create_child(
        &self,
        groups: &mut GroupSet,
        parent: InodeNo,
        record: &InodeRecord,
    ) -> Result<InodeNo> {
        let new = groups.alloc_inode(parent)?;
        if new.fresh_table_block {
            // A table block fresh from the pool holds stale bytes.
            self.cache
                .write(new.table_block, &vec![0_u8; BLOCK_SIZE as usize])?;
            self.flush_if_sync(new.table_block)?;
        }
        self.store_record(groups, new.ino, record, self.sync)?;
        Ok(new.ino)
    }

    // ── Block mapping ───────────────────────────────────────────────────

    /// Map a logical block of `ino` to a physical block. With `allocate`
    /// set, missing levels of the indirection path are allocated (and the
    /// inode record updated); without it, holes come back as `None`.
    pub fn resolve_block(
        &self,
        ino: InodeNo,
        lblk: u32,
        allocate: bool,
    ) -> Result<Option<BlockNo>> {
        if !allocate {
            let groups = self.state.read();
            let record = self.load_record(&groups, ino)?;
            if !record.kind().is_mappable() {
                return Err(PfsError::NotPermitted);
            }
            return pfs_itree::lookup(&self.cache, ino, &record, lblk, groups.total_blocks());
        }

        let mut groups = self.state.write();
        let mut record = self.load_record(&groups, ino)?;
        if !record.kind().is_mappable() {
            return Err(PfsError::NotPermitted);
        }
        let before = record.clone();
        let mut ctx = MapCtx {
            cache: &self.cache,
            groups: &mut groups,
        };
        let resolved = pfs_itree::resolve(&mut ctx, ino, &mut record, lblk, true)?;
        if record != before {
            record.time = unix_now();
            self.store_record(&groups, ino, &record, self.sync)?;
        }
        self.commit(&mut groups)?;
        Ok(resolved)
    }

    /// Shrink (or logically grow) a file to `new_size` bytes, reclaiming
    /// every block past the new end.
    pub fn truncate(&self, ino: InodeNo, new_size: u32) -> Result<()> {
        let mut groups = self.state.write();
        let mut record = self.load_record(&groups, ino)?;
        if !record.kind().is_mappable() {
            return Err(PfsError::NotPermitted);
        }
        let mut ctx = MapCtx {
            cache: &self.cache,
            groups: &mut groups,
        };
        pfs_itree::truncate(&mut ctx, ino, &mut record, new_size)?;
        record.time = unix_now();
        self.store_record(&groups, ino, &record, self.sync)?;
        self.commit(&mut groups)
    }

    // ── File data ───────────────────────────────────────────────────────

    /// Read up to `len` bytes at `offset`, stopping at the file's size.
    /// Holes read as zeros.
    pub fn read_at(&self, ino: InodeNo, offset: u32, len: usize) -> Result<Vec<u8>> {
        let groups = self.state.read();
        let record = self.load_record(&groups, ino)?;
        if !record.kind().is_mappable() {
            return Err(PfsError::NotPermitted);
        }
        let end = u64::from(record.size).min(u64::from(offset) + len as u64);
        if u64::from(offset) >= end {
            return Ok(Vec::new());
        }
        let mut out = vec![0_u8; (end - u64::from(offset)) as usize];
        let total = groups.total_blocks();

        let mut pos = 0_usize;
        while pos < out.len() {
            let abs = offset as usize + pos;
            let lblk = (abs / BLOCK_SIZE as usize) as u32;
            let in_block = abs % BLOCK_SIZE as usize;
            let span = (BLOCK_SIZE as usize - in_block).min(out.len() - pos);
            if let Some(phys) = pfs_itree::lookup(&self.cache, ino, &record, lblk, total)? {
                let buf = self.cache.read(phys)?;
                out[pos..pos + span].copy_from_slice(&buf.as_slice()[in_block..in_block + span]);
            }
            pos += span;
        }
        Ok(out)
    }

    /// Write `data` at `offset`, allocating blocks as needed and growing
    /// the file's size.
    pub fn write_at(&self, ino: InodeNo, offset: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut groups = self.state.write();
        let mut record = self.load_record(&groups, ino)?;
        if !record.kind().is_mappable() {
            return Err(PfsError::NotPermitted);
        }

        let mut pos = 0_usize;
        while pos < data.len() {
            let abs = offset as usize + pos;
            let lblk = (abs / BLOCK_SIZE as usize) as u32;
            let in_block = abs % BLOCK_SIZE as usize;
            let span = (BLOCK_SIZE as usize - in_block).min(data.len() - pos);

            let mut ctx = MapCtx {
                cache: &self.cache,
                groups: &mut groups,
            };
            let Some(phys) = pfs_itree::resolve(&mut ctx, ino, &mut record, lblk, true)? else {
                return Err(PfsError::Format(format!(
                    "no block mapped for inode {ino} block {lblk}"
                )));
            };
            let mut buf = self.cache.read(phys)?;
            buf.as_mut_slice()[in_block..in_block + span].copy_from_slice(&data[pos..pos + span]);
            self.cache.write(phys, buf.as_slice())?;
            self.flush_if_sync(phys)?;
            pos += span;
        }

        record.size = record.size.max(offset + data.len() as u32);
        record.time = unix_now();
        self.store_record(&groups, ino, &record, self.sync)?;
        self.commit(&mut groups)
    }

    // ── Directory scanning ──────────────────────────────────────────────

    fn dir_block_count(record: &InodeRecord) -> u32 {
        record.size.div_ceil(BLOCK_SIZE)
    }

    fn find_entry_locked(
        &self,
        groups: &GroupSet,
        dir: InodeNo,
        record: &InodeRecord,
        name: &[u8],
    ) -> Result<Option<FoundEntry>> {
        let total = groups.total_blocks();
        for n in 0..Self::dir_block_count(record) {
            let Some(phys) = pfs_itree::lookup(&self.cache, dir, record, n, total)? else {
                continue;
            };
            let buf = match self.cache.read(phys) {
                Ok(buf) => buf,
                Err(PfsError::Io(err)) => {
                    warn!(dir = dir.0, block = phys.0, %err, "skipping unreadable directory block");
                    continue;
                }
                Err(err) => return Err(err),
            };
            if let Some(offset) = pfs_dir::find_in_block(buf.as_slice(), phys, name)? {
                let entry = pfs_dir::entry_at(buf.as_slice(), phys, offset)?.ok_or_else(|| {
                    PfsError::Corruption {
                        block: phys.0,
                        detail: "found entry vanished mid-scan".to_owned(),
                    }
                })?;
                return Ok(Some(FoundEntry {
                    block: phys,
                    offset,
                    ino: InodeNo(entry.ino),
                }));
            }
        }
        Ok(None)
    }

    /// Resolve `name` in a directory.
    pub fn lookup(&self, dir: InodeNo, name: &[u8]) -> Result<InodeNo> {
        if name.len() > MAX_NAME_LEN {
            return Err(PfsError::NameTooLong);
        }
        let groups = self.state.read();
        let record = self.load_record(&groups, dir)?;
        if !record.kind().is_dir() {
            return Err(PfsError::NotDirectory);
        }
        self.find_entry_locked(&groups, dir, &record, name)?
            .map(|found| found.ino)
            .ok_or_else(|| PfsError::NotFound(String::from_utf8_lossy(name).into_owned()))
    }

    /// Enumerate a directory from a byte-offset cursor.
    ///
    /// The scan stops at the directory's declared size; an unreadable
    /// block is skipped with a warning rather than failing the whole
    /// enumeration. Re-supplying any returned entry's offset resumes with
    /// that entry.
    pub fn list_dir(&self, dir: InodeNo, cursor: u32) -> Result<DirPage> {
        let groups = self.state.read();
        let record = self.load_record(&groups, dir)?;
        if !record.kind().is_dir() {
            return Err(PfsError::NotDirectory);
        }

        let total = groups.total_blocks();
        let mut entries = Vec::new();
        let mut from = (cursor % BLOCK_SIZE) as usize;
        for n in (cursor / BLOCK_SIZE)..Self::dir_block_count(&record) {
            let base = n * BLOCK_SIZE;
            match pfs_itree::lookup(&self.cache, dir, &record, n, total)? {
                None => {}
                Some(phys) => match self.cache.read(phys) {
                    Err(PfsError::Io(err)) => {
                        warn!(dir = dir.0, block = phys.0, %err, "skipping unreadable directory block");
                    }
                    Err(err) => return Err(err),
                    Ok(buf) => {
                        for raw in pfs_dir::entries_in_block(buf.as_slice(), phys, from)? {
                            entries.push(DirEntryInfo {
                                ino: InodeNo(raw.ino),
                                name: raw.name(buf.as_slice()).to_vec(),
                                offset: base + raw.offset as u32,
                            });
                        }
                    }
                },
            }
            from = 0;
        }
        Ok(DirPage {
            entries,
            next_cursor: record.size,
        })
    }

    fn is_empty_locked(
        &self,
        groups: &GroupSet,
        dir: InodeNo,
        record: &InodeRecord,
    ) -> Result<bool> {
        let total = groups.total_blocks();
        for n in 0..Self::dir_block_count(record) {
            let Some(phys) = pfs_itree::lookup(&self.cache, dir, record, n, total)? else {
                continue;
            };
            let buf = self.cache.read(phys)?;
            if !pfs_dir::block_is_empty(buf.as_slice(), phys, dir.0)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ── Directory mutation ──────────────────────────────────────────────

    /// Insert `name → target` into a directory, reusing or splitting a
    /// free slot, or appending exactly one zero-initialized block when no
    /// existing block has room.
    fn add_link_locked(
        &self,
        groups: &mut GroupSet,
        dir: InodeNo,
        name: &[u8],
        target: InodeNo,
    ) -> Result<()> {
        let mut record = self.load_record(groups, dir)?;
        if !record.kind().is_dir() {
            return Err(PfsError::NotDirectory);
        }
        if self.find_entry_locked(groups, dir, &record, name)?.is_some() {
            return Err(PfsError::Exists);
        }

        let nblocks = Self::dir_block_count(&record);
        for n in 0..nblocks {
            let looked_up = pfs_itree::lookup(&self.cache, dir, &record, n, groups.total_blocks())?;
            let (phys, mut buf) = match looked_up {
                Some(phys) => match self.cache.read(phys) {
                    Ok(buf) => (phys, buf),
                    Err(PfsError::Io(err)) => {
                        warn!(dir = dir.0, block = phys.0, %err, "skipping unreadable directory block");
                        continue;
                    }
                    Err(err) => return Err(err),
                },
                None => {
                    // A hole in the directory: materialize it.
                    let mut ctx = MapCtx {
                        cache: &self.cache,
                        groups: &mut *groups,
                    };
                    let Some(phys) = pfs_itree::resolve(&mut ctx, dir, &mut record, n, true)?
                    else {
                        continue;
                    };
                    (phys, BlockBuf::zeroed())
                }
            };
            if pfs_dir::insert_in_block(buf.as_mut_slice(), phys, name, target.0)?.is_some() {
                self.cache.write(phys, buf.as_slice())?;
                self.flush_if_sync(phys)?;
                record.time = unix_now();
                self.store_record(groups, dir, &record, self.sync)?;
                return Ok(());
            }
        }

        // Every block is full: the directory grows by exactly one block.
        let mut ctx = MapCtx {
            cache: &self.cache,
            groups: &mut *groups,
        };
        let Some(phys) = pfs_itree::resolve(&mut ctx, dir, &mut record, nblocks, true)? else {
            return Err(PfsError::Format(format!(
                "could not grow directory {dir}"
            )));
        };
        let mut buf = BlockBuf::zeroed();
        if pfs_dir::insert_in_block(buf.as_mut_slice(), phys, name, target.0)?.is_none() {
            return Err(PfsError::Format(
                "record does not fit an empty directory block".to_owned(),
            ));
        }
        self.cache.write(phys, buf.as_slice())?;
        self.flush_if_sync(phys)?;
        record.size += BLOCK_SIZE;
        record.time = unix_now();
        self.store_record(groups, dir, &record, self.sync)?;
        debug!(dir = dir.0, block = phys.0, "directory grew by one block");
        Ok(())
    }

    /// Tombstone a located entry and touch the directory's times.
    fn remove_entry_locked(
        &self,
        groups: &GroupSet,
        dir: InodeNo,
        found: &FoundEntry,
    ) -> Result<()> {
        let mut buf = self.cache.read(found.block)?;
        pfs_dir::delete_at(buf.as_mut_slice(), found.block, found.offset)?;
        self.cache.write(found.block, buf.as_slice())?;
        self.flush_if_sync(found.block)?;

        let mut record = self.load_record(groups, dir)?;
        record.time = unix_now();
        self.store_record(groups, dir, &record, self.sync)
    }

    /// Re-point a located entry at another inode (rename's overwrite).
    fn set_link_locked(
        &self,
        groups: &GroupSet,
        dir: InodeNo,
        found: &FoundEntry,
        target: InodeNo,
    ) -> Result<()> {
        let mut buf = self.cache.read(found.block)?;
        pfs_dir::set_entry_ino(buf.as_mut_slice(), found.block, found.offset, target.0)?;
        self.cache.write(found.block, buf.as_slice())?;
        self.flush_if_sync(found.block)?;

        let mut record = self.load_record(groups, dir)?;
        record.time = unix_now();
        self.store_record(groups, dir, &record, self.sync)
    }

    /// Locate the ".." record of a directory (always the second record of
    /// its first block).
    fn locate_dotdot(
        &self,
        groups: &GroupSet,
        dir: InodeNo,
        record: &InodeRecord,
    ) -> Result<(BlockNo, usize)> {
        let phys = pfs_itree::lookup(&self.cache, dir, record, 0, groups.total_blocks())?
            .ok_or_else(|| PfsError::Corruption {
                block: 0,
                detail: format!("directory {dir} has no first block"),
            })?;
        let buf = self.cache.read(phys)?;
        let first = pfs_dir::entry_at(buf.as_slice(), phys, 0)?.ok_or_else(|| {
            PfsError::Corruption {
                block: phys.0,
                detail: format!("directory {dir} has no '.' record"),
            }
        })?;
        let second_off = first.rec_len();
        pfs_dir::entry_at(buf.as_slice(), phys, second_off)?.ok_or_else(|| {
            PfsError::Corruption {
                block: phys.0,
                detail: format!("directory {dir} has no '..' record"),
            }
        })?;
        Ok((phys, second_off))
    }

    // ── Name-space operations ───────────────────────────────────────────

    /// Create a non-directory child (regular files; `mknod` and `symlink`
    /// cover the other kinds).
    pub fn create(&self, parent: InodeNo, name: &[u8], mode: u16, owner: Owner) -> Result<InodeNo> {
        if FileKind::from_mode(mode).is_dir() {
            return Err(PfsError::IsDirectory);
        }
        let mut groups = self.state.write();
        let parent_rec = self.load_record(&groups, parent)?;
        if !parent_rec.kind().is_dir() {
            return Err(PfsError::NotDirectory);
        }
        if self
            .find_entry_locked(&groups, parent, &parent_rec, name)?
            .is_some()
        {
            return Err(PfsError::Exists);
        }

        let template = InodeRecord {
            mode,
            uid: owner.uid,
            gid: owner.gid,
            links: 1,
            time: unix_now(),
            ..InodeRecord::default()
        };
        let ino = self.create_child(&mut groups, parent, &template)?;
        if let Err(err) = self.add_link_locked(&mut groups, parent, name, ino) {
            self.drop_new_inode(&mut groups, ino);
            let _ = self.commit(&mut groups);
            return Err(err);
        }
        self.commit(&mut groups)?;
        debug!(parent = parent.0, ino = ino.0, "created file");
        Ok(ino)
    }

    /// Create a device or fifo/socket node; `rdev` lands in block slot 0.
    pub fn mknod(
        &self,
        parent: InodeNo,
        name: &[u8],
        mode: u16,
        rdev: u16,
        owner: Owner,
    ) -> Result<InodeNo> {
        let ino = self.create(parent, name, mode, owner)?;
        if FileKind::from_mode(mode) == FileKind::Special {
            let groups = self.state.write();
            let mut record = self.load_record(&groups, ino)?;
            record.block[0] = rdev;
            self.store_record(&groups, ino, &record, self.sync)?;
        }
        Ok(ino)
    }

    /// Create a symbolic link whose target is stored in its first data
    /// block.
    pub fn symlink(
        &self,
        parent: InodeNo,
        name: &[u8],
        target: &[u8],
        owner: Owner,
    ) -> Result<InodeNo> {
        if target.is_empty() || target.len() >= BLOCK_SIZE as usize {
            return Err(PfsError::NameTooLong);
        }
        let ino = self.create(parent, name, S_IFLNK | 0o777, owner)?;
        if let Err(err) = self.write_at(ino, 0, target) {
            let mut groups = self.state.write();
            // Unreachable via the just-created link only; unlink it fully.
            if let Ok(rec) = self.load_record(&groups, parent) {
                if let Ok(Some(found)) = self.find_entry_locked(&groups, parent, &rec, name) {
                    let _ = self.remove_entry_locked(&groups, parent, &found);
                }
            }
            self.drop_new_inode(&mut groups, ino);
            let _ = self.commit(&mut groups);
            return Err(err);
        }
        Ok(ino)
    }

    /// Read a symlink's target back.
    pub fn read_symlink(&self, ino: InodeNo) -> Result<Vec<u8>> {
        let record = self.read_inode(ino)?;
        if record.kind() != FileKind::Symlink {
            return Err(PfsError::Format(format!("inode {ino} is not a symlink")));
        }
        self.read_at(ino, 0, record.size as usize)
    }

    /// Add a hard link `dir/name` to an existing inode.
    pub fn link(&self, ino: InodeNo, dir: InodeNo, name: &[u8]) -> Result<()> {
        let mut groups = self.state.write();
        let mut record = self.load_record(&groups, ino)?;
        if record.kind().is_dir() {
            return Err(PfsError::NotPermitted);
        }
        if record.links >= MAX_LINK_COUNT {
            return Err(PfsError::TooManyLinks);
        }
        self.add_link_locked(&mut groups, dir, name, ino)?;
        record.links += 1;
        record.time = unix_now();
        self.store_record(&groups, ino, &record, self.sync)?;
        self.commit(&mut groups)
    }

    /// Remove `dir/name`. The inode is reclaimed when its last link goes.
    pub fn unlink(&self, dir: InodeNo, name: &[u8]) -> Result<()> {
        let mut groups = self.state.write();
        let dir_rec = self.load_record(&groups, dir)?;
        if !dir_rec.kind().is_dir() {
            return Err(PfsError::NotDirectory);
        }
        let found = self
            .find_entry_locked(&groups, dir, &dir_rec, name)?
            .ok_or_else(|| PfsError::NotFound(String::from_utf8_lossy(name).into_owned()))?;
        let mut child_rec = self.load_record(&groups, found.ino)?;
        if child_rec.kind().is_dir() {
            return Err(PfsError::IsDirectory);
        }

        self.remove_entry_locked(&groups, dir, &found)?;
        child_rec.links = child_rec.links.saturating_sub(1);
        if child_rec.links == 0 {
            self.delete_inode_locked(&mut groups, found.ino, child_rec)?;
        } else {
            child_rec.time = unix_now();
            self.store_record(&groups, found.ino, &child_rec, self.sync)?;
        }
        self.commit(&mut groups)
    }

    /// Create a directory with its "." / ".." template.
    pub fn mkdir(&self, parent: InodeNo, name: &[u8], mode: u16, owner: Owner) -> Result<InodeNo> {
        let mut groups = self.state.write();
        let parent_rec = self.load_record(&groups, parent)?;
        if !parent_rec.kind().is_dir() {
            return Err(PfsError::NotDirectory);
        }
        if parent_rec.links >= MAX_LINK_COUNT {
            return Err(PfsError::TooManyLinks);
        }
        if self
            .find_entry_locked(&groups, parent, &parent_rec, name)?
            .is_some()
        {
            return Err(PfsError::Exists);
        }

        let template = InodeRecord {
            mode: S_IFDIR | (mode & 0o7777),
            uid: owner.uid,
            gid: owner.gid,
            links: 2,
            time: unix_now(),
            ..InodeRecord::default()
        };
        let ino = self.create_child(&mut groups, parent, &template)?;

        let mut made = self.make_empty_locked(&mut groups, ino, parent);
        if made.is_ok() {
            made = self.add_link_locked(&mut groups, parent, name, ino);
        }
        if let Err(err) = made {
            let record = self.load_record(&groups, ino).unwrap_or_default();
            let _ = self.delete_inode_locked(&mut groups, ino, record);
            let _ = self.commit(&mut groups);
            return Err(err);
        }

        let mut parent_rec = self.load_record(&groups, parent)?;
        parent_rec.links += 1;
        self.store_record(&groups, parent, &parent_rec, self.sync)?;
        self.commit(&mut groups)?;
        debug!(parent = parent.0, ino = ino.0, "created directory");
        Ok(ino)
    }

    fn make_empty_locked(
        &self,
        groups: &mut GroupSet,
        ino: InodeNo,
        parent: InodeNo,
    ) -> Result<()> {
        let mut record = self.load_record(groups, ino)?;
        let mut ctx = MapCtx {
            cache: &self.cache,
            groups: &mut *groups,
        };
        let Some(phys) = pfs_itree::resolve(&mut ctx, ino, &mut record, 0, true)? else {
            return Err(PfsError::Format(format!(
                "could not allocate first block of directory {ino}"
            )));
        };
        let mut buf = BlockBuf::zeroed();
        pfs_dir::init_block(buf.as_mut_slice(), ino.0, parent.0);
        self.cache.write(phys, buf.as_slice())?;
        self.flush_if_sync(phys)?;
        record.size = BLOCK_SIZE;
        self.store_record(groups, ino, &record, self.sync)
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, parent: InodeNo, name: &[u8]) -> Result<()> {
        let mut groups = self.state.write();
        let parent_rec = self.load_record(&groups, parent)?;
        if !parent_rec.kind().is_dir() {
            return Err(PfsError::NotDirectory);
        }
        let found = self
            .find_entry_locked(&groups, parent, &parent_rec, name)?
            .ok_or_else(|| PfsError::NotFound(String::from_utf8_lossy(name).into_owned()))?;
        let child_rec = self.load_record(&groups, found.ino)?;
        if !child_rec.kind().is_dir() {
            return Err(PfsError::NotDirectory);
        }
        if !self.is_empty_locked(&groups, found.ino, &child_rec)? {
            return Err(PfsError::NotEmpty);
        }

        self.remove_entry_locked(&groups, parent, &found)?;
        self.delete_inode_locked(&mut groups, found.ino, child_rec)?;

        let mut parent_rec = self.load_record(&groups, parent)?;
        parent_rec.links = parent_rec.links.saturating_sub(1);
        self.store_record(&groups, parent, &parent_rec, self.sync)?;
        self.commit(&mut groups)
    }

    /// Move `old_dir/old_name` to `new_dir/new_name`, replacing an
    /// existing target when allowed (an empty directory for a directory,
    /// any non-directory for a file).
    pub fn rename(
        &self,
        old_dir: InodeNo,
        old_name: &[u8],
        new_dir: InodeNo,
        new_name: &[u8],
    ) -> Result<()> {
        if old_dir == new_dir && old_name == new_name {
            return Ok(());
        }
        let mut groups = self.state.write();
        let old_dir_rec = self.load_record(&groups, old_dir)?;
        let new_dir_rec = self.load_record(&groups, new_dir)?;
        if !old_dir_rec.kind().is_dir() || !new_dir_rec.kind().is_dir() {
            return Err(PfsError::NotDirectory);
        }

        let old_found = self
            .find_entry_locked(&groups, old_dir, &old_dir_rec, old_name)?
            .ok_or_else(|| PfsError::NotFound(String::from_utf8_lossy(old_name).into_owned()))?;
        let child = old_found.ino;
        let mut child_rec = self.load_record(&groups, child)?;
        let moving_dir = child_rec.kind().is_dir();

        // Locate the child's ".." record before anything moves.
        let dotdot = if moving_dir {
            Some(self.locate_dotdot(&groups, child, &child_rec)?)
        } else {
            None
        };

        match self.find_entry_locked(&groups, new_dir, &new_dir_rec, new_name)? {
            Some(new_found) => {
                if new_found.ino == child {
                    // Both names already refer to the same inode.
                    return Ok(());
                }
                let mut existing_rec = self.load_record(&groups, new_found.ino)?;
                if moving_dir {
                    if !existing_rec.kind().is_dir() {
                        return Err(PfsError::NotDirectory);
                    }
                    if !self.is_empty_locked(&groups, new_found.ino, &existing_rec)? {
                        return Err(PfsError::NotEmpty);
                    }
                } else if existing_rec.kind().is_dir() {
                    return Err(PfsError::IsDirectory);
                }

                self.set_link_locked(&groups, new_dir, &new_found, child)?;
                let lost = if moving_dir { 2 } else { 1 };
                existing_rec.links = existing_rec.links.saturating_sub(lost);
                if existing_rec.links == 0 {
                    self.delete_inode_locked(&mut groups, new_found.ino, existing_rec)?;
                } else {
                    existing_rec.time = unix_now();
                    self.store_record(&groups, new_found.ino, &existing_rec, self.sync)?;
                }
            }
            None => {
                if moving_dir {
                    let fresh = self.load_record(&groups, new_dir)?;
                    if fresh.links >= MAX_LINK_COUNT {
                        return Err(PfsError::TooManyLinks);
                    }
                }
                self.add_link_locked(&mut groups, new_dir, new_name, child)?;
                if moving_dir {
                    let mut fresh = self.load_record(&groups, new_dir)?;
                    fresh.links += 1;
                    self.store_record(&groups, new_dir, &fresh, self.sync)?;
                }
            }
        }

        self.remove_entry_locked(&groups, old_dir, &old_found)?;
        child_rec.time = unix_now();
        self.store_record(&groups, child, &child_rec, self.sync)?;

        if moving_dir {
            if let Some((block, offset)) = dotdot {
                let mut buf = self.cache.read(block)?;
                pfs_dir::set_entry_ino(buf.as_mut_slice(), block, offset, new_dir.0)?;
                self.cache.write(block, buf.as_slice())?;
                self.flush_if_sync(block)?;
            }
            let mut old_fresh = self.load_record(&groups, old_dir)?;
            old_fresh.links = old_fresh.links.saturating_sub(1);
            self.store_record(&groups, old_dir, &old_fresh, self.sync)?;
        }
        self.commit(&mut groups)
    }

    /// Best-effort teardown of a half-created inode.
    fn drop_new_inode(&self, groups: &mut GroupSet, ino: InodeNo) {
        match self.load_record(groups, ino) {
            Ok(record) => {
                if let Err(err) = self.delete_inode_locked(groups, ino, record) {
                    warn!(ino = ino.0, %err, "failed to roll back new inode");
                }
            }
            Err(err) => warn!(ino = ino.0, %err, "failed to load new inode for rollback"),
        }
    }
}
