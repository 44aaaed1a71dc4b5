#![forbid(unsafe_code)]
//! Logical-to-physical block mapping.
//!
//! An inode addresses data through 39 direct pointers, one single-indirect
//! block and one double-indirect block (512 pointers each). This crate
//! resolves a file-relative logical block index to a physical block,
//! allocating the missing suffix of the indirection path on demand, and
//! reclaims the tree on truncate.
//!
//! The walk records an **indirection chain** of owned `{slot, value}` links
//! (an inode slot index or a `(block, index)` pair) rather than pointers
//! into cache buffers. Because indirection blocks are read without holding
//! the volume's mutation lock, every recorded value is re-verified against
//! the live slots before a new branch is spliced in; a mismatch discards
//! the walk and retries from the root, up to [`MAX_RESOLVE_RETRIES`] times
//! before the operation fails rather than spin.

use pfs_alloc::GroupSet;
use pfs_block::{BlockDevice, BufferCache};
use pfs_error::{PfsError, Result};
use pfs_ondisk::InodeRecord;
use pfs_types::{
    BlockNo, InodeNo, BLOCK_SIZE, DIND_SLOT, DIRECT_SLOTS, IND_SLOT, PTRS_PER_BLOCK,
};
use tracing::{debug, warn};

/// Bounded retry for chain revalidation. Past this the tree is considered
/// inconsistent and the operation fails instead of spinning.
pub const MAX_RESOLVE_RETRIES: usize = 8;

/// Everything a mapping operation needs: the buffer cache for indirection
/// blocks and the group set for block allocation.
pub struct MapCtx<'a, D: BlockDevice> {
    pub cache: &'a BufferCache<D>,
    pub groups: &'a mut GroupSet,
}

// ── Path decomposition ──────────────────────────────────────────────────────

/// Decompose a logical block index into at most three slot offsets.
///
/// Returns `None` for indices beyond the addressable range or beyond the
/// volume's own block count (a file can never have more logical blocks than
/// the volume has physical ones).
#[must_use]
pub fn block_to_path(lblk: u32, total_blocks: u32) -> Option<([usize; 3], usize)> {
    if lblk >= total_blocks {
        return None;
    }
    let direct = DIRECT_SLOTS as u32;
    if lblk < direct {
        return Some(([lblk as usize, 0, 0], 1));
    }
    let mut rest = lblk - direct;
    if rest < PTRS_PER_BLOCK {
        return Some(([IND_SLOT, rest as usize, 0], 2));
    }
    rest -= PTRS_PER_BLOCK;
    if rest < PTRS_PER_BLOCK * PTRS_PER_BLOCK {
        return Some((
            [
                DIND_SLOT,
                (rest / PTRS_PER_BLOCK) as usize,
                (rest % PTRS_PER_BLOCK) as usize,
            ],
            3,
        ));
    }
    None
}

// ── Indirection chain ───────────────────────────────────────────────────────

/// Where a block pointer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotLoc {
    /// Slot in the inode's own pointer array.
    Inode(usize),
    /// Pointer slot inside an indirection block.
    Block { block: BlockNo, index: usize },
}

/// One step of the walk: the slot and the value read from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainLink {
    pub loc: SlotLoc,
    pub value: u16,
}

fn live_slot_value<D: BlockDevice>(
    cache: &BufferCache<D>,
    record: &InodeRecord,
    loc: SlotLoc,
) -> Result<u16> {
    match loc {
        SlotLoc::Inode(i) => Ok(record.block[i]),
        SlotLoc::Block { block, index } => Ok(cache.read(block)?.ptr_at(index)),
    }
}

/// Re-read every link's slot and compare with the recorded value.
pub fn verify_branch<D: BlockDevice>(
    cache: &BufferCache<D>,
    record: &InodeRecord,
    links: &[ChainLink],
) -> Result<bool> {
    for link in links {
        if live_slot_value(cache, record, link.loc)? != link.value {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Walk the path, reading indirection blocks as needed.
///
/// Stops early at the first zero-valued slot. Before a freshly read block
/// is consumed, the links recorded so far are re-verified; a mismatch means
/// a concurrent operation moved the tree underneath us and the caller must
/// retry from the root.
pub fn read_branch<D: BlockDevice>(
    cache: &BufferCache<D>,
    ino: InodeNo,
    record: &InodeRecord,
    offsets: &[usize; 3],
    depth: usize,
) -> Result<Vec<ChainLink>> {
    let mut links = vec![ChainLink {
        loc: SlotLoc::Inode(offsets[0]),
        value: record.block[offsets[0]],
    }];
    if links[0].value == 0 {
        return Ok(links);
    }

    for level in 1..depth {
        let parent = BlockNo(links[level - 1].value);
        let buf = cache.read(parent)?;
        if !verify_branch(cache, record, &links)? {
            return Err(PfsError::Conflict {
                ino: ino.0,
                block: parent.0.into(),
            });
        }
        let value = buf.ptr_at(offsets[level]);
        links.push(ChainLink {
            loc: SlotLoc::Block {
                block: parent,
                index: offsets[level],
            },
            value,
        });
        if value == 0 {
            break;
        }
    }
    Ok(links)
}

/// Whether a branch read covers the whole path down to a data block.
#[must_use]
pub fn branch_is_complete(links: &[ChainLink], depth: usize) -> bool {
    links.len() == depth && links[depth - 1].value != 0
}

// ── Branch allocation and splice ────────────────────────────────────────────

fn rollback_new_blocks<D: BlockDevice>(ctx: &mut MapCtx<'_, D>, blocks: &[BlockNo]) {
    for block in blocks {
        ctx.cache.forget(*block);
        if let Err(err) = ctx.groups.free_blocks(*block, 1) {
            warn!(block = block.0, %err, "failed to roll back branch block");
        }
    }
}

/// Allocate the missing suffix of a path.
///
/// One block per missing level, each zero-filled; every child is linked
/// into its (still private) parent. Nothing touches the live tree; that is
/// the splice's job. Any failure frees every block allocated by this call.
pub fn alloc_branch<D: BlockDevice>(
    ctx: &mut MapCtx<'_, D>,
    offsets: &[usize; 3],
    depth: usize,
    links: &[ChainLink],
) -> Result<Vec<BlockNo>> {
    debug_assert_eq!(links.last().map(|l| l.value), Some(0));
    let first_missing = links.len() - 1;
    let n_missing = depth - first_missing;

    let mut new_blocks: Vec<BlockNo> = Vec::with_capacity(n_missing);
    for _ in 0..n_missing {
        match ctx.groups.alloc_block() {
            Ok(block) => new_blocks.push(block),
            Err(err) => {
                rollback_new_blocks(ctx, &new_blocks);
                return Err(err);
            }
        }
    }

    for j in 0..n_missing {
        let mut buf = vec![0_u8; BLOCK_SIZE as usize];
        if j + 1 < n_missing {
            let slot = offsets[first_missing + j + 1] * 2;
            buf[slot..slot + 2].copy_from_slice(&new_blocks[j + 1].0.to_le_bytes());
        }
        if let Err(err) = ctx.cache.write(new_blocks[j], &buf) {
            rollback_new_blocks(ctx, &new_blocks);
            return Err(err);
        }
    }
    Ok(new_blocks)
}

/// Splice a freshly allocated branch into the live tree.
///
/// Revalidates the chain and checks the target slot is still empty; on
/// mismatch every new block is freed and the walk must restart. On success
/// the inode's allocated-block count grows by the new blocks.
pub fn splice_branch<D: BlockDevice>(
    ctx: &mut MapCtx<'_, D>,
    ino: InodeNo,
    record: &mut InodeRecord,
    links: &[ChainLink],
    new_blocks: &[BlockNo],
) -> Result<()> {
    let Some((grafted, prior)) = links.split_last() else {
        return Err(PfsError::Format("cannot splice an empty branch".to_owned()));
    };

    let still_valid = verify_branch(ctx.cache, record, prior)?
        && live_slot_value(ctx.cache, record, grafted.loc)? == 0;
    if !still_valid {
        rollback_new_blocks(ctx, new_blocks);
        return Err(PfsError::Conflict {
            ino: ino.0,
            block: new_blocks.first().map_or(0, |b| b.0).into(),
        });
    }

    match grafted.loc {
        SlotLoc::Inode(i) => record.block[i] = new_blocks[0].0,
        SlotLoc::Block { block, index } => {
            let mut buf = ctx.cache.read(block)?;
            let slot = index * 2;
            buf.as_mut_slice()[slot..slot + 2].copy_from_slice(&new_blocks[0].0.to_le_bytes());
            ctx.cache.write(block, buf.as_slice())?;
        }
    }
    record.blocks = record
        .blocks
        .saturating_add((new_blocks.len() * (BLOCK_SIZE / 512) as usize) as u16);
    Ok(())
}

// ── Resolution ──────────────────────────────────────────────────────────────

/// Pure lookup: map a logical block without allocating anything.
///
/// Needs no allocator state, so non-mutating callers can run it while
/// holding only shared access to the volume. The same bounded
/// revalidate-or-retry loop protects against a concurrent truncate moving
/// the chain between block reads.
pub fn lookup<D: BlockDevice>(
    cache: &BufferCache<D>,
    ino: InodeNo,
    record: &InodeRecord,
    lblk: u32,
    total_blocks: u32,
) -> Result<Option<BlockNo>> {
    let Some((offsets, depth)) = block_to_path(lblk, total_blocks) else {
        return Err(PfsError::Format(format!(
            "logical block {lblk} out of range for inode {ino}"
        )));
    };
    for attempt in 0..MAX_RESOLVE_RETRIES {
        match read_branch(cache, ino, record, &offsets, depth) {
            Ok(links) => {
                if branch_is_complete(&links, depth) {
                    return Ok(Some(BlockNo(links[depth - 1].value)));
                }
                return Ok(None);
            }
            Err(PfsError::Conflict { .. }) => {
                debug!(ino = ino.0, lblk, attempt, "chain changed during lookup, retrying");
            }
            Err(err) => return Err(err),
        }
    }
    warn!(ino = ino.0, lblk, "chain revalidation ceiling exceeded");
    Err(PfsError::Corruption {
        block: 0,
        detail: format!(
            "indirection chain for inode {ino} block {lblk} kept changing after {MAX_RESOLVE_RETRIES} retries"
        ),
    })
}

/// Map a logical block to its physical block.
///
/// With `allocate` unset this is a pure lookup: `Ok(None)` for holes. With
/// `allocate` set, missing path levels are allocated and spliced; the
/// revalidate-or-retry loop handles concurrent tree mutations, giving up
/// with a consistency error after [`MAX_RESOLVE_RETRIES`] failed rounds.
pub fn resolve<D: BlockDevice>(
    ctx: &mut MapCtx<'_, D>,
    ino: InodeNo,
    record: &mut InodeRecord,
    lblk: u32,
    allocate: bool,
) -> Result<Option<BlockNo>> {
    let Some((offsets, depth)) = block_to_path(lblk, ctx.groups.total_blocks()) else {
        return Err(PfsError::Format(format!(
            "logical block {lblk} out of range for inode {ino}"
        )));
    };

    for attempt in 0..MAX_RESOLVE_RETRIES {
        let links = match read_branch(ctx.cache, ino, record, &offsets, depth) {
            Ok(links) => links,
            Err(PfsError::Conflict { .. }) => {
                debug!(ino = ino.0, lblk, attempt, "chain changed during read, retrying");
                continue;
            }
            Err(err) => return Err(err),
        };

        if branch_is_complete(&links, depth) {
            return Ok(Some(BlockNo(links[depth - 1].value)));
        }
        if !allocate {
            return Ok(None);
        }

        let new_blocks = alloc_branch(ctx, &offsets, depth, &links)?;
        let Some(resolved) = new_blocks.last().copied() else {
            return Err(PfsError::Format(format!(
                "empty branch allocation for inode {ino} block {lblk}"
            )));
        };
        match splice_branch(ctx, ino, record, &links, &new_blocks) {
            Ok(()) => {
                debug!(
                    ino = ino.0,
                    lblk,
                    block = resolved.0,
                    new = new_blocks.len(),
                    "allocated branch"
                );
                return Ok(Some(resolved));
            }
            Err(PfsError::Conflict { .. }) => {
                debug!(ino = ino.0, lblk, attempt, "chain changed during splice, retrying");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    warn!(ino = ino.0, lblk, "chain revalidation ceiling exceeded");
    Err(PfsError::Corruption {
        block: 0,
        detail: format!(
            "indirection chain for inode {ino} block {lblk} kept changing after {MAX_RESOLVE_RETRIES} retries"
        ),
    })
}

// ── Truncation ──────────────────────────────────────────────────────────────

/// Free a list of pointer values as data blocks, coalescing contiguous
/// physical runs into single multi-block free calls.
fn free_run<D: BlockDevice>(
    ctx: &mut MapCtx<'_, D>,
    record: &mut InodeRecord,
    ptrs: &[u16],
) -> Result<()> {
    let mut run_start = 0_u16;
    let mut run_len = 0_u32;
    for &ptr in ptrs.iter().filter(|p| **p != 0) {
        if run_len > 0 && u32::from(ptr) == u32::from(run_start) + run_len {
            run_len += 1;
            continue;
        }
        if run_len > 0 {
            ctx.groups.free_blocks(BlockNo(run_start), run_len)?;
            record.blocks = record
                .blocks
                .saturating_sub((run_len * (BLOCK_SIZE / 512)) as u16);
        }
        run_start = ptr;
        run_len = 1;
    }
    if run_len > 0 {
        ctx.groups.free_blocks(BlockNo(run_start), run_len)?;
        record.blocks = record
            .blocks
            .saturating_sub((run_len * (BLOCK_SIZE / 512)) as u16);
    }
    Ok(())
}

/// Depth-first free of the subtrees hanging off `ptrs`.
///
/// `levels` counts the indirection levels below each pointer: 0 means the
/// pointers are data blocks. Children are freed before their parent, and
/// every freed indirection block is dropped from the cache without
/// write-back first. An unreadable indirection block is logged and skipped
/// (its blocks leak rather than fail the whole truncate).
fn free_branch_ptrs<D: BlockDevice>(
    ctx: &mut MapCtx<'_, D>,
    record: &mut InodeRecord,
    ptrs: &[u16],
    levels: usize,
) -> Result<()> {
    if levels == 0 {
        return free_run(ctx, record, ptrs);
    }
    for &ptr in ptrs.iter().filter(|p| **p != 0) {
        let block = BlockNo(ptr);
        let buf = match ctx.cache.read(block) {
            Ok(buf) => buf,
            Err(err) => {
                warn!(block = ptr, %err, "unreadable indirection block, skipping subtree");
                continue;
            }
        };
        let children: Vec<u16> = (0..PTRS_PER_BLOCK as usize)
            .map(|i| buf.ptr_at(i))
            .collect();
        free_branch_ptrs(ctx, record, &children, levels - 1)?;
        ctx.cache.forget(block);
        ctx.groups.free_blocks(block, 1)?;
        record.blocks = record.blocks.saturating_sub((BLOCK_SIZE / 512) as u16);
    }
    Ok(())
}

/// Zero the pointers `[start, 512)` of an indirection block and free their
/// subtrees.
fn trim_indirect_block<D: BlockDevice>(
    ctx: &mut MapCtx<'_, D>,
    record: &mut InodeRecord,
    block: BlockNo,
    start: usize,
    levels: usize,
) -> Result<()> {
    let mut buf = ctx.cache.read(block)?;
    let mut doomed = Vec::new();
    for i in start..PTRS_PER_BLOCK as usize {
        let ptr = buf.ptr_at(i);
        if ptr != 0 {
            doomed.push(ptr);
            buf.as_mut_slice()[i * 2..i * 2 + 2].fill(0);
        }
    }
    if doomed.is_empty() {
        return Ok(());
    }
    ctx.cache.write(block, buf.as_slice())?;
    free_branch_ptrs(ctx, record, &doomed, levels)
}

/// Shrink the mapping tree to `new_size` bytes.
///
/// Frees the direct tail, trims the deepest indirection block still shared
/// between the old and new tree shape, frees every subtree wholly beyond
/// the boundary (children before parents), and finally drops now-unused
/// whole single/double trees from the inode's top-level slots. Growing
/// truncates (`new_size` past the last mapped block) free nothing.
pub fn truncate<D: BlockDevice>(
    ctx: &mut MapCtx<'_, D>,
    ino: InodeNo,
    record: &mut InodeRecord,
    new_size: u32,
) -> Result<()> {
    if !record.kind().is_mappable() {
        return Ok(());
    }

    // First logical block that must no longer be mapped.
    let iblock = new_size.div_ceil(BLOCK_SIZE);
    let total = ctx.groups.total_blocks();
    record.size = new_size;

    let Some((offsets, depth)) = block_to_path(iblock, total) else {
        // Nothing beyond the addressable range can be mapped.
        return Ok(());
    };
    debug!(ino = ino.0, new_size, iblock, depth, "truncating mapping tree");

    let first_whole;
    if depth == 1 {
        // Free the direct tail straight out of the inode.
        let mut doomed = [0_u16; DIRECT_SLOTS];
        for i in offsets[0]..DIRECT_SLOTS {
            doomed[i] = record.block[i];
            record.block[i] = 0;
        }
        free_run(ctx, record, &doomed[offsets[0]..])?;
        first_whole = 0;
    } else {
        first_whole = offsets[0] + 1 - DIRECT_SLOTS;

        // Strip trailing zero offsets: a path ending on slot 0 shares no
        // part of that level's block.
        let mut k = depth;
        while k > 1 && offsets[k - 1] == 0 {
            k -= 1;
        }

        let links = read_branch(ctx.cache, ino, record, &offsets, k)?;
        let partial = links
            .iter()
            .position(|l| l.value == 0)
            .unwrap_or(links.len() - 1);

        // Walk up while the containing block would be left empty, so the
        // whole subtree is detached instead of trimmed.
        let mut p = partial;
        while p > 0 {
            let parent = BlockNo(links[p - 1].value);
            let buf = ctx.cache.read(parent)?;
            if (0..offsets[p]).all(|i| buf.ptr_at(i) == 0) {
                p -= 1;
            } else {
                break;
            }
        }

        let trim_from_inclusive = p == k - 1 && p > 0;
        if !trim_from_inclusive {
            // Detach the subtree rooted at level p and free it whole.
            let top = links[p].value;
            if top != 0 {
                match links[p].loc {
                    SlotLoc::Inode(i) => record.block[i] = 0,
                    SlotLoc::Block { block, index } => {
                        let mut buf = ctx.cache.read(block)?;
                        buf.as_mut_slice()[index * 2..index * 2 + 2].fill(0);
                        ctx.cache.write(block, buf.as_slice())?;
                    }
                }
                free_branch_ptrs(ctx, record, &[top], depth - 1 - p)?;
            }
        }

        // Trim trailing pointers at every shared level, deepest first. The
        // deepest level starts at its own offset when trimming in place;
        // everywhere else the boundary pointer leads to surviving data (or
        // was just detached) and is skipped.
        let mut level = p;
        while level > 0 {
            let start = if trim_from_inclusive && level == p {
                offsets[level]
            } else {
                offsets[level] + 1
            };
            let container = BlockNo(links[level - 1].value);
            trim_indirect_block(ctx, record, container, start, depth - 1 - level)?;
            level -= 1;
        }
    }

    // Whole single/double trees past the boundary.
    for w in first_whole..2 {
        let slot = DIRECT_SLOTS + w;
        let top = record.block[slot];
        if top != 0 {
            record.block[slot] = 0;
            free_branch_ptrs(ctx, record, &[top], w + 1)?;
        }
    }
    Ok(())
}
