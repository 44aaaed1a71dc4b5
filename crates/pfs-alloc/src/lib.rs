#![forbid(unsafe_code)]
//! Block and inode allocation.
//!
//! The allocator is layered:
//!
//! 1. **Bitmap** — raw bit manipulation on the 1440-bit occupancy maps.
//! 2. **GroupSet** — every group's metadata with dirty tracking, the live
//!    view handed out at mount.
//! 3. **Block allocation** — ascending first-fit scan across groups.
//! 4. **Inode allocation** — parent-group-first scan plus lifecycle of the
//!    lazily materialized inode-table blocks behind each 10-inode slot.
//!
//! Every mutation validates before it touches a bit: a double free or a
//! reserved-bit mutation fails with a corruption error and leaves the maps
//! exactly as they were.

use pfs_error::{PfsError, Result};
use pfs_ondisk::GroupMeta;
use pfs_types::{
    group_count, BlockNo, GroupNo, InodeNo, BLOCKS_PER_GROUP, FIRST_FREE_INO, FIRST_POOL_BLOCK,
};
use tracing::{debug, warn};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Find the first free (zero) bit in `[start, count)`.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    (start..count).find(|&idx| !bitmap_get(bitmap, idx))
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = 0_u32;

    for &byte in bitmap.iter().take(full_bytes) {
        free += byte.count_zeros().min(8);
    }
    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        for bit in 0..remainder {
            if (byte >> bit) & 1 == 0 {
                free += 1;
            }
        }
    }
    free
}

// ── Group set ───────────────────────────────────────────────────────────────

/// A group's metadata plus its dirty flag.
#[derive(Debug, Clone)]
pub struct Group {
    pub meta: GroupMeta,
    pub dirty: bool,
}

/// Result of an inode allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewInode {
    pub ino: InodeNo,
    /// Physical block backing the inode's table slot.
    pub table_block: BlockNo,
    /// True when `table_block` was materialized by this allocation and
    /// still holds whatever the pool block contained; the caller must
    /// zero-initialize it before use.
    pub fresh_table_block: bool,
}

/// Result of an inode free: the two-step reclamation protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreedInode {
    /// Live inodes left in the slot after this free.
    pub remaining: u16,
    /// The slot's backing block. When `remaining == 0` the slot has been
    /// detached and the caller must free this block through
    /// [`GroupSet::free_blocks`].
    pub table_block: BlockNo,
}

/// The live, mutable view of every group's metadata.
///
/// Built by the mount path from validated metadata blocks; all allocator
/// operations run against it under the volume's exclusion domain. Flushing
/// dirty groups back to disk is the owner's job.
#[derive(Debug)]
pub struct GroupSet {
    groups: Vec<Group>,
    total_blocks: u32,
}

impl GroupSet {
    /// Assemble from parsed metadata. `metas.len()` must equal the group
    /// count implied by `total_blocks`.
    pub fn new(metas: Vec<GroupMeta>, total_blocks: u32) -> Result<Self> {
        let expected = group_count(total_blocks) as usize;
        if metas.len() != expected {
            return Err(PfsError::Format(format!(
                "group count mismatch: total_blocks={total_blocks} needs {expected} groups, got {}",
                metas.len()
            )));
        }
        Ok(Self {
            groups: metas
                .into_iter()
                .map(|meta| Group { meta, dirty: false })
                .collect(),
            total_blocks,
        })
    }

    #[must_use]
    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn group(&self, group: GroupNo) -> Result<&GroupMeta> {
        self.groups
            .get(group.0 as usize)
            .map(|g| &g.meta)
            .ok_or_else(|| PfsError::Corruption {
                block: group.meta_block().0,
                detail: format!("group {group} out of range"),
            })
    }

    /// First allocatable bit in a group's block/inode maps.
    fn reserved_bits(group: GroupNo) -> u32 {
        if group.0 == 0 {
            u32::from(FIRST_POOL_BLOCK)
        } else {
            1
        }
    }

    /// Bits of this group that correspond to blocks inside the volume.
    fn usable_bits(&self, group: GroupNo) -> u32 {
        let first = group.first_block();
        self.total_blocks.saturating_sub(first).min(BLOCKS_PER_GROUP)
    }

    fn mark_dirty(&mut self, group: GroupNo) {
        if let Some(g) = self.groups.get_mut(group.0 as usize) {
            g.dirty = true;
        }
    }

    /// Groups whose metadata needs writing back, clearing the flags.
    pub fn take_dirty(&mut self) -> Vec<GroupNo> {
        let mut dirty = Vec::new();
        for (i, g) in self.groups.iter_mut().enumerate() {
            if g.dirty {
                g.dirty = false;
                dirty.push(GroupNo(i as u16));
            }
        }
        dirty
    }

    #[must_use]
    pub fn has_dirty(&self) -> bool {
        self.groups.iter().any(|g| g.dirty)
    }

    // ── Space allocator ─────────────────────────────────────────────────

    /// Allocate one block: ascending group scan, first usable zero bit.
    ///
    /// Reserved bits and bits beyond the volume's total block count never
    /// win. Returns `NoSpace` when no group yields a candidate.
    pub fn alloc_block(&mut self) -> Result<BlockNo> {
        for gidx in 0..self.groups.len() {
            let group = GroupNo(gidx as u16);
            let usable = self.usable_bits(group);
            let start = Self::reserved_bits(group);
            let g = &mut self.groups[gidx];
            let Some(bit) = bitmap_find_free(&g.meta.block_map, usable, start) else {
                continue;
            };

            bitmap_set(&mut g.meta.block_map, bit);
            g.dirty = true;
            let block = BlockNo::from_group_bit(group, bit);
            debug!(block = block.0, group = group.0, bit, "allocated block");
            return Ok(block);
        }
        debug!("no free blocks left on volume");
        Err(PfsError::NoSpace)
    }

    /// Free `count` contiguous blocks starting at `start`.
    ///
    /// The whole run must lie inside one group and inside the volume;
    /// freeing a reserved bit or an already-free bit is structural
    /// corruption. Validation happens before any bit is cleared so a
    /// rejected call leaves the bitmap untouched.
    pub fn free_blocks(&mut self, start: BlockNo, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let group = start.group();
        let gidx = group.0 as usize;
        if gidx >= self.groups.len() {
            return Err(PfsError::Corruption {
                block: start.0,
                detail: format!("block {start} beyond last group"),
            });
        }
        let first_bit = start.group_bit();
        let end_bit = first_bit + count;
        let last_abs = u32::from(start.0) + count;
        if end_bit > BLOCKS_PER_GROUP || last_abs > self.total_blocks {
            return Err(PfsError::Corruption {
                block: start.0,
                detail: format!("free run start={start} count={count} leaves the group"),
            });
        }
        let reserved = Self::reserved_bits(group);
        if first_bit < reserved {
            return Err(PfsError::Corruption {
                block: start.0,
                detail: format!("refusing to free reserved block {start}"),
            });
        }

        let g = &mut self.groups[gidx];
        for bit in first_bit..end_bit {
            if !bitmap_get(&g.meta.block_map, bit) {
                warn!(
                    block = BlockNo::from_group_bit(group, bit).0,
                    group = group.0,
                    bit,
                    "double free detected"
                );
                return Err(PfsError::Corruption {
                    block: BlockNo::from_group_bit(group, bit).0,
                    detail: "block is already free".to_owned(),
                });
            }
        }
        for bit in first_bit..end_bit {
            bitmap_clear(&mut g.meta.block_map, bit);
        }
        g.dirty = true;
        debug!(
            start = start.0,
            count, "freed block run"
        );
        Ok(())
    }

    // ── Inode allocator ─────────────────────────────────────────────────

    /// Allocate an inode number, materializing its table block on demand.
    ///
    /// The scan starts in the parent's group and then covers every group in
    /// ascending order. The winning bit is set and its slot's live count
    /// incremented only after the slot has a backing block, so a failed
    /// table-block allocation mutates nothing but the block bitmap it came
    /// from (nothing, in the `NoSpace` case).
    pub fn alloc_inode(&mut self, parent: InodeNo) -> Result<NewInode> {
        let parent_group = parent.group();
        if parent_group.0 as usize >= self.groups.len() {
            return Err(PfsError::Corruption {
                block: parent_group.meta_block().0,
                detail: format!("parent inode {parent} in nonexistent group"),
            });
        }

        let mut order: Vec<GroupNo> = Vec::with_capacity(self.groups.len());
        order.push(parent_group);
        order.extend(
            (0..self.groups.len() as u16)
                .map(GroupNo)
                .filter(|g| *g != parent_group),
        );

        for group in order {
            let usable = self.usable_bits(group);
            let start = if group.0 == 0 {
                u32::from(FIRST_FREE_INO)
            } else {
                1
            };
            let Some(bit) = bitmap_find_free(
                &self.groups[group.0 as usize].meta.inode_map,
                usable,
                start,
            ) else {
                continue;
            };

            let slot = (bit / pfs_types::INODES_PER_TABLE_BLOCK) as usize;
            let mut fresh = false;
            let mut table_block = self.groups[group.0 as usize].meta.itable[slot].block;
            if table_block == 0 {
                let allocated = self.alloc_block()?;
                table_block = allocated.0;
                fresh = true;
                debug!(
                    group = group.0,
                    slot,
                    block = table_block,
                    "materialized inode-table block"
                );
            }

            let g = &mut self.groups[group.0 as usize];
            g.meta.itable[slot].block = table_block;
            g.meta.itable[slot].live += 1;
            bitmap_set(&mut g.meta.inode_map, bit);
            g.dirty = true;

            let ino = InodeNo::from_group_bit(group, bit);
            debug!(ino = ino.0, group = group.0, bit, "allocated inode");
            return Ok(NewInode {
                ino,
                table_block: BlockNo(table_block),
                fresh_table_block: fresh,
            });
        }
        debug!("no free inodes left on volume");
        Err(PfsError::NoSpace)
    }

    /// Free an inode number.
    ///
    /// Clears the bit and decrements the slot's live count. When the count
    /// reaches zero the slot's backing block is detached and returned; the
    /// caller then frees it through the space allocator. The table block is
    /// never freed here because other inodes in the slot may still be live.
    pub fn free_inode(&mut self, ino: InodeNo) -> Result<FreedInode> {
        let group = ino.group();
        let gidx = group.0 as usize;
        if gidx >= self.groups.len() {
            return Err(PfsError::Corruption {
                block: group.meta_block().0,
                detail: format!("inode {ino} in nonexistent group"),
            });
        }
        let bit = ino.group_bit();
        let reserved = if group.0 == 0 {
            u32::from(FIRST_FREE_INO)
        } else {
            1
        };
        if bit < reserved {
            return Err(PfsError::Corruption {
                block: group.meta_block().0,
                detail: format!("refusing to free reserved inode {ino}"),
            });
        }

        let slot = ino.table_slot();
        let g = &mut self.groups[gidx];
        let table_block = g.meta.itable[slot].block;
        if table_block == 0 {
            return Err(PfsError::Corruption {
                block: group.meta_block().0,
                detail: format!("inode {ino} has no backing table block"),
            });
        }
        if !bitmap_get(&g.meta.inode_map, bit) {
            warn!(ino = ino.0, group = group.0, bit, "inode double free");
            return Err(PfsError::Corruption {
                block: group.meta_block().0,
                detail: format!("inode {ino} is already free"),
            });
        }
        if g.meta.itable[slot].live == 0 {
            return Err(PfsError::Corruption {
                block: group.meta_block().0,
                detail: format!("inode {ino} slot live count underflow"),
            });
        }

        bitmap_clear(&mut g.meta.inode_map, bit);
        g.meta.itable[slot].live -= 1;
        let remaining = g.meta.itable[slot].live;
        if remaining == 0 {
            g.meta.itable[slot].block = 0;
        }
        g.dirty = true;
        debug!(ino = ino.0, remaining, "freed inode");
        Ok(FreedInode {
            remaining,
            table_block: BlockNo(table_block),
        })
    }

    /// Backing table block for an existing inode, for record load/store.
    pub fn itable_block(&self, ino: InodeNo) -> Result<BlockNo> {
        let meta = self.group(ino.group())?;
        let block = meta.itable[ino.table_slot()].block;
        if block == 0 {
            return Err(PfsError::Corruption {
                block: ino.group().meta_block().0,
                detail: format!("inode {ino} has no backing table block"),
            });
        }
        Ok(BlockNo(block))
    }

    // ── Free-space accounting ───────────────────────────────────────────

    /// Free data blocks across all groups, bits beyond the volume excluded.
    #[must_use]
    pub fn free_block_count(&self) -> u32 {
        self.groups
            .iter()
            .enumerate()
            .map(|(i, g)| bitmap_count_free(&g.meta.block_map, self.usable_bits(GroupNo(i as u16))))
            .sum()
    }

    /// Free inode bits across all groups, with the same per-group cap as
    /// blocks: an inode slot beyond the last block is meaningless.
    #[must_use]
    pub fn free_inode_count(&self) -> u32 {
        self.groups
            .iter()
            .enumerate()
            .map(|(i, g)| bitmap_count_free(&g.meta.inode_map, self.usable_bits(GroupNo(i as u16))))
            .sum()
    }
}
