#![forbid(unsafe_code)]
//! On-disk codecs.
//!
//! Serializes and deserializes the two fixed metadata records: the group
//! metadata block (one per 1440-block group) and the 100-byte inode record
//! (ten per inode-table block). All fields are little-endian.

use pfs_types::{
    ensure_slice, read_le_u16, read_le_u32, write_le_u16, write_le_u32, ParseError, BLOCK_SIZE,
    ITABLE_SLOTS_PER_GROUP, N_BLOCK_SLOTS, PFS_MAGIC, PFS_VERSION, STATE_VALID,
};

// ── Group metadata block ────────────────────────────────────────────────────

/// Bytes per occupancy bitmap: 1440 bits as 90 little-endian words.
pub const BITMAP_BYTES: usize = 180;

const OFF_FSID: usize = 0;
const OFF_VERSION: usize = 2;
const OFF_BLOCK_MAP: usize = 4;
const OFF_INODE_MAP: usize = OFF_BLOCK_MAP + BITMAP_BYTES;
const OFF_ITABLE: usize = OFF_INODE_MAP + BITMAP_BYTES;
const OFF_STATE: usize = OFF_ITABLE + 4 * ITABLE_SLOTS_PER_GROUP as usize;
const OFF_TOTAL_BLOCKS: usize = OFF_STATE + 2;

/// One inode-table slot: the backing physical block (0 = not materialized)
/// and the number of live inodes stored in it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItableSlot {
    pub block: u16,
    pub live: u16,
}

/// In-memory form of a group's metadata block.
///
/// `total_blocks` is meaningful only in group 0; other groups carry zero
/// there and the field is ignored on load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMeta {
    pub block_map: [u8; BITMAP_BYTES],
    pub inode_map: [u8; BITMAP_BYTES],
    pub itable: [ItableSlot; ITABLE_SLOTS_PER_GROUP as usize],
    pub state: u16,
    pub total_blocks: u16,
}

impl Default for GroupMeta {
    fn default() -> Self {
        Self {
            block_map: [0; BITMAP_BYTES],
            inode_map: [0; BITMAP_BYTES],
            itable: [ItableSlot::default(); ITABLE_SLOTS_PER_GROUP as usize],
            state: STATE_VALID,
            total_blocks: 0,
        }
    }
}

impl GroupMeta {
    /// Decode a metadata block, validating magic and format version.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let fsid = read_le_u16(bytes, OFF_FSID)?;
        if fsid != PFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: PFS_MAGIC,
                actual: fsid,
            });
        }
        let version = read_le_u16(bytes, OFF_VERSION)?;
        if version != PFS_VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported format version",
            });
        }

        let mut meta = Self::default();
        meta.block_map
            .copy_from_slice(ensure_slice(bytes, OFF_BLOCK_MAP, BITMAP_BYTES)?);
        meta.inode_map
            .copy_from_slice(ensure_slice(bytes, OFF_INODE_MAP, BITMAP_BYTES)?);
        for (i, slot) in meta.itable.iter_mut().enumerate() {
            let off = OFF_ITABLE + i * 4;
            slot.block = read_le_u16(bytes, off)?;
            slot.live = read_le_u16(bytes, off + 2)?;
        }
        meta.state = read_le_u16(bytes, OFF_STATE)?;
        meta.total_blocks = read_le_u16(bytes, OFF_TOTAL_BLOCKS)?;
        Ok(meta)
    }

    /// Encode into a full metadata block image.
    pub fn encode_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        if out.len() < BLOCK_SIZE as usize {
            return Err(ParseError::InsufficientData {
                needed: BLOCK_SIZE as usize,
                offset: 0,
                actual: out.len(),
            });
        }
        out[..BLOCK_SIZE as usize].fill(0);
        write_le_u16(out, OFF_FSID, PFS_MAGIC)?;
        write_le_u16(out, OFF_VERSION, PFS_VERSION)?;
        out[OFF_BLOCK_MAP..OFF_BLOCK_MAP + BITMAP_BYTES].copy_from_slice(&self.block_map);
        out[OFF_INODE_MAP..OFF_INODE_MAP + BITMAP_BYTES].copy_from_slice(&self.inode_map);
        for (i, slot) in self.itable.iter().enumerate() {
            let off = OFF_ITABLE + i * 4;
            write_le_u16(out, off, slot.block)?;
            write_le_u16(out, off + 2, slot.live)?;
        }
        write_le_u16(out, OFF_STATE, self.state)?;
        write_le_u16(out, OFF_TOTAL_BLOCKS, self.total_blocks)?;
        Ok(())
    }
}

// ── Inode record ────────────────────────────────────────────────────────────

const OFF_UID: usize = 0;
const OFF_GID: usize = 2;
const OFF_MODE: usize = 4;
const OFF_LINKS: usize = 6;
const OFF_TIME: usize = 8;
const OFF_SIZE: usize = 12;
const OFF_BLOCKS: usize = 16;
const OFF_BLOCK_SLOTS: usize = 18;

/// Mode bits (POSIX layout; stored, never interpreted beyond the type).
pub const S_IFMT: u16 = 0xF000;
pub const S_IFSOCK: u16 = 0xC000;
pub const S_IFLNK: u16 = 0xA000;
pub const S_IFREG: u16 = 0x8000;
pub const S_IFBLK: u16 = 0x6000;
pub const S_IFDIR: u16 = 0x4000;
pub const S_IFCHR: u16 = 0x2000;
pub const S_IFIFO: u16 = 0x1000;

/// What an inode is, derived from its mode.
///
/// Capabilities hang off the kind: only mappable kinds own a block-pointer
/// tree, and only directories can be enumerated. Special files keep their
/// device number in block slot 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    RegularFile,
    Directory,
    Symlink,
    Special,
}

impl FileKind {
    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::RegularFile,
            S_IFDIR => Self::Directory,
            S_IFLNK => Self::Symlink,
            _ => Self::Special,
        }
    }

    /// Whether the inode's block slots form a mapping tree (rather than a
    /// device number).
    #[must_use]
    pub fn is_mappable(self) -> bool {
        matches!(self, Self::RegularFile | Self::Directory | Self::Symlink)
    }

    #[must_use]
    pub fn is_dir(self) -> bool {
        matches!(self, Self::Directory)
    }
}

/// The fixed 100-byte on-disk inode record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeRecord {
    pub uid: u16,
    pub gid: u16,
    pub mode: u16,
    pub links: u16,
    /// Single combined create/access/modify timestamp, seconds.
    pub time: u32,
    pub size: u32,
    /// Allocated space in 512-byte units.
    pub blocks: u16,
    /// 39 direct pointers, then single- and double-indirect roots.
    pub block: [u16; N_BLOCK_SLOTS],
}

impl Default for InodeRecord {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            mode: 0,
            links: 0,
            time: 0,
            size: 0,
            blocks: 0,
            block: [0; N_BLOCK_SLOTS],
        }
    }
}

impl InodeRecord {
    pub const DISK_SIZE: usize = 100;

    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < Self::DISK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: Self::DISK_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }
        let mut block = [0_u16; N_BLOCK_SLOTS];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = read_le_u16(bytes, OFF_BLOCK_SLOTS + i * 2)?;
        }
        Ok(Self {
            uid: read_le_u16(bytes, OFF_UID)?,
            gid: read_le_u16(bytes, OFF_GID)?,
            mode: read_le_u16(bytes, OFF_MODE)?,
            links: read_le_u16(bytes, OFF_LINKS)?,
            time: read_le_u32(bytes, OFF_TIME)?,
            size: read_le_u32(bytes, OFF_SIZE)?,
            blocks: read_le_u16(bytes, OFF_BLOCKS)?,
            block,
        })
    }

    pub fn encode_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        if out.len() < Self::DISK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: Self::DISK_SIZE,
                offset: 0,
                actual: out.len(),
            });
        }
        write_le_u16(out, OFF_UID, self.uid)?;
        write_le_u16(out, OFF_GID, self.gid)?;
        write_le_u16(out, OFF_MODE, self.mode)?;
        write_le_u16(out, OFF_LINKS, self.links)?;
        write_le_u32(out, OFF_TIME, self.time)?;
        write_le_u32(out, OFF_SIZE, self.size)?;
        write_le_u16(out, OFF_BLOCKS, self.blocks)?;
        for (i, slot) in self.block.iter().enumerate() {
            write_le_u16(out, OFF_BLOCK_SLOTS + i * 2, *slot)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    /// Byte offset of record `index` inside an inode-table block.
    #[must_use]
    pub fn offset_in_table_block(index: usize) -> usize {
        index * Self::DISK_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_types::STATE_ERROR;

    #[test]
    fn record_layout_is_100_bytes() {
        assert_eq!(OFF_BLOCK_SLOTS + N_BLOCK_SLOTS * 2, InodeRecord::DISK_SIZE);
        assert_eq!(InodeRecord::offset_in_table_block(9), 900);
    }

    #[test]
    fn group_meta_layout_fits_one_block() {
        assert_eq!(OFF_STATE, 940);
        assert_eq!(OFF_TOTAL_BLOCKS, 942);
        assert!(OFF_TOTAL_BLOCKS + 2 <= BLOCK_SIZE as usize);
    }

    #[test]
    fn group_meta_round_trips() {
        let mut meta = GroupMeta {
            state: STATE_VALID,
            total_blocks: 2880,
            ..GroupMeta::default()
        };
        meta.block_map[0] = 0x0F;
        meta.inode_map[22] = 0x80;
        meta.itable[0] = ItableSlot { block: 2, live: 4 };
        meta.itable[143] = ItableSlot {
            block: 1399,
            live: 1,
        };

        let mut block = vec![0_u8; BLOCK_SIZE as usize];
        meta.encode_into(&mut block).unwrap();
        let parsed = GroupMeta::parse(&block).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn group_meta_rejects_bad_magic() {
        let mut block = vec![0_u8; BLOCK_SIZE as usize];
        GroupMeta::default().encode_into(&mut block).unwrap();
        block[0] = 0xFF;
        let err = GroupMeta::parse(&block).unwrap_err();
        assert!(matches!(err, ParseError::InvalidMagic { .. }));
    }

    #[test]
    fn group_meta_rejects_bad_version() {
        let mut block = vec![0_u8; BLOCK_SIZE as usize];
        GroupMeta::default().encode_into(&mut block).unwrap();
        block[2] = 0x63; // version 99
        block[3] = 0;
        let err = GroupMeta::parse(&block).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidField {
                field: "version",
                ..
            }
        ));
    }

    #[test]
    fn error_state_survives_round_trip() {
        let meta = GroupMeta {
            state: STATE_ERROR,
            ..GroupMeta::default()
        };
        let mut block = vec![0_u8; BLOCK_SIZE as usize];
        meta.encode_into(&mut block).unwrap();
        assert_eq!(GroupMeta::parse(&block).unwrap().state, STATE_ERROR);
    }

    #[test]
    fn inode_record_round_trips() {
        let mut rec = InodeRecord {
            uid: 1000,
            gid: 100,
            mode: S_IFREG | 0o644,
            links: 1,
            time: 1_050_000_000,
            size: 40960,
            blocks: 80,
            ..InodeRecord::default()
        };
        rec.block[0] = 4;
        rec.block[38] = 99;
        rec.block[39] = 100;
        rec.block[40] = 200;

        let mut bytes = [0_u8; InodeRecord::DISK_SIZE];
        rec.encode_into(&mut bytes).unwrap();
        let parsed = InodeRecord::parse(&bytes).unwrap();
        assert_eq!(parsed, rec);
    }

    #[test]
    fn inode_record_parse_needs_full_record() {
        let bytes = [0_u8; 99];
        assert!(InodeRecord::parse(&bytes).is_err());
    }

    #[test]
    fn file_kind_from_mode() {
        assert_eq!(FileKind::from_mode(S_IFREG | 0o644), FileKind::RegularFile);
        assert_eq!(FileKind::from_mode(S_IFDIR | 0o755), FileKind::Directory);
        assert_eq!(FileKind::from_mode(S_IFLNK | 0o777), FileKind::Symlink);
        assert_eq!(FileKind::from_mode(S_IFCHR | 0o600), FileKind::Special);
        assert_eq!(FileKind::from_mode(S_IFIFO), FileKind::Special);
        assert_eq!(FileKind::from_mode(S_IFSOCK), FileKind::Special);
        assert_eq!(FileKind::from_mode(S_IFBLK), FileKind::Special);

        assert!(FileKind::Symlink.is_mappable());
        assert!(!FileKind::Special.is_mappable());
        assert!(FileKind::Directory.is_dir());
    }
}
