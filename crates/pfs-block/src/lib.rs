#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the `ByteDevice` and `BlockDevice` traits, a file-backed device
//! using pread/pwrite style I/O, an in-memory device for tests, and the
//! write-back `BufferCache` every metadata structure is read and written
//! through. The cache supports dropping a buffer without write-back
//! (`forget`), which truncation relies on to avoid resurrecting freed
//! indirection blocks.

use parking_lot::Mutex;
use pfs_error::{PfsError, Result};
use pfs_types::{BlockNo, BLOCK_SIZE};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Owned copy of one 1 KiB block.
///
/// Invariant: length == `BLOCK_SIZE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        debug_assert_eq!(bytes.len(), BLOCK_SIZE as usize);
        Self { bytes }
    }

    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            bytes: vec![0_u8; BLOCK_SIZE as usize],
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }

    /// 16-bit little-endian pointer at `index` (indirection block layout).
    #[must_use]
    pub fn ptr_at(&self, index: usize) -> u16 {
        let off = index * 2;
        u16::from_le_bytes([self.bytes[off], self.bytes[off + 1]])
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| PfsError::Format("read range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(PfsError::Format(format!(
                "read out of bounds: offset={offset} len={} device_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(PfsError::ReadOnly);
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| PfsError::Format("write range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(PfsError::Format(format!(
                "write out of bounds: offset={offset} len={} device_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device, shared and thread-safe. The test double for
/// everything above the device layer.
#[derive(Debug, Clone)]
pub struct MemByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0_u8; len])),
        }
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| PfsError::Format("offset overflows usize".to_owned()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| PfsError::Format("read range overflow".to_owned()))?;
        let bytes = self.bytes.lock();
        if end > bytes.len() {
            return Err(PfsError::Format("read out of bounds".to_owned()));
        }
        buf.copy_from_slice(&bytes[start..end]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| PfsError::Format("offset overflows usize".to_owned()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| PfsError::Format("write range overflow".to_owned()))?;
        let mut bytes = self.bytes.lock();
        if end > bytes.len() {
            return Err(PfsError::Format("write out of bounds".to_owned()));
        }
        bytes[start..end].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNo) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `BLOCK_SIZE`.
    fn write_block(&self, block: BlockNo, data: &[u8]) -> Result<()>;

    /// Total number of blocks.
    fn block_count(&self) -> u32;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Adapter exposing a `ByteDevice` as fixed 1 KiB blocks.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_count: u32,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D) -> Result<Self> {
        let len = inner.len_bytes();
        let remainder = len % u64::from(BLOCK_SIZE);
        if remainder != 0 {
            return Err(PfsError::Format(format!(
                "image length is not block-aligned: len_bytes={len} remainder={remainder}"
            )));
        }
        let block_count = u32::try_from(len / u64::from(BLOCK_SIZE))
            .map_err(|_| PfsError::Format("device too large".to_owned()))?;
        Ok(Self { inner, block_count })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNo) -> Result<BlockBuf> {
        if u32::from(block.0) >= self.block_count {
            return Err(PfsError::Format(format!(
                "block out of range: block={block} block_count={}",
                self.block_count
            )));
        }
        let offset = u64::from(block.0) * u64::from(BLOCK_SIZE);
        let mut buf = vec![0_u8; BLOCK_SIZE as usize];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNo, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE as usize {
            return Err(PfsError::Format(format!(
                "write_block data size mismatch: got={} expected={BLOCK_SIZE}",
                data.len()
            )));
        }
        if u32::from(block.0) >= self.block_count {
            return Err(PfsError::Format(format!(
                "block out of range: block={block} block_count={}",
                self.block_count
            )));
        }
        let offset = u64::from(block.0) * u64::from(BLOCK_SIZE);
        self.inner.write_all_at(offset, data)?;
        Ok(())
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

#[derive(Debug)]
struct Frame {
    bytes: Vec<u8>,
    dirty: bool,
}

/// Write-back buffer cache over a `BlockDevice`.
///
/// Reads fill the cache; writes update the cached frame and mark it dirty
/// without touching the device. Dirty frames reach the device through
/// `flush_block` (write one frame and wait) or `flush_all`. `forget` drops
/// a frame without write-back.
///
/// Block contents are handed out as owned `BlockBuf` copies; callers write
/// whole blocks back rather than mutating through aliased pointers.
#[derive(Debug)]
pub struct BufferCache<D: BlockDevice> {
    dev: D,
    frames: Mutex<HashMap<BlockNo, Frame>>,
}

impl<D: BlockDevice> BufferCache<D> {
    #[must_use]
    pub fn new(dev: D) -> Self {
        Self {
            dev,
            frames: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.dev.block_count()
    }

    /// Read a block, from cache if resident.
    pub fn read(&self, block: BlockNo) -> Result<BlockBuf> {
        {
            let frames = self.frames.lock();
            if let Some(frame) = frames.get(&block) {
                return Ok(BlockBuf::new(frame.bytes.clone()));
            }
        }
        let buf = self.dev.read_block(block)?;
        let mut frames = self.frames.lock();
        // A racing writer may have populated the frame; its copy wins.
        let frame = frames.entry(block).or_insert_with(|| Frame {
            bytes: buf.as_slice().to_vec(),
            dirty: false,
        });
        Ok(BlockBuf::new(frame.bytes.clone()))
    }

    /// Get a block for overwriting: resident frame if any, otherwise a
    /// zero-filled frame that never touches the device. For blocks the
    /// caller is about to initialize completely.
    pub fn get_or_create(&self, block: BlockNo) -> Result<BlockBuf> {
        if u32::from(block.0) >= self.dev.block_count() {
            return Err(PfsError::Format(format!(
                "block out of range: block={block} block_count={}",
                self.dev.block_count()
            )));
        }
        let mut frames = self.frames.lock();
        let frame = frames.entry(block).or_insert_with(|| Frame {
            bytes: vec![0_u8; BLOCK_SIZE as usize],
            dirty: false,
        });
        Ok(BlockBuf::new(frame.bytes.clone()))
    }

    /// Replace a block's cached contents and mark the frame dirty.
    pub fn write(&self, block: BlockNo, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE as usize {
            return Err(PfsError::Format(format!(
                "cache write size mismatch: got={} expected={BLOCK_SIZE}",
                data.len()
            )));
        }
        let mut frames = self.frames.lock();
        frames.insert(
            block,
            Frame {
                bytes: data.to_vec(),
                dirty: true,
            },
        );
        Ok(())
    }

    /// Mark a resident frame dirty without changing its contents.
    pub fn mark_dirty(&self, block: BlockNo) {
        let mut frames = self.frames.lock();
        if let Some(frame) = frames.get_mut(&block) {
            frame.dirty = true;
        }
    }

    /// Write one frame to the device and wait for the write to be
    /// acknowledged. No-op for clean or absent frames.
    pub fn flush_block(&self, block: BlockNo) -> Result<()> {
        let bytes = {
            let mut frames = self.frames.lock();
            match frames.get_mut(&block) {
                Some(frame) if frame.dirty => {
                    frame.dirty = false;
                    frame.bytes.clone()
                }
                _ => return Ok(()),
            }
        };
        self.dev.write_block(block, &bytes)?;
        self.dev.sync()
    }

    /// Drop a frame without write-back. Used when the block has been freed
    /// and its contents must not reach the device.
    pub fn forget(&self, block: BlockNo) {
        trace!(block = block.0, "forgetting cached block");
        self.frames.lock().remove(&block);
    }

    /// Write every dirty frame back and sync the device once.
    pub fn flush_all(&self) -> Result<()> {
        let dirty: Vec<(BlockNo, Vec<u8>)> = {
            let mut frames = self.frames.lock();
            frames
                .iter_mut()
                .filter(|(_, frame)| frame.dirty)
                .map(|(block, frame)| {
                    frame.dirty = false;
                    (*block, frame.bytes.clone())
                })
                .collect()
        };
        for (block, bytes) in dirty {
            self.dev.write_block(block, &bytes)?;
        }
        self.dev.sync()
    }

    /// Drop every frame. Dirty frames are discarded; call `flush_all`
    /// first when their contents matter.
    pub fn release(&self) {
        self.frames.lock().clear();
    }
}
