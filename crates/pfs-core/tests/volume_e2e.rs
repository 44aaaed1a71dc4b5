//! End-to-end volume tests over an in-memory device: the full life of a
//! filesystem from format through namespace churn to remount.

use pfs_block::{BlockDevice, ByteBlockDevice, MemByteDevice};
use pfs_core::{format, MountOptions, Owner, Volume};
use pfs_error::PfsError;
use pfs_ondisk::{FileKind, S_IFREG};
use pfs_types::{BlockNo, InodeNo, BLOCK_SIZE};

type MemVolume = Volume<ByteBlockDevice<MemByteDevice>>;

fn device(blocks: u32) -> MemByteDevice {
    MemByteDevice::new(blocks as usize * BLOCK_SIZE as usize)
}

fn mount(mem: &MemByteDevice) -> MemVolume {
    Volume::mount(
        ByteBlockDevice::new(mem.clone()).unwrap(),
        MountOptions::default(),
    )
    .unwrap()
}

fn fresh_volume(blocks: u32) -> (MemByteDevice, MemVolume) {
    let mem = device(blocks);
    format(&ByteBlockDevice::new(mem.clone()).unwrap()).unwrap();
    let vol = mount(&mem);
    (mem, vol)
}

fn touch<D: BlockDevice>(vol: &Volume<D>, parent: InodeNo, name: &[u8]) -> InodeNo {
    vol.create(parent, name, S_IFREG | 0o644, Owner::default())
        .unwrap()
}

#[test]
fn directory_round_trip_many_entries() {
    let (_mem, vol) = fresh_volume(1440);

    // Enough uniquely named entries to spill the root directory over
    // several blocks.
    let mut created = Vec::new();
    for i in 0..200_u32 {
        let name = format!("entry-{i:05}");
        created.push((name.clone(), touch(&vol, InodeNo::ROOT, name.as_bytes())));
    }
    for (name, ino) in &created {
        assert_eq!(vol.lookup(InodeNo::ROOT, name.as_bytes()).unwrap(), *ino);
    }

    let root = vol.read_inode(InodeNo::ROOT).unwrap();
    assert!(root.size > BLOCK_SIZE, "directory should have grown");

    // Delete one; the others stay findable, the victim does not.
    vol.unlink(InodeNo::ROOT, b"entry-00100").unwrap();
    assert!(matches!(
        vol.lookup(InodeNo::ROOT, b"entry-00100").unwrap_err(),
        PfsError::NotFound(_)
    ));
    for (name, ino) in created.iter().filter(|(n, _)| n != "entry-00100") {
        assert_eq!(vol.lookup(InodeNo::ROOT, name.as_bytes()).unwrap(), *ino);
    }
}

#[test]
fn slot_reuse_keeps_directory_size() {
    let (_mem, vol) = fresh_volume(1440);
    touch(&vol, InodeNo::ROOT, b"aaaaaaa");
    touch(&vol, InodeNo::ROOT, b"bbbbbbb");
    touch(&vol, InodeNo::ROOT, b"ccccccc");
    let size_before = vol.read_inode(InodeNo::ROOT).unwrap().size;

    // Same record length replaces the tombstone at the same offset.
    let old_offset = vol
        .list_dir(InodeNo::ROOT, 0)
        .unwrap()
        .entries
        .iter()
        .find(|e| e.name == b"bbbbbbb")
        .unwrap()
        .offset;
    vol.unlink(InodeNo::ROOT, b"bbbbbbb").unwrap();
    touch(&vol, InodeNo::ROOT, b"zzzzzzz");

    let entries = vol.list_dir(InodeNo::ROOT, 0).unwrap().entries;
    let new_offset = entries.iter().find(|e| e.name == b"zzzzzzz").unwrap().offset;
    assert_eq!(new_offset, old_offset);
    assert_eq!(vol.read_inode(InodeNo::ROOT).unwrap().size, size_before);
}

#[test]
fn list_dir_cursor_resumes() {
    let (_mem, vol) = fresh_volume(1440);
    for i in 0..50_u32 {
        touch(&vol, InodeNo::ROOT, format!("f{i:03}").as_bytes());
    }

    let all = vol.list_dir(InodeNo::ROOT, 0).unwrap();
    assert_eq!(all.entries.len(), 52); // . + .. + 50
    assert_eq!(all.next_cursor, vol.read_inode(InodeNo::ROOT).unwrap().size);

    // Resume from the 10th entry's offset: that entry comes back first.
    let tenth = &all.entries[10];
    let resumed = vol.list_dir(InodeNo::ROOT, tenth.offset).unwrap();
    assert_eq!(resumed.entries.first(), Some(tenth));
    assert_eq!(resumed.entries.len(), all.entries.len() - 10);
}

#[test]
fn truncate_reclaims_every_block() {
    let (_mem, vol) = fresh_volume(1440);
    let before = vol.statfs().free_blocks;

    let ino = touch(&vol, InodeNo::ROOT, b"big");
    let chunk = vec![0xA5_u8; BLOCK_SIZE as usize];
    // Deep into the double-indirect range.
    for lblk in [0_u32, 20, 38, 39, 200, 550, 551, 600, 1100] {
        vol.write_at(ino, lblk * BLOCK_SIZE, &chunk).unwrap();
    }
    assert!(vol.statfs().free_blocks < before);

    // Truncating to the current size changes nothing.
    let size = vol.read_inode(ino).unwrap().size;
    let mid = vol.statfs().free_blocks;
    vol.truncate(ino, size).unwrap();
    assert_eq!(vol.statfs().free_blocks, mid);

    // Truncating to zero returns the volume to its pre-write state: the
    // empty file's entry reused slack in the root block, so no block is
    // left behind.
    vol.truncate(ino, 0).unwrap();
    assert_eq!(vol.statfs().free_blocks, before);
    let rec = vol.read_inode(ino).unwrap();
    assert_eq!(rec.size, 0);
    assert_eq!(rec.blocks, 0);

    // And deleting the file restores the free-inode count too.
    let inodes_before = vol.statfs().free_inodes;
    vol.unlink(InodeNo::ROOT, b"big").unwrap();
    assert_eq!(vol.statfs().free_blocks, before);
    assert_eq!(vol.statfs().free_inodes, inodes_before + 1);
}

#[test]
fn double_indirect_data_survives_remount() {
    let (mem, vol) = fresh_volume(2880);
    let ino = touch(&vol, InodeNo::ROOT, b"deep");
    let payload: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i % 241) as u8).collect();
    for lblk in [0_u32, 39, 551, 552, 1062, 1063] {
        vol.write_at(ino, lblk * BLOCK_SIZE, &payload).unwrap();
    }
    vol.unmount().unwrap();

    let vol = mount(&mem);
    let ino = vol.lookup(InodeNo::ROOT, b"deep").unwrap();
    for lblk in [0_u32, 39, 551, 552, 1062, 1063] {
        assert_eq!(
            vol.read_at(ino, lblk * BLOCK_SIZE, BLOCK_SIZE as usize)
                .unwrap(),
            payload,
            "block {lblk} lost across remount"
        );
    }
}

#[test]
fn mkdir_rmdir_lifecycle() {
    let (_mem, vol) = fresh_volume(1440);
    let sub = vol
        .mkdir(InodeNo::ROOT, b"sub", 0o755, Owner { uid: 1, gid: 1 })
        .unwrap();

    let rec = vol.read_inode(sub).unwrap();
    assert!(rec.kind().is_dir());
    assert_eq!(rec.links, 2);
    assert_eq!(rec.size, BLOCK_SIZE);
    assert_eq!(vol.read_inode(InodeNo::ROOT).unwrap().links, 3);

    // "." points at the new directory, ".." at the root.
    let page = vol.list_dir(sub, 0).unwrap();
    assert_eq!(page.entries[0].name, b".");
    assert_eq!(page.entries[0].ino, sub);
    assert_eq!(page.entries[1].name, b"..");
    assert_eq!(page.entries[1].ino, InodeNo::ROOT);

    // A populated directory refuses rmdir.
    touch(&vol, sub, b"blocker");
    assert!(matches!(
        vol.rmdir(InodeNo::ROOT, b"sub").unwrap_err(),
        PfsError::NotEmpty
    ));

    vol.unlink(sub, b"blocker").unwrap();
    let free_before = vol.statfs().free_blocks;
    vol.rmdir(InodeNo::ROOT, b"sub").unwrap();
    assert!(matches!(
        vol.lookup(InodeNo::ROOT, b"sub").unwrap_err(),
        PfsError::NotFound(_)
    ));
    assert_eq!(vol.read_inode(InodeNo::ROOT).unwrap().links, 2);
    // The directory's data block came back.
    assert_eq!(vol.statfs().free_blocks, free_before + 1);
}

#[test]
fn hard_links_share_an_inode() {
    let (_mem, vol) = fresh_volume(1440);
    let ino = touch(&vol, InodeNo::ROOT, b"original");
    vol.write_at(ino, 0, b"shared bytes").unwrap();

    vol.link(ino, InodeNo::ROOT, b"alias").unwrap();
    assert_eq!(vol.lookup(InodeNo::ROOT, b"alias").unwrap(), ino);
    assert_eq!(vol.read_inode(ino).unwrap().links, 2);

    // Dropping one name keeps the data alive.
    vol.unlink(InodeNo::ROOT, b"original").unwrap();
    assert_eq!(vol.read_inode(ino).unwrap().links, 1);
    assert_eq!(vol.read_at(ino, 0, 12).unwrap(), b"shared bytes");

    // Dropping the last name reclaims the inode.
    let free_inodes = vol.statfs().free_inodes;
    vol.unlink(InodeNo::ROOT, b"alias").unwrap();
    assert_eq!(vol.statfs().free_inodes, free_inodes + 1);

    // Directories cannot be hard-linked.
    let sub = vol.mkdir(InodeNo::ROOT, b"d", 0o755, Owner::default()).unwrap();
    assert!(matches!(
        vol.link(sub, InodeNo::ROOT, b"dlink").unwrap_err(),
        PfsError::NotPermitted
    ));
}

#[test]
fn rename_within_and_across_directories() {
    let (_mem, vol) = fresh_volume(1440);
    let a = vol.mkdir(InodeNo::ROOT, b"a", 0o755, Owner::default()).unwrap();
    let b = vol.mkdir(InodeNo::ROOT, b"b", 0o755, Owner::default()).unwrap();
    let file = touch(&vol, a, b"payload");

    // Plain rename within one directory.
    vol.rename(a, b"payload", a, b"renamed").unwrap();
    assert_eq!(vol.lookup(a, b"renamed").unwrap(), file);
    assert!(vol.lookup(a, b"payload").is_err());

    // Move across directories.
    vol.rename(a, b"renamed", b, b"moved").unwrap();
    assert_eq!(vol.lookup(b, b"moved").unwrap(), file);
    assert!(vol.lookup(a, b"renamed").is_err());

    // Replace an existing file: the victim's inode is reclaimed.
    let victim = touch(&vol, b, b"victim");
    let free_inodes = vol.statfs().free_inodes;
    vol.rename(b, b"moved", b, b"victim").unwrap();
    assert_eq!(vol.lookup(b, b"victim").unwrap(), file);
    assert_eq!(vol.statfs().free_inodes, free_inodes + 1);
    assert!(vol.read_inode(victim).is_err() || vol.read_inode(victim).unwrap().links == 0);
}

#[test]
fn rename_directory_repoints_dotdot() {
    let (_mem, vol) = fresh_volume(1440);
    let a = vol.mkdir(InodeNo::ROOT, b"a", 0o755, Owner::default()).unwrap();
    let b = vol.mkdir(InodeNo::ROOT, b"b", 0o755, Owner::default()).unwrap();
    let child = vol.mkdir(a, b"child", 0o755, Owner::default()).unwrap();
    assert_eq!(vol.read_inode(a).unwrap().links, 3);

    vol.rename(a, b"child", b, b"child").unwrap();

    // ".." now points at the new parent, and link counts moved with it.
    let page = vol.list_dir(child, 0).unwrap();
    assert_eq!(page.entries[1].name, b"..");
    assert_eq!(page.entries[1].ino, b);
    assert_eq!(vol.read_inode(a).unwrap().links, 2);
    assert_eq!(vol.read_inode(b).unwrap().links, 3);
}

#[test]
fn rename_over_empty_directory_reclaims_it() {
    let (_mem, vol) = fresh_volume(1440);
    let src = vol.mkdir(InodeNo::ROOT, b"src", 0o755, Owner::default()).unwrap();
    vol.mkdir(InodeNo::ROOT, b"dst", 0o755, Owner::default()).unwrap();

    let free_inodes = vol.statfs().free_inodes;
    vol.rename(InodeNo::ROOT, b"src", InodeNo::ROOT, b"dst").unwrap();
    assert_eq!(vol.lookup(InodeNo::ROOT, b"dst").unwrap(), src);
    assert!(vol.lookup(InodeNo::ROOT, b"src").is_err());
    // The replaced directory's inode and data block were freed.
    assert_eq!(vol.statfs().free_inodes, free_inodes + 1);
    // Root lost one link (src's "..") and gained one (dst entry now a dir
    // whose ".." already counted): net one down from 4.
    assert_eq!(vol.read_inode(InodeNo::ROOT).unwrap().links, 3);
}

#[test]
fn rename_over_populated_directory_is_refused() {
    let (_mem, vol) = fresh_volume(1440);
    vol.mkdir(InodeNo::ROOT, b"src", 0o755, Owner::default()).unwrap();
    let dst = vol.mkdir(InodeNo::ROOT, b"dst", 0o755, Owner::default()).unwrap();
    touch(&vol, dst, b"occupant");

    assert!(matches!(
        vol.rename(InodeNo::ROOT, b"src", InodeNo::ROOT, b"dst")
            .unwrap_err(),
        PfsError::NotEmpty
    ));
    // Nothing moved.
    assert!(vol.lookup(InodeNo::ROOT, b"src").is_ok());
    assert!(vol.lookup(dst, b"occupant").is_ok());
}

#[test]
fn multi_group_volume_spills_allocations() {
    // 4096 blocks → 3 groups (the last one short).
    let (_mem, vol) = fresh_volume(4096);
    let stats = vol.statfs();
    assert_eq!(stats.total_blocks, 4096);
    // Reserved: group 0 blocks 0..=3, plus block 0 of groups 1 and 2.
    assert_eq!(stats.free_blocks, 4096 - 4 - 2);

    // Fill past the first group's capacity.
    let ino = touch(&vol, InodeNo::ROOT, b"filler");
    let chunk = vec![7_u8; BLOCK_SIZE as usize];
    for lblk in 0..1500_u32 {
        vol.write_at(ino, lblk * BLOCK_SIZE, &chunk).unwrap();
    }
    let rec = vol.read_inode(ino).unwrap();
    assert_eq!(rec.size, 1500 * BLOCK_SIZE);
    // Some data must now live in group 1.
    let mapped = vol.resolve_block(ino, 1490, false).unwrap().unwrap();
    assert!(mapped.0 >= 1440, "expected spill into group 1, got {mapped}");

    // And it all comes back.
    vol.truncate(ino, 0).unwrap();
    assert_eq!(vol.statfs().free_blocks, 4096 - 4 - 2);
    vol.unlink(InodeNo::ROOT, b"filler").unwrap();
    assert_eq!(vol.statfs().free_blocks, 4096 - 4 - 2);
}

#[test]
fn inode_table_blocks_materialize_lazily() {
    let (_mem, vol) = fresh_volume(2880);
    for i in 0..25_u32 {
        touch(&vol, InodeNo::ROOT, format!("many-{i:03}").as_bytes());
    }
    let stats = vol.statfs();
    // Inodes 4..=9 share the preformatted table block; 10..=28 span two
    // lazily allocated ones.
    assert_eq!(stats.free_blocks, 2880 - 4 - 1 - 2);
    // 25 new inodes on top of group 0's four reserved and group 1's bit 0.
    assert_eq!(stats.free_inodes, 2880 - 4 - 1 - 25);

    // Deleting the inodes that own a lazily created table block frees the
    // block once the last of its ten records is gone.
    for i in 0..25_u32 {
        vol.unlink(InodeNo::ROOT, format!("many-{i:03}").as_bytes())
            .unwrap();
    }
    assert_eq!(vol.statfs().free_blocks, 2880 - 4 - 1);
    assert_eq!(vol.statfs().free_inodes, 2880 - 4 - 1);
}

#[test]
fn exhausting_space_is_no_space_and_clean() {
    let (_mem, vol) = fresh_volume(1440);
    let ino = touch(&vol, InodeNo::ROOT, b"hog");
    let chunk = vec![1_u8; BLOCK_SIZE as usize];
    let mut lblk = 0_u32;
    let err = loop {
        match vol.write_at(ino, lblk * BLOCK_SIZE, &chunk) {
            Ok(()) => lblk += 1,
            Err(err) => break err,
        }
    };
    assert!(matches!(err, PfsError::NoSpace));
    assert_eq!(vol.statfs().free_blocks, 0);

    // Everything written so far is intact and reclaimable.
    vol.truncate(ino, 0).unwrap();
    assert!(vol.statfs().free_blocks > 1400);
}

#[test]
fn flush_persists_asynchronous_mutations() {
    let (mem, vol) = fresh_volume(1440);
    touch(&vol, InodeNo::ROOT, b"lazy");

    // Before flush the device still holds the freshly formatted image.
    let probe = mount(&mem);
    assert!(probe.lookup(InodeNo::ROOT, b"lazy").is_err());
    drop(probe);

    vol.flush().unwrap();
    let probe = mount(&mem);
    assert_eq!(probe.lookup(InodeNo::ROOT, b"lazy").unwrap(), InodeNo(4));
}

#[test]
fn file_backed_volume_round_trips() -> anyhow::Result<()> {
    let file = tempfile::NamedTempFile::new()?;
    file.as_file().set_len(1440 * u64::from(BLOCK_SIZE))?;
    let dev = ByteBlockDevice::new(pfs_block::FileByteDevice::open(file.path())?)?;
    format(&dev)?;

    let vol = Volume::mount_path(file.path(), MountOptions::default())?;
    let ino = touch(&vol, InodeNo::ROOT, b"on-disk");
    vol.write_at(ino, 0, b"persisted")?;
    vol.unmount()?;

    let vol = Volume::mount_path(file.path(), MountOptions::default())?;
    let ino = vol.lookup(InodeNo::ROOT, b"on-disk")?;
    assert_eq!(vol.read_at(ino, 0, 9)?, b"persisted");
    assert_eq!(vol.read_inode(ino)?.kind(), FileKind::RegularFile);
    Ok(())
}

#[test]
fn statfs_serializes_for_tooling() {
    let (_mem, vol) = fresh_volume(1440);
    let json = serde_json::to_string(&vol.statfs()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed["total_blocks"], 1440);
    assert_eq!(parsed["block_size"], 1024);
}

#[test]
fn format_skips_tiny_trailing_fragment() {
    // 1441 blocks leaves a 1-block fragment past group 0: too small to be
    // a group, so the formatted size rounds down.
    let mem = device(1441);
    let dev = ByteBlockDevice::new(mem.clone()).unwrap();
    assert_eq!(format(&dev).unwrap(), 1440);
    let vol = mount(&mem);
    assert_eq!(vol.statfs().total_blocks, 1440);

    // 4 spare blocks is enough for a (tiny) second group.
    let mem = device(1444);
    let dev = ByteBlockDevice::new(mem.clone()).unwrap();
    assert_eq!(format(&dev).unwrap(), 1444);
    let vol = mount(&mem);
    let stats = vol.statfs();
    assert_eq!(stats.total_blocks, 1444);
    assert_eq!(stats.free_blocks, 1444 - 4 - 1);
}

#[test]
fn corrupted_directory_block_aborts_lookup() {
    let (mem, vol) = fresh_volume(1440);
    touch(&vol, InodeNo::ROOT, b"fine");
    vol.flush().unwrap();

    // Forge a live entry with zero name length directly on the device.
    let dev = ByteBlockDevice::new(mem.clone()).unwrap();
    let mut block = dev.read_block(BlockNo(3)).unwrap();
    // After ".", "..", and "fine" (rec_len 8): offset 19.
    let off = 5 + 6 + 8;
    block.as_mut_slice()[off] = 42;
    block.as_mut_slice()[off + 1] = 0;
    dev.write_block(BlockNo(3), block.as_slice()).unwrap();

    let vol = mount(&mem);
    let err = vol.lookup(InodeNo::ROOT, b"anything").unwrap_err();
    assert!(err.is_corruption());
}
