// SPDX-License-Identifier: MPL-2.0

use crate::{
    error::Errno,
    layers::{
        bio::{DeviceConfig, MemDevice},
        cache::BLOCK_CACHE_SIZE,
        crypto::Key,
        fs::{CreateMode, Fs},
        tree::{BlockRange, BlockTree, SetId, TreeId},
    },
};

fn test_key() -> Key {
    Key::from([7u8; 32])
}

fn test_config(block_size: usize) -> DeviceConfig {
    DeviceConfig {
        block_count: 256,
        block_size,
        block_num_size: 8,
        mac_size: 16,
        tamper_detecting: true,
    }
}

fn mount_clear(dev: &MemDevice) -> Fs {
    let mut fs = Fs::mount(Box::new(dev.clone()), None, test_key(), true).unwrap();
    // Leave more room for tests than the default 5/8 reservation.
    fs.reserved_count = 18;
    fs
}

fn remount(fs: Fs, dev: &MemDevice) -> Fs {
    drop(fs);
    let mut fs = Fs::mount(Box::new(dev.clone()), None, test_key(), false).unwrap();
    fs.reserved_count = 18;
    fs
}

fn free_set_ranges(fs: &mut Fs) -> String {
    let tx = fs.begin_transaction();
    let dump = fs.block_set_dump(tx, SetId::Free);
    fs.discard_transaction(tx);
    fs.end_transaction(tx);
    dump
}

fn free_block_count(fs: &mut Fs) -> u64 {
    let tx = fs.begin_transaction();
    let mut count = 0;
    let mut next = 0;
    loop {
        let range = fs.block_set_find_next_range(tx, SetId::Free, next);
        if range.is_empty() {
            break;
        }
        count += range.end - range.start;
        next = range.end;
    }
    fs.discard_transaction(tx);
    fs.end_transaction(tx);
    count
}

#[test]
fn mount_empty_and_commit() {
    let dev = MemDevice::new(test_config(256));
    let mut fs = mount_clear(&dev);

    let tx = fs.begin_transaction();
    fs.complete_transaction(tx).unwrap();
    fs.end_transaction(tx);
    assert_eq!(fs.super_block_version, 1);

    let mut fs = remount(fs, &dev);
    assert_eq!(fs.super_block_version, 1);
    let tx = fs.begin_transaction();
    assert!(fs.block_set_check(tx, SetId::Free));
    fs.discard_transaction(tx);
    fs.end_transaction(tx);
}

#[test]
fn create_write_read_back() {
    // Spec scenario: one full file block on a 2048-byte block device.
    let dev = MemDevice::new(test_config(2048));
    let mut fs = mount_clear(&dev);
    assert_eq!(fs.file_block_size(), 2032);

    let tx = fs.begin_transaction();
    let file = fs.open_file(tx, "test-file", CreateMode::Create).unwrap();
    fs.write_file(tx, file, 0, &[0x55u8; 2032]).unwrap();
    fs.complete_transaction(tx).unwrap();

    assert_eq!(fs.file_size(tx, file).unwrap(), 2032);
    let mut buf = vec![0u8; 2032];
    assert_eq!(fs.read_file(tx, file, 0, &mut buf).unwrap(), 2032);
    assert_eq!(buf, vec![0x55u8; 2032]);
    fs.close_file(file);
    fs.end_transaction(tx);

    // The data must survive a remount.
    let mut fs = remount(fs, &dev);
    let tx = fs.begin_transaction();
    let file = fs.open_file(tx, "test-file", CreateMode::NoCreate).unwrap();
    assert_eq!(fs.file_size(tx, file).unwrap(), 2032);
    let mut buf = vec![0u8; 2032];
    assert_eq!(fs.read_file(tx, file, 0, &mut buf).unwrap(), 2032);
    assert_eq!(buf, vec![0x55u8; 2032]);
    fs.close_file(file);
    fs.end_transaction(tx);
}

#[test]
fn partial_block_writes() {
    let dev = MemDevice::new(test_config(256));
    let mut fs = mount_clear(&dev);

    let tx = fs.begin_transaction();
    let file = fs.open_file(tx, "partial", CreateMode::Create).unwrap();
    fs.write_file(tx, file, 0, &[1u8; 100]).unwrap();
    // Overlapping partial write with read-modify-write.
    fs.write_file(tx, file, 60, &[2u8; 50]).unwrap();
    fs.complete_transaction(tx).unwrap();

    let mut buf = vec![0u8; 110];
    assert_eq!(fs.read_file(tx, file, 0, &mut buf).unwrap(), 110);
    assert_eq!(&buf[..60], &[1u8; 60][..]);
    assert_eq!(&buf[60..110], &[2u8; 50][..]);
    fs.close_file(file);
    fs.end_transaction(tx);
}

#[test]
fn write_spanning_blocks() {
    let dev = MemDevice::new(test_config(256));
    let mut fs = mount_clear(&dev);
    let fbs = fs.file_block_size();

    let data: Vec<u8> = (0..fbs * 3 + 17).map(|i| (i % 251) as u8).collect();
    let tx = fs.begin_transaction();
    let file = fs.open_file(tx, "spanning", CreateMode::Create).unwrap();
    fs.write_file(tx, file, 0, &data).unwrap();
    fs.complete_transaction(tx).unwrap();

    let mut buf = vec![0u8; data.len()];
    assert_eq!(fs.read_file(tx, file, 0, &mut buf).unwrap(), data.len());
    assert_eq!(buf, data);

    // Short read at the tail.
    let mut buf = vec![0u8; 100];
    let got = fs
        .read_file(tx, file, data.len() as u64 - 10, &mut buf)
        .unwrap();
    assert_eq!(got, 10);
    assert_eq!(&buf[..10], &data[data.len() - 10..]);
    fs.close_file(file);
    fs.end_transaction(tx);
}

#[test]
fn two_transaction_create_conflict() {
    // Spec scenario: A and B both create "x"; the loser detects the
    // conflict at commit and can see A's file in its next batch.
    let dev = MemDevice::new(test_config(256));
    let mut fs = mount_clear(&dev);

    let tx_a = fs.begin_transaction();
    let tx_b = fs.begin_transaction();
    let file_a = fs.open_file(tx_a, "x", CreateMode::Create).unwrap();
    let file_b = fs.open_file(tx_b, "x", CreateMode::Create).unwrap();
    fs.write_file(tx_a, file_a, 0, b"from a").unwrap();
    fs.write_file(tx_b, file_b, 0, b"from b").unwrap();

    fs.complete_transaction(tx_a).unwrap();
    assert_eq!(
        fs.complete_transaction(tx_b).unwrap_err().errno(),
        Errno::TxAborted
    );

    fs.close_file(file_b);
    let file_b = fs.open_file(tx_b, "x", CreateMode::NoCreate).unwrap();
    let mut buf = vec![0u8; 6];
    assert_eq!(fs.read_file(tx_b, file_b, 0, &mut buf).unwrap(), 6);
    assert_eq!(&buf, b"from a");

    fs.close_file(file_a);
    fs.close_file(file_b);
    fs.end_transaction(tx_a);
    fs.end_transaction(tx_b);
}

#[test]
fn cache_eviction_preserves_integrity() {
    // Touch more blocks than the cache holds, then verify every block.
    let dev = MemDevice::new(test_config(256));
    let mut fs = mount_clear(&dev);
    let fbs = fs.file_block_size();
    let blocks = BLOCK_CACHE_SIZE + 10;

    let tx = fs.begin_transaction();
    let file = fs.open_file(tx, "big", CreateMode::Create).unwrap();
    for i in 0..blocks {
        let pattern = vec![(i + 1) as u8; fbs];
        fs.write_file(tx, file, (i * fbs) as u64, &pattern).unwrap();
    }
    fs.complete_transaction(tx).unwrap();

    let mut buf = vec![0u8; fbs];
    for i in 0..blocks {
        assert_eq!(
            fs.read_file(tx, file, (i * fbs) as u64, &mut buf).unwrap(),
            fbs
        );
        assert_eq!(buf, vec![(i + 1) as u8; fbs], "block {} corrupted", i);
    }
    fs.close_file(file);
    fs.end_transaction(tx);
}

#[test]
fn delete_then_read_same_transaction() {
    let dev = MemDevice::new(test_config(256));
    let mut fs = mount_clear(&dev);
    let fbs = fs.file_block_size();

    let tx = fs.begin_transaction();
    let file = fs.open_file(tx, "y", CreateMode::Create).unwrap();
    fs.write_file(tx, file, 0, &vec![9u8; fbs]).unwrap();
    fs.complete_transaction(tx).unwrap();
    fs.close_file(file);
    fs.end_transaction(tx);

    let tx_a = fs.begin_transaction();
    let tx_b = fs.begin_transaction();
    let file_a = fs.open_file(tx_a, "y", CreateMode::NoCreate).unwrap();
    let file_b = fs.open_file(tx_b, "y", CreateMode::NoCreate).unwrap();

    fs.delete_file(tx_a, "y").unwrap();
    // A's handle is invalidated; reading through it fails A.
    let mut buf = vec![0u8; fbs];
    assert!(fs.read_file(tx_a, file_a, 0, &mut buf).is_err());
    assert!(fs.tx_failed(tx_a));

    // B still reads the pre-delete contents through its own handle.
    assert_eq!(fs.read_file(tx_b, file_b, 0, &mut buf).unwrap(), fbs);
    assert_eq!(buf, vec![9u8; fbs]);
    fs.complete_transaction(tx_b).unwrap();

    fs.close_file(file_a);
    fs.close_file(file_b);
    fs.end_transaction(tx_a);
    fs.end_transaction(tx_b);
}

#[test]
fn failed_transaction_frees_nothing() {
    // Allocate blocks in a transaction, fail it, and verify the free set
    // is untouched.
    let dev = MemDevice::new(test_config(256));
    let mut fs = mount_clear(&dev);
    let fbs = fs.file_block_size();

    let tx = fs.begin_transaction();
    fs.complete_transaction(tx).unwrap();
    fs.end_transaction(tx);
    let baseline = free_set_ranges(&mut fs);

    let tx = fs.begin_transaction();
    let file = fs.open_file(tx, "doomed", CreateMode::Create).unwrap();
    for i in 0..10u64 {
        fs.write_file(tx, file, i * fbs as u64, &vec![3u8; fbs]).unwrap();
    }
    fs.close_file(file);
    fs.discard_transaction(tx);
    fs.end_transaction(tx);

    assert_eq!(free_set_ranges(&mut fs), baseline);
}

#[test]
fn future_fs_version_refused() {
    let dev = MemDevice::new(test_config(256));
    let mut fs = mount_clear(&dev);

    let tx = fs.begin_transaction();
    let file = fs.open_file(tx, "f", CreateMode::Create).unwrap();
    fs.write_file(tx, file, 0, b"data").unwrap();
    fs.complete_transaction(tx).unwrap();
    fs.close_file(file);
    fs.end_transaction(tx);

    // Flip the low bit of fs_version (offset 28) in the current slot.
    // CTR mode is malleable, so the flip survives decryption; only the
    // version policy rejects the record.
    let slot = fs.super_block[(fs.super_block_version & 1) as usize];
    drop(fs.unmount());
    dev.corrupt_block(slot, 28);

    // A future filesystem refuses to mount, and refuses to be cleared.
    assert!(Fs::mount(Box::new(dev.clone()), None, test_key(), false).is_err());
    assert!(Fs::mount(Box::new(dev.clone()), None, test_key(), true).is_err());

    // Restore the version; the filesystem mounts and reads again.
    dev.corrupt_block(slot, 28);
    let mut fs = Fs::mount(Box::new(dev.clone()), None, test_key(), false).unwrap();
    let tx = fs.begin_transaction();
    let file = fs.open_file(tx, "f", CreateMode::NoCreate).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(fs.read_file(tx, file, 0, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"data");
    fs.close_file(file);
    fs.end_transaction(tx);
}

#[test]
fn boundary_checks() {
    let dev = MemDevice::new(test_config(256));
    let mut fs = mount_clear(&dev);

    let tx = fs.begin_transaction();
    let file = fs.open_file(tx, "b", CreateMode::Create).unwrap();
    fs.write_file(tx, file, 0, &[1u8; 50]).unwrap();

    // Writes and reads past the end are invalid; at the end they extend.
    assert_eq!(
        fs.write_file(tx, file, 51, b"x").unwrap_err().errno(),
        Errno::InvalidArgs
    );
    fs.write_file(tx, file, 50, &[2u8; 10]).unwrap();
    assert_eq!(fs.file_size(tx, file).unwrap(), 60);
    let mut buf = [0u8; 1];
    assert_eq!(
        fs.read_file(tx, file, 61, &mut buf).unwrap_err().errno(),
        Errno::InvalidArgs
    );

    // Only shrinking is supported.
    assert_eq!(
        fs.set_file_size(tx, file, 100).unwrap_err().errno(),
        Errno::InvalidArgs
    );
    fs.set_file_size(tx, file, 30).unwrap();
    assert_eq!(fs.file_size(tx, file).unwrap(), 30);

    fs.complete_transaction(tx).unwrap();
    assert_eq!(fs.file_size(tx, file).unwrap(), 30);
    fs.close_file(file);
    fs.end_transaction(tx);
}

#[test]
fn open_checks() {
    let dev = MemDevice::new(test_config(256));
    let mut fs = mount_clear(&dev);

    let tx = fs.begin_transaction();
    assert_eq!(
        fs.open_file(tx, "absent", CreateMode::NoCreate)
            .unwrap_err()
            .errno(),
        Errno::NotFound
    );
    assert_eq!(
        fs.delete_file(tx, "absent").unwrap_err().errno(),
        Errno::NotFound
    );

    let file = fs.open_file(tx, "once", CreateMode::Create).unwrap();
    // The same file cannot be opened twice in one transaction.
    assert_eq!(
        fs.open_file(tx, "once", CreateMode::Create)
            .unwrap_err()
            .errno(),
        Errno::InvalidArgs
    );
    fs.complete_transaction(tx).unwrap();

    assert_eq!(
        fs.open_file(tx, "once", CreateMode::CreateExclusive)
            .unwrap_err()
            .errno(),
        Errno::Exists
    );

    // Path validation.
    for path in ["", "bad/path", "bad path", "bad\u{e9}path"] {
        assert_eq!(
            fs.open_file(tx, path, CreateMode::Create).unwrap_err().errno(),
            Errno::InvalidArgs
        );
    }
    let long = "a".repeat(300);
    assert_eq!(
        fs.open_file(tx, &long, CreateMode::Create)
            .unwrap_err()
            .errno(),
        Errno::InvalidArgs
    );

    fs.close_file(file);
    fs.end_transaction(tx);
}

#[test]
fn delete_restores_space_and_name() {
    let dev = MemDevice::new(test_config(256));
    let mut fs = mount_clear(&dev);
    let fbs = fs.file_block_size();

    let tx = fs.begin_transaction();
    fs.complete_transaction(tx).unwrap();
    fs.end_transaction(tx);
    let baseline = free_block_count(&mut fs);

    let tx = fs.begin_transaction();
    let file = fs.open_file(tx, "tmp-file", CreateMode::Create).unwrap();
    for i in 0..5u64 {
        fs.write_file(tx, file, i * fbs as u64, &vec![4u8; fbs]).unwrap();
    }
    fs.complete_transaction(tx).unwrap();
    fs.close_file(file);

    fs.delete_file(tx, "tmp-file").unwrap();
    fs.complete_transaction(tx).unwrap();
    fs.end_transaction(tx);

    // The entry, its block map, and all data blocks return to the free
    // set; only the now-empty files tree root stays allocated.
    assert_eq!(free_block_count(&mut fs), baseline - 1);
    let tx = fs.begin_transaction();
    let file = fs
        .open_file(tx, "tmp-file", CreateMode::CreateExclusive)
        .unwrap();
    fs.close_file(file);
    fs.discard_transaction(tx);
    fs.end_transaction(tx);
}

#[test]
fn used_handle_cross_transaction_conflict() {
    // Two writers on the same committed file: the first commit wins, the
    // second transaction is failed at that commit.
    let dev = MemDevice::new(test_config(256));
    let mut fs = mount_clear(&dev);

    let tx = fs.begin_transaction();
    let file = fs.open_file(tx, "shared", CreateMode::Create).unwrap();
    fs.write_file(tx, file, 0, b"initial").unwrap();
    fs.complete_transaction(tx).unwrap();
    fs.close_file(file);
    fs.end_transaction(tx);

    let tx_a = fs.begin_transaction();
    let tx_b = fs.begin_transaction();
    let file_a = fs.open_file(tx_a, "shared", CreateMode::NoCreate).unwrap();
    let file_b = fs.open_file(tx_b, "shared", CreateMode::NoCreate).unwrap();
    fs.write_file(tx_a, file_a, 0, b"writerA").unwrap();
    fs.write_file(tx_b, file_b, 0, b"writerB").unwrap();

    fs.complete_transaction(tx_a).unwrap();
    assert!(fs.tx_failed(tx_b));
    let mut buf = [0u8; 7];
    assert_eq!(
        fs.read_file(tx_b, file_b, 0, &mut buf).unwrap_err().errno(),
        Errno::TxAborted
    );

    // After B gives up its batch, its handle follows the committed file.
    fs.discard_transaction(tx_b);
    assert_eq!(fs.read_file(tx_b, file_b, 0, &mut buf).unwrap(), 7);
    assert_eq!(&buf, b"writerA");

    fs.close_file(file_a);
    fs.close_file(file_b);
    fs.end_transaction(tx_a);
    fs.end_transaction(tx_b);
}

#[test]
fn reserved_space_blocks_commit() {
    let dev = MemDevice::new(test_config(256));
    let mut fs = mount_clear(&dev);
    let fbs = fs.file_block_size();

    // With an absurd reservation the commit must refuse.
    fs.reserved_count = 250;
    let tx = fs.begin_transaction();
    let file = fs.open_file(tx, "r", CreateMode::Create).unwrap();
    fs.write_file(tx, file, 0, &vec![1u8; fbs]).unwrap();
    fs.close_file(file);
    assert_eq!(
        fs.complete_transaction(tx).unwrap_err().errno(),
        Errno::TxAborted
    );
    fs.end_transaction(tx);

    // With a sane reservation the same write commits.
    fs.reserved_count = 18;
    let tx = fs.begin_transaction();
    let file = fs.open_file(tx, "r", CreateMode::Create).unwrap();
    fs.write_file(tx, file, 0, &vec![1u8; fbs]).unwrap();
    fs.complete_transaction(tx).unwrap();
    fs.close_file(file);
    fs.end_transaction(tx);
}

#[test]
fn out_of_space_fails_transaction() {
    let dev = MemDevice::new(test_config(256));
    let mut fs = mount_clear(&dev);
    let fbs = fs.file_block_size() as u64;

    let tx = fs.begin_transaction();
    let file = fs.open_file(tx, "filler", CreateMode::Create).unwrap();
    let mut offset = 0u64;
    let result = loop {
        match fs.write_file(tx, file, offset, &vec![0xa5u8; fbs as usize]) {
            Ok(()) => offset += fbs,
            Err(e) => break e,
        }
        assert!(offset < 300 * fbs, "device never filled up");
    };
    assert_eq!(result.errno(), Errno::TxAborted);
    fs.close_file(file);
    fs.discard_transaction(tx);

    // The engine stays usable after the failed transaction.
    let file = fs.open_file(tx, "small", CreateMode::Create).unwrap();
    fs.write_file(tx, file, 0, b"fits").unwrap();
    fs.complete_transaction(tx).unwrap();
    fs.close_file(file);
    fs.end_transaction(tx);
}

#[test]
fn superblock_version_advances_mod_4() {
    let dev = MemDevice::new(test_config(256));
    let mut fs = mount_clear(&dev);

    let mut last = fs.super_block_version;
    for i in 0..6 {
        let tx = fs.begin_transaction();
        let name = format!("file-{}", i);
        let file = fs.open_file(tx, &name, CreateMode::Create).unwrap();
        fs.write_file(tx, file, 0, b"v").unwrap();
        fs.complete_transaction(tx).unwrap();
        fs.close_file(file);
        fs.end_transaction(tx);

        assert_eq!(fs.super_block_version, (last + 1) & 3);
        last = fs.super_block_version;

        fs = remount(fs, &dev);
        assert_eq!(fs.super_block_version, last);
    }
}

#[test]
fn tampered_block_detected() {
    let dev = MemDevice::new(test_config(2048));
    let mut fs = mount_clear(&dev);

    let tx = fs.begin_transaction();
    let file = fs.open_file(tx, "sealed", CreateMode::Create).unwrap();
    fs.write_file(tx, file, 0, &[0x5au8; 100]).unwrap();
    fs.complete_transaction(tx).unwrap();
    fs.close_file(file);
    fs.end_transaction(tx);

    // Flip one ciphertext bit in every payload block, then remount so the
    // cache cannot mask the damage.
    let mut fs = remount(fs, &dev);
    for block in 2..256 {
        dev.corrupt_block(block, 100);
    }
    let tx = fs.begin_transaction();
    assert!(fs.open_file(tx, "sealed", CreateMode::NoCreate).is_err());
    assert!(fs.tx_failed(tx));
    fs.discard_transaction(tx);
    fs.end_transaction(tx);
}

#[test]
fn small_on_disk_widths() {
    // Truncated macs and two-byte block numbers, as used on RPMB-like
    // devices.
    let config = DeviceConfig {
        block_count: 256,
        block_size: 256,
        block_num_size: 2,
        mac_size: 2,
        tamper_detecting: true,
    };
    let dev = MemDevice::new(config);
    let mut fs = mount_clear(&dev);
    assert_eq!(fs.block_num_size, 2);
    assert_eq!(fs.mac_size, 2);

    let tx = fs.begin_transaction();
    let file = fs.open_file(tx, "narrow", CreateMode::Create).unwrap();
    let data: Vec<u8> = (0..600).map(|i| (i % 256) as u8).collect();
    fs.write_file(tx, file, 0, &data).unwrap();
    fs.complete_transaction(tx).unwrap();
    fs.close_file(file);
    fs.end_transaction(tx);

    let mut fs = remount(fs, &dev);
    let tx = fs.begin_transaction();
    let file = fs.open_file(tx, "narrow", CreateMode::NoCreate).unwrap();
    let mut buf = vec![0u8; 600];
    assert_eq!(fs.read_file(tx, file, 0, &mut buf).unwrap(), 600);
    assert_eq!(buf, data);
    fs.close_file(file);
    fs.end_transaction(tx);
}

#[test]
fn separate_super_device() {
    // A non-tamper-detecting main device with the superblocks on a small
    // tamper-detecting device, as with an RPMB-backed root of trust.
    let main_config = DeviceConfig {
        block_count: 256,
        block_size: 256,
        block_num_size: 8,
        mac_size: 16,
        tamper_detecting: false,
    };
    let super_config = DeviceConfig {
        block_count: 2,
        block_size: 256,
        block_num_size: 8,
        mac_size: 16,
        tamper_detecting: true,
    };
    let dev = MemDevice::new(main_config);
    let super_dev = MemDevice::new(super_config);

    let mut fs = Fs::mount(
        Box::new(dev.clone()),
        Some(Box::new(super_dev.clone())),
        test_key(),
        true,
    )
    .unwrap();
    fs.reserved_count = 18;
    assert_eq!(fs.min_block_num, 1);

    let tx = fs.begin_transaction();
    let file = fs.open_file(tx, "split-devices", CreateMode::Create).unwrap();
    fs.write_file(tx, file, 0, b"rooted elsewhere").unwrap();
    fs.complete_transaction(tx).unwrap();
    fs.close_file(file);
    fs.end_transaction(tx);

    drop(fs.unmount());
    let mut fs = Fs::mount(
        Box::new(dev.clone()),
        Some(Box::new(super_dev.clone())),
        test_key(),
        false,
    )
    .unwrap();
    let tx = fs.begin_transaction();
    let file = fs
        .open_file(tx, "split-devices", CreateMode::NoCreate)
        .unwrap();
    let mut buf = vec![0u8; 16];
    assert_eq!(fs.read_file(tx, file, 0, &mut buf).unwrap(), 16);
    assert_eq!(&buf, b"rooted elsewhere");
    fs.close_file(file);
    fs.end_transaction(tx);
}

#[test]
fn many_files() {
    let dev = MemDevice::new(test_config(256));
    let mut fs = mount_clear(&dev);

    let tx = fs.begin_transaction();
    for i in 0..30 {
        let name = format!("file-{:02}", i);
        let file = fs.open_file(tx, &name, CreateMode::Create).unwrap();
        fs.write_file(tx, file, 0, name.as_bytes()).unwrap();
        fs.close_file(file);
    }
    fs.complete_transaction(tx).unwrap();
    assert!(fs.tree_check(tx, TreeId::Files));

    for i in 0..30 {
        let name = format!("file-{:02}", i);
        let file = fs.open_file(tx, &name, CreateMode::NoCreate).unwrap();
        let mut buf = vec![0u8; name.len()];
        assert_eq!(fs.read_file(tx, file, 0, &mut buf).unwrap(), name.len());
        assert_eq!(buf, name.as_bytes());
        fs.close_file(file);
    }

    for i in 0..30 {
        let name = format!("file-{:02}", i);
        fs.delete_file(tx, &name).unwrap();
    }
    fs.complete_transaction(tx).unwrap();
    assert_eq!(
        fs.open_file(tx, "file-00", CreateMode::NoCreate)
            .unwrap_err()
            .errno(),
        Errno::NotFound
    );
    fs.end_transaction(tx);
}

#[test]
fn block_tree_insert_remove() {
    let dev = MemDevice::new(test_config(256));
    let mut fs = mount_clear(&dev);
    let tx = fs.begin_transaction();

    let tree = fs.scratch_push(BlockTree::new(256, 8, 24, 24));

    // Ascending, then descending inserts exercise both split directions.
    for key in 1..=40u64 {
        fs.tree_insert(tx, tree, key, key + 1000);
        assert!(fs.tree_check(tx, tree));
    }
    for key in (61..=100u64).rev() {
        fs.tree_insert(tx, tree, key, key + 1000);
    }
    assert!(fs.tree_check(tx, tree));

    // All inserted keys come back in order.
    let mut path = fs.tree_walk(tx, tree, 0, true);
    let mut seen = Vec::new();
    while path.key() != 0 {
        seen.push(path.key());
        assert_eq!(fs.block_mac_to_block(&path.data), path.key() + 1000);
        fs.tree_path_next(&mut path);
    }
    let expected: Vec<u64> = (1..=40).chain(61..=100).collect();
    assert_eq!(seen, expected);

    // Point lookups find exact keys and insertion points.
    let path = fs.tree_walk(tx, tree, 30, false);
    assert_eq!(path.key(), 30);
    let path = fs.tree_walk(tx, tree, 50, true);
    assert_eq!(path.key(), 40);

    // Removing every key in mixed order collapses the tree back to a
    // single leaf.
    for key in (1..=40u64).step_by(2).chain((2..=40u64).step_by(2)) {
        fs.tree_remove(tx, tree, key, key + 1000);
        assert!(fs.tree_check(tx, tree));
    }
    for key in 61..=100u64 {
        fs.tree_remove(tx, tree, key, key + 1000);
    }
    assert!(fs.tree_check(tx, tree));
    let path = fs.tree_walk(tx, tree, 0, true);
    assert_eq!(path.key(), 0);
    assert_eq!(path.count, 1);

    fs.scratch_pop(tree);
    fs.discard_transaction(tx);
    fs.end_transaction(tx);
}

#[test]
fn block_tree_update_entries() {
    let dev = MemDevice::new(test_config(256));
    let mut fs = mount_clear(&dev);
    let tx = fs.begin_transaction();

    let tree = fs.scratch_push(BlockTree::new(256, 8, 24, 24));
    for key in [10u64, 20, 30] {
        fs.tree_insert(tx, tree, key, key + 1);
    }
    // Data update at a fixed key, then a key update in place.
    fs.tree_update(tx, tree, 20, 21, 20, 99);
    let path = fs.tree_walk(tx, tree, 20, false);
    assert_eq!(fs.block_mac_to_block(&path.data), 99);
    fs.tree_update(tx, tree, 20, 99, 25, 99);
    let path = fs.tree_walk(tx, tree, 25, false);
    assert_eq!(path.key(), 25);
    assert!(fs.tree_check(tx, tree));

    fs.scratch_pop(tree);
    fs.discard_transaction(tx);
    fs.end_transaction(tx);
}

#[test]
fn block_set_range_arithmetic() {
    let dev = MemDevice::new(test_config(256));
    let mut fs = mount_clear(&dev);
    let tx = fs.begin_transaction();
    let set = SetId::Freed(tx);

    // Adjacent blocks merge into one range.
    fs.block_set_add_block(tx, set, 10);
    fs.block_set_add_block(tx, set, 12);
    assert_eq!(fs.block_set_dump(tx, set), " 10-10 12-12");
    fs.block_set_add_block(tx, set, 11);
    assert_eq!(fs.block_set_dump(tx, set), " 10-12");
    assert!(fs.block_set_check(tx, set));

    assert!(fs.block_set_block_in_set(tx, set, 11));
    assert!(!fs.block_set_block_in_set(tx, set, 13));
    assert!(fs.block_set_range_in_set(tx, set, BlockRange::new(10, 13)));
    assert!(fs.block_set_range_not_in_set(tx, set, BlockRange::new(13, 20)));
    assert_eq!(fs.block_set_find_next_block(tx, set, 5, true), 10);
    assert_eq!(fs.block_set_find_next_block(tx, set, 10, false), 13);
    assert_eq!(
        fs.block_set_find_next_range(tx, set, 11),
        BlockRange::new(11, 13)
    );

    // Removing the middle splits the range.
    fs.block_set_remove_block(tx, set, 11);
    assert_eq!(fs.block_set_dump(tx, set), " 10-10 12-12");
    assert!(fs.block_set_check(tx, set));

    // Add then remove a fresh range leaves the set as it was.
    fs.block_set_add_range(tx, set, BlockRange::new(30, 40));
    fs.block_set_remove_range(tx, set, BlockRange::new(30, 40));
    assert_eq!(fs.block_set_dump(tx, set), " 10-10 12-12");

    fs.block_set_remove_block(tx, set, 10);
    fs.block_set_remove_block(tx, set, 12);
    assert_eq!(fs.block_set_dump(tx, set), "");

    fs.discard_transaction(tx);
    fs.end_transaction(tx);
}

#[test]
fn block_set_overlap_detection() {
    let dev = MemDevice::new(test_config(256));
    let mut fs = mount_clear(&dev);
    let tx_a = fs.begin_transaction();
    let tx_b = fs.begin_transaction();

    fs.block_set_add_range(tx_a, SetId::Freed(tx_a), BlockRange::new(10, 20));
    fs.block_set_add_range(tx_b, SetId::Freed(tx_b), BlockRange::new(30, 40));
    assert!(!fs.block_set_overlap(tx_a, SetId::Freed(tx_a), SetId::Freed(tx_b)));
    fs.block_set_add_block(tx_b, SetId::Freed(tx_b), 15);
    assert!(fs.block_set_overlap(tx_a, SetId::Freed(tx_a), SetId::Freed(tx_b)));

    fs.discard_transaction(tx_a);
    fs.discard_transaction(tx_b);
    fs.end_transaction(tx_a);
    fs.end_transaction(tx_b);
}

#[test]
fn block_map_ops() {
    let dev = MemDevice::new(test_config(256));
    let mut fs = mount_clear(&dev);
    let tx = fs.begin_transaction();

    let block_mac_size = fs.block_num_size + fs.mac_size;
    let mut tree = BlockTree::new(256, fs.block_num_size, block_mac_size, block_mac_size);
    tree.copy_on_write = true;
    tree.allow_copy_on_write = true;
    let map = fs.scratch_push(tree);

    let mut blocks = Vec::new();
    for index in [0u64, 1, 5, 100] {
        let block = fs.block_allocate(tx);
        assert!(block != 0);
        let mut bm = crate::layers::tree::BlockMac::zero();
        fs.block_mac_set_block(&mut bm, block);
        fs.block_map_set(tx, map, index, Some(&bm));
        blocks.push((index, block));
    }
    for (index, block) in &blocks {
        let bm = fs.block_map_get(tx, map, *index).unwrap();
        assert_eq!(fs.block_mac_to_block(&bm), *block);
    }
    assert!(fs.block_map_get(tx, map, 3).is_none());

    // Clearing one mapping leaves the others.
    fs.block_map_set(tx, map, 1, None);
    assert!(fs.block_map_get(tx, map, 1).is_none());
    assert!(fs.block_map_get(tx, map, 5).is_some());

    // Truncating from index 5 frees the tail mappings.
    fs.block_map_truncate(tx, map, 5);
    assert!(fs.block_map_get(tx, map, 5).is_none());
    assert!(fs.block_map_get(tx, map, 100).is_none());
    assert!(fs.block_map_get(tx, map, 0).is_some());

    fs.block_map_free(tx, map);
    fs.scratch_pop(map);
    fs.discard_transaction(tx);
    fs.end_transaction(tx);
}

#[test]
fn allocator_basics() {
    let dev = MemDevice::new(test_config(256));
    let mut fs = mount_clear(&dev);
    let tx = fs.begin_transaction();

    let a = fs.block_allocate(tx);
    let b = fs.block_allocate(tx);
    let tmp = fs.block_allocate_etc(tx, true);
    assert!(a >= fs.min_block_num && b >= fs.min_block_num && tmp >= fs.min_block_num);
    assert_ne!(a, b);
    assert_ne!(a, tmp);
    assert!(fs.block_set_block_in_set(tx, SetId::Allocated(tx), a));
    assert!(fs.block_set_block_in_set(tx, SetId::TmpAllocated(tx), tmp));

    // Tmp allocations come from the high end of the device.
    assert!(tmp >= 256 / 4 * 3);

    // A freed tmp block leaves the tmp set; a freed persistent block
    // leaves the allocated set.
    fs.block_free_etc(tx, tmp, true);
    assert!(!fs.block_set_block_in_set(tx, SetId::TmpAllocated(tx), tmp));
    fs.block_free(tx, b);
    assert!(!fs.block_set_block_in_set(tx, SetId::Allocated(tx), b));
    assert!(!fs.block_set_block_in_set(tx, SetId::Freed(tx), b));

    fs.discard_transaction(tx);
    fs.end_transaction(tx);
}

#[test]
fn allocations_unique_across_transactions() {
    let dev = MemDevice::new(test_config(256));
    let mut fs = mount_clear(&dev);
    let tx_a = fs.begin_transaction();
    let tx_b = fs.begin_transaction();

    let mut seen = std::collections::HashSet::new();
    for _ in 0..20 {
        assert!(seen.insert(fs.block_allocate(tx_a)));
        assert!(seen.insert(fs.block_allocate(tx_b)));
    }

    fs.discard_transaction(tx_a);
    fs.discard_transaction(tx_b);
    fs.end_transaction(tx_a);
    fs.end_transaction(tx_b);
}
