// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use logfs::{FileSystem, OpenMode};
use logfs_block::BlockDriver;
use logfs_block_std::BlockDriverFile;

/// The `PendingCluster` marker: written first, flipped to `AllocatedCluster`
/// only once a cluster's header and payload are fully on disk. Simulating a
/// crash that stops right after a cluster reaches this marker — and never
/// reaches `AllocatedCluster` — is exactly "interrupting a single
/// block-driver write between operations": the marker byte for the
/// allocation step never lands.
const PENDING_CLUSTER_MARKER: u8 = 0xFC;

fn fresh_fs(dir: &tempfile::TempDir, device_size: u32) -> FileSystem<BlockDriverFile> {
    let path = dir.path().join("device.img");
    let driver = BlockDriverFile::create(&path, device_size, 4096, 512).unwrap();
    let fs = FileSystem::new(driver);
    fs.format().unwrap();
    fs
}

#[test]
fn write_then_read_all_bytes_roundtrips() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fresh_fs(&dir, 64 * 1024);
    fs.write_all_bytes("hello.txt", b"hello, flash").unwrap();
    assert_eq!(fs.read_all_bytes("hello.txt").unwrap(), b"hello, flash");
    assert_eq!(fs.get_file_size("hello.txt").unwrap(), 12);
}

#[test]
fn large_file_spans_multiple_clusters() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fresh_fs(&dir, 256 * 1024);
    let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    fs.write_all_bytes("big.bin", &data).unwrap();
    assert_eq!(fs.read_all_bytes("big.bin").unwrap(), data);
}

#[test]
fn create_deletes_any_existing_file_of_the_same_name() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fresh_fs(&dir, 64 * 1024);
    fs.write_all_bytes("a.txt", b"one").unwrap();
    let stream = fs.create("a.txt").unwrap();
    drop(stream);
    assert_eq!(fs.read_all_bytes("a.txt").unwrap(), b"");
}

#[test]
fn open_create_new_fails_when_file_exists() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fresh_fs(&dir, 64 * 1024);
    fs.write_all_bytes("a.txt", b"one").unwrap();
    assert!(fs.open("a.txt", OpenMode::CreateNew).is_err());
}

#[test]
fn delete_removes_file_and_frees_name() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fresh_fs(&dir, 64 * 1024);
    fs.write_all_bytes("a.txt", b"one").unwrap();
    fs.delete("a.txt").unwrap();
    assert!(!fs.exists("a.txt").unwrap());
    assert!(fs.read_all_bytes("a.txt").is_err());
}

#[test]
fn move_renames_without_changing_contents() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fresh_fs(&dir, 64 * 1024);
    fs.write_all_bytes("a.txt", b"payload").unwrap();
    fs.r#move("a.txt", "b.txt").unwrap();
    assert!(!fs.exists("a.txt").unwrap());
    assert_eq!(fs.read_all_bytes("b.txt").unwrap(), b"payload");
}

#[test]
fn copy_duplicates_contents_under_a_new_name() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fresh_fs(&dir, 64 * 1024);
    fs.write_all_bytes("a.txt", b"payload").unwrap();
    fs.copy("a.txt", "b.txt", false).unwrap();
    assert_eq!(fs.read_all_bytes("a.txt").unwrap(), b"payload");
    assert_eq!(fs.read_all_bytes("b.txt").unwrap(), b"payload");
}

#[test]
fn truncate_to_zero_keeps_the_file_cluster() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fresh_fs(&dir, 64 * 1024);
    fs.write_all_bytes("a.txt", b"payload").unwrap();
    let mut stream = fs.open("a.txt", OpenMode::Open).unwrap();
    stream.set_len(0).unwrap();
    drop(stream);
    assert_eq!(fs.get_file_size("a.txt").unwrap(), 0);
    assert_eq!(fs.read_all_bytes("a.txt").unwrap(), b"");
}

#[test]
fn truncate_past_end_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fresh_fs(&dir, 64 * 1024);
    fs.write_all_bytes("a.txt", b"payload").unwrap();
    let mut stream = fs.open("a.txt", OpenMode::Open).unwrap();
    assert!(stream.set_len(1000).is_err());
}

#[test]
fn filename_lookup_is_case_insensitive() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fresh_fs(&dir, 64 * 1024);
    fs.write_all_bytes("MixedCase.TXT", b"x").unwrap();
    assert!(fs.exists("mixedcase.txt").unwrap());
    assert_eq!(fs.read_all_bytes("MIXEDCASE.txt").unwrap(), b"x");
}

#[test]
fn remount_reconstructs_the_same_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device.img");
    {
        let driver = BlockDriverFile::create(&path, 64 * 1024, 4096, 512).unwrap();
        let fs = FileSystem::new(driver);
        fs.format().unwrap();
        fs.write_all_bytes("a.txt", b"one").unwrap();
        fs.write_all_bytes("b.txt", b"two").unwrap();
    }
    {
        let driver = BlockDriverFile::open(&path, 64 * 1024, 4096, 512).unwrap();
        let fs = FileSystem::new(driver);
        fs.mount().unwrap();
        let mut names = fs.get_files().unwrap();
        names.sort();
        assert_eq!(names, vec!["a.txt".to_string(), "b.txt".to_string()]);
        assert_eq!(fs.read_all_bytes("a.txt").unwrap(), b"one");
        assert_eq!(fs.read_all_bytes("b.txt").unwrap(), b"two");
    }
}

#[test]
fn mount_after_mount_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fresh_fs(&dir, 64 * 1024);
    fs.write_all_bytes("a.txt", b"one").unwrap();
    fs.mount().unwrap();
    assert_eq!(fs.read_all_bytes("a.txt").unwrap(), b"one");
}

#[test]
fn operations_before_mount_or_format_fail_with_not_mounted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device.img");
    let driver = BlockDriverFile::create(&path, 64 * 1024, 4096, 512).unwrap();
    let fs = FileSystem::new(driver);
    assert!(fs.exists("a.txt").is_err());
    assert!(fs.write_all_bytes("a.txt", b"x").is_err());
}

#[test]
fn repeated_overwrite_orphans_old_clusters_and_compaction_reclaims_them() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fresh_fs(&dir, 64 * 1024);
    for i in 0..200u32 {
        fs.write_all_bytes("churn.bin", &i.to_le_bytes()).unwrap();
    }
    let (_, orphaned_before) = fs.get_stats().unwrap();
    assert!(orphaned_before > 0);
    fs.compact().unwrap();
    let (_, orphaned_after) = fs.get_stats().unwrap();
    assert_eq!(orphaned_after, 0);
    assert_eq!(fs.read_all_bytes("churn.bin").unwrap(), 199u32.to_le_bytes());
}

#[test]
fn wear_stays_bounded_across_many_small_writes() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fresh_fs(&dir, 64 * 1024);
    for i in 0..2000u32 {
        fs.write_all_bytes("churn.bin", &i.to_le_bytes()).unwrap();
        if i % 50 == 0 {
            let (free, _) = fs.get_stats().unwrap();
            assert!(free > 0, "ran out of free space at iteration {i}");
        }
    }
}

#[test]
fn interrupted_create_before_marking_allocated_leaves_pre_operation_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device.img");
    let driver = BlockDriverFile::create(&path, 64 * 1024, 4096, 512).unwrap();
    let fs = FileSystem::new(driver);
    fs.format().unwrap();

    // Simulate a crash between `Inner::append_cluster_buf`'s two driver
    // writes: the new file's cluster lands with its header written and the
    // marker set to `PendingCluster`, but the following write that would
    // flip it to `AllocatedCluster` never happens.
    {
        let raw = BlockDriverFile::open(&path, 64 * 1024, 4096, 512).unwrap();
        raw.write(0, 0, &[PENDING_CLUSTER_MARKER]).unwrap();
    }

    // Remounting must not resurrect the interrupted create: a cluster stuck
    // at `PendingCluster` is orphaned garbage, not a file, so the device
    // comes back in its pre-operation (empty) state rather than a corrupted
    // or half-created one.
    let fs2 = FileSystem::new(BlockDriverFile::open(&path, 64 * 1024, 4096, 512).unwrap());
    fs2.mount().unwrap();
    assert!(fs2.get_files().unwrap().is_empty());

    // The device remains fully usable afterward; the stuck cluster is
    // ordinary orphaned space waiting on compaction.
    let (_, orphaned) = fs2.get_stats().unwrap();
    assert!(orphaned > 0);
    fs2.write_all_bytes("real.txt", b"data").unwrap();
    assert_eq!(fs2.read_all_bytes("real.txt").unwrap(), b"data");
}

#[test]
fn interrupted_overwrite_before_marking_allocated_keeps_old_contents() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device.img");
    {
        let driver = BlockDriverFile::create(&path, 64 * 1024, 4096, 512).unwrap();
        let fs = FileSystem::new(driver);
        fs.format().unwrap();
        fs.write_all_bytes("a.txt", b"original").unwrap();
    }

    // `create` consumed cluster 0 for the empty file header, then the
    // content write appended the real content to cluster 1 and orphaned
    // cluster 0 — so `a.txt`'s committed content now lives in cluster 1 and
    // the tail sits at cluster 2. A second overwrite would append its
    // replacement there, then orphan cluster 1 and flip cluster 2 to
    // `AllocatedCluster`. Simulate a crash that lands the replacement's
    // header as `PendingCluster` and gets no further: cluster 1 is never
    // touched.
    {
        let raw = BlockDriverFile::open(&path, 64 * 1024, 4096, 512).unwrap();
        raw.write(2, 0, &[PENDING_CLUSTER_MARKER]).unwrap();
    }

    // Remounting must yield the pre-operation state: `a.txt` still reads its
    // original content, since the interrupted overwrite never reached
    // `AllocatedCluster` and cluster 1 was never orphaned.
    let fs2 = FileSystem::new(BlockDriverFile::open(&path, 64 * 1024, 4096, 512).unwrap());
    fs2.mount().unwrap();
    assert_eq!(fs2.read_all_bytes("a.txt").unwrap(), b"original");
}
