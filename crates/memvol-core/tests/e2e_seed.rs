//! End-to-end seeding tests.
//!
//! These exercise the real seeding path against a real temporary
//! directory: the background thread, the jwalk traversal, ancestor
//! resolution, engine creates and writes, and progress reporting. The
//! resulting volume is checked structurally and byte-for-byte.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use memvol_core::loader::{progress::SeedProgress, start_seed, SeedHandle};
use memvol_core::model::comb::SEGMENT_SIZE;
use memvol_core::{NodeIndex, Volume, VolumeOptions};

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Create a reproducible directory tree for seeding tests:
///
/// ```text
/// root/
///   alpha/
///     a.txt   (100 bytes of 0xAA)
///     b.rs    (200 bytes of 0xBB)
///   beta/
///     c.png   (300 bytes of 0xCC)
///   d.zip     (400 bytes of 0xDD)
/// ```
fn build_test_tree(root: &Path) {
    let alpha = root.join("alpha");
    let beta = root.join("beta");
    fs::create_dir_all(&alpha).unwrap();
    fs::create_dir_all(&beta).unwrap();

    write_bytes(&alpha.join("a.txt"), 0xAA, 100);
    write_bytes(&alpha.join("b.rs"), 0xBB, 200);
    write_bytes(&beta.join("c.png"), 0xCC, 300);
    write_bytes(&root.join("d.zip"), 0xDD, 400);
}

fn write_bytes(path: &Path, value: u8, count: usize) {
    let mut file = fs::File::create(path).unwrap();
    file.write_all(&vec![value; count]).unwrap();
}

fn test_volume(total_size: u64) -> Arc<Volume> {
    let options = VolumeOptions {
        total_size,
        ..VolumeOptions::default()
    };
    Arc::new(Volume::new(&options).unwrap())
}

/// Drain progress messages until `Complete`, panicking after a generous
/// timeout so a stuck seed cannot hang the suite.
fn drain_to_completion(handle: &SeedHandle) -> (u64, u64, u64) {
    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    loop {
        assert!(
            std::time::Instant::now() < deadline,
            "seed did not complete within 30 seconds"
        );
        match handle.progress_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(SeedProgress::Complete {
                dirs_created,
                files_created,
                bytes_written,
                ..
            }) => return (dirs_created, files_created, bytes_written),
            Ok(SeedProgress::Cancelled) => panic!("seed was unexpectedly cancelled"),
            Ok(_) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                panic!("seed channel disconnected before Complete was sent");
            }
        }
    }
}

fn resolve(volume: &Volume, parent: NodeIndex, name: &str) -> NodeIndex {
    volume
        .lookup(parent, name)
        .unwrap_or_else(|| panic!("missing entry {name}"))
        .0
}

// ── Tests ────────────────────────────────────────────────────────────────────

/// Every host entry must appear in the volume with the right shape,
/// sizes, and contents.
#[test]
fn seed_materializes_all_entries() {
    let tmp = TempDir::new().expect("failed to create temp dir");
    build_test_tree(tmp.path());

    let volume = test_volume(64 * SEGMENT_SIZE);
    let handle = start_seed(volume.clone(), tmp.path().to_path_buf());
    let (dirs, files, bytes) = drain_to_completion(&handle);

    assert_eq!(dirs, 2);
    assert_eq!(files, 4);
    assert_eq!(bytes, 1_000);
    volume.check_consistency();

    let alpha = resolve(&volume, NodeIndex::ROOT, "alpha");
    assert!(volume.get(alpha).is_directory());
    let a_txt = resolve(&volume, alpha, "a.txt");
    assert_eq!(volume.get(a_txt).file_size, 100);

    let mut contents = vec![0u8; 100];
    assert_eq!(volume.read(a_txt, 0, &mut contents), 100);
    assert!(contents.iter().all(|&b| b == 0xAA));

    let beta = resolve(&volume, NodeIndex::ROOT, "beta");
    let c_png = resolve(&volume, beta, "c.png");
    assert_eq!(volume.get(c_png).file_size, 300);

    let d_zip = resolve(&volume, NodeIndex::ROOT, "d.zip");
    assert_eq!(volume.get(d_zip).file_size, 400);

    // Root enumeration shows exactly the three top-level entries.
    let entries = volume.children_from(NodeIndex::ROOT, None);
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "beta", "d.zip"]);
}

/// Seeding an empty directory succeeds and leaves the volume empty.
#[test]
fn seed_empty_directory() {
    let tmp = TempDir::new().expect("failed to create temp dir");
    let volume = test_volume(4 * SEGMENT_SIZE);

    let handle = start_seed(volume.clone(), tmp.path().to_path_buf());
    let (dirs, files, bytes) = drain_to_completion(&handle);

    assert_eq!((dirs, files, bytes), (0, 0, 0));
    assert!(!volume.has_children(NodeIndex::ROOT));
    volume.check_consistency();
}

/// Cancellation must surface a terminal message within the timeout.
#[test]
fn seed_cancellation_sends_terminal_message() {
    let tmp = TempDir::new().expect("failed to create temp dir");
    build_test_tree(tmp.path());

    let volume = test_volume(64 * SEGMENT_SIZE);
    let handle = start_seed(volume.clone(), tmp.path().to_path_buf());
    // The seed may already be done by the time the flag is read, so both
    // terminal messages are acceptable.
    handle.cancel();
    assert!(handle.is_cancelled());

    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    let mut terminal = false;
    while std::time::Instant::now() < deadline {
        match handle.progress_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(SeedProgress::Cancelled) | Ok(SeedProgress::Complete { .. }) => {
                terminal = true;
                break;
            }
            Ok(_) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    assert!(terminal, "seed must send Cancelled or Complete within 30 s");
    volume.check_consistency();
}

/// A volume too small for the tree reports skipped entries, stays
/// structurally consistent, and never holds a silently truncated file.
#[test]
fn seed_with_exhausted_budget_skips_and_stays_consistent() {
    let tmp = TempDir::new().expect("failed to create temp dir");
    // One file larger than the whole volume.
    write_bytes(&tmp.path().join("huge.bin"), 0xEE, 2 * SEGMENT_SIZE as usize);
    write_bytes(&tmp.path().join("tiny.bin"), 0x11, 16);

    let volume = test_volume(SEGMENT_SIZE);
    let handle = start_seed(volume.clone(), tmp.path().to_path_buf());

    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    let mut skipped_paths = Vec::new();
    loop {
        assert!(
            std::time::Instant::now() < deadline,
            "seed did not complete within 30 seconds"
        );
        match handle.progress_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(SeedProgress::Skipped { path, .. }) => skipped_paths.push(path),
            Ok(SeedProgress::Complete { skipped, .. }) => {
                assert_eq!(skipped as usize, skipped_paths.len());
                break;
            }
            Ok(_) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                panic!("seed channel disconnected before Complete was sent")
            }
        }
    }

    assert!(
        skipped_paths.iter().any(|p| p.ends_with("huge.bin")),
        "the oversized file must be reported as skipped"
    );
    // The oversized file was rolled back entirely.
    assert!(volume.lookup(NodeIndex::ROOT, "huge.bin").is_none());
    // The small file fits regardless of walk order.
    let tiny = resolve(&volume, NodeIndex::ROOT, "tiny.bin");
    assert_eq!(volume.get(tiny).file_size, 16);
    volume.check_consistency();
}
