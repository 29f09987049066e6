//! Host-directory seeding.
//!
//! Walks a host directory tree in parallel and materializes the same
//! hierarchy inside a volume through the public engine operations. The
//! volume is volatile, so this is how a template tree (a build image, a
//! cache layout) gets into a freshly created volume — and it doubles as a
//! realistic whole-engine workload for the end-to-end tests.
//!
//! Entries that no longer fit the byte budget are skipped and reported;
//! seeding never fails the walk as a whole.

pub mod progress;

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info};

use crate::error::FsError;
use crate::model::node::{
    filetime_from_system_time, FileAttributes, NodeIndex, Timestamps,
};
use crate::volume::Volume;

use progress::SeedProgress;

/// Maximum number of progress messages that may queue up in the channel.
/// If the consumer falls behind, the seed thread stalls briefly rather
/// than consuming unbounded heap.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 1_024;

/// Chunk size for streaming host file contents into the volume.
const COPY_CHUNK: usize = 256 * 1024;

/// Handle to a running or completed seed. Allows cancellation and
/// receiving progress updates.
pub struct SeedHandle {
    /// Receiver for progress updates from the seed thread.
    pub progress_rx: Receiver<SeedProgress>,
    /// Flag to request cancellation.
    cancel_flag: Arc<AtomicBool>,
    /// Join handle for the seed thread.
    _thread: Option<thread::JoinHandle<()>>,
}

impl SeedHandle {
    /// Request the seed to stop as soon as possible.
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::Relaxed)
    }
}

/// Seed `volume` from the host directory `source` on a background thread.
///
/// Returns a [`SeedHandle`] for receiving progress and requesting
/// cancellation. The source directory's *contents* land under the volume
/// root; the source directory itself is not represented.
pub fn start_seed(volume: Arc<Volume>, source: PathBuf) -> SeedHandle {
    let (progress_tx, progress_rx) =
        crossbeam_channel::bounded::<SeedProgress>(PROGRESS_CHANNEL_CAPACITY);
    let cancel_flag = Arc::new(AtomicBool::new(false));
    let cancel_clone = cancel_flag.clone();

    let thread = thread::Builder::new()
        .name("memvol-seeder".into())
        .spawn(move || {
            info!("seeding volume from {}", source.display());
            seed_volume(&volume, source, progress_tx, cancel_clone);
        })
        .expect("failed to spawn seeder thread");

    SeedHandle {
        progress_rx,
        cancel_flag,
        _thread: Some(thread),
    }
}

/// Walk `source` and materialize every entry inside the volume.
fn seed_volume(
    volume: &Volume,
    source: PathBuf,
    progress_tx: Sender<SeedProgress>,
    cancel_flag: Arc<AtomicBool>,
) {
    let start = Instant::now();

    // Map from host directory path to its node in the volume.
    let mut dir_map: HashMap<PathBuf, NodeIndex> = HashMap::with_capacity(4_096);
    dir_map.insert(source.clone(), NodeIndex::ROOT);

    let mut dirs_created: u64 = 0;
    let mut files_created: u64 = 0;
    let mut bytes_written: u64 = 0;
    let mut skipped: u64 = 0;
    let mut entry_counter: u64 = 0;

    let walker = jwalk::WalkDir::new(&source)
        .skip_hidden(false)
        .follow_links(false)
        .parallelism(jwalk::Parallelism::RayonNewPool(num_cpus::get()));

    for entry_result in walker {
        entry_counter += 1;
        if entry_counter % 1_000 == 0 && cancel_flag.load(Ordering::Relaxed) {
            let _ = progress_tx.send(SeedProgress::Cancelled);
            return;
        }

        let entry = match entry_result {
            Ok(entry) => entry,
            Err(err) => {
                skipped += 1;
                let _ = progress_tx.send(SeedProgress::Skipped {
                    path: String::new(),
                    reason: format!("{err}"),
                });
                continue;
            }
        };

        let path = entry.path();
        if path == source {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();

        let parent_path = match path.parent() {
            Some(parent) => parent.to_path_buf(),
            None => continue,
        };
        let parent = match dir_map.get(&parent_path) {
            Some(&index) => Some(index),
            None => ensure_ancestors(volume, &mut dir_map, &parent_path, &source),
        };
        let Some(parent) = parent else {
            skipped += 1;
            let _ = progress_tx.send(SeedProgress::Skipped {
                path: path.to_string_lossy().into_owned(),
                reason: "ancestor directory could not be created".to_string(),
            });
            continue;
        };

        if entry.file_type().is_dir() {
            match seed_directory(volume, parent, &name, &path) {
                Ok(index) => {
                    dir_map.insert(path.clone(), index);
                    dirs_created += 1;
                }
                Err(reason) => {
                    skipped += 1;
                    let _ = progress_tx.send(SeedProgress::Skipped {
                        path: path.to_string_lossy().into_owned(),
                        reason,
                    });
                }
            }
        } else {
            match seed_file(volume, parent, &name, &path) {
                Ok(bytes) => {
                    files_created += 1;
                    bytes_written += bytes;
                }
                Err(reason) => {
                    skipped += 1;
                    let _ = progress_tx.send(SeedProgress::Skipped {
                        path: path.to_string_lossy().into_owned(),
                        reason,
                    });
                }
            }
        }

        if entry_counter % 2_000 == 0 {
            let _ = progress_tx.send(SeedProgress::Update {
                dirs_created,
                files_created,
                bytes_written,
                current_path: path.to_string_lossy().into_owned(),
            });
        }
    }

    let duration = start.elapsed();
    debug!(
        ?duration,
        dirs_created, files_created, bytes_written, skipped, "seed walk complete"
    );
    let _ = progress_tx.send(SeedProgress::Complete {
        duration,
        dirs_created,
        files_created,
        bytes_written,
        skipped,
    });
}

/// Create a directory node mirroring `path`.
fn seed_directory(
    volume: &Volume,
    parent: NodeIndex,
    name: &str,
    path: &Path,
) -> Result<NodeIndex, String> {
    volume
        .create(
            parent,
            name,
            FileAttributes::DIRECTORY,
            0,
            host_times(path),
        )
        .map_err(|err| err.to_string())
}

/// Create a file node mirroring `path` and stream its contents in.
///
/// A file that stops fitting mid-copy is removed again so the volume never
/// holds silently truncated content.
fn seed_file(
    volume: &Volume,
    parent: NodeIndex,
    name: &str,
    path: &Path,
) -> Result<u64, String> {
    let attributes = match fs::metadata(path) {
        Ok(metadata) if metadata.permissions().readonly() => {
            FileAttributes::READONLY | FileAttributes::ARCHIVE
        }
        _ => FileAttributes::ARCHIVE,
    };
    let node = volume
        .create(parent, name, attributes, 0, host_times(path))
        .map_err(|err| err.to_string())?;

    match copy_contents(volume, node, path) {
        Ok(bytes) => Ok(bytes),
        Err(reason) => {
            volume.remove(parent, name);
            Err(reason)
        }
    }
}

/// Stream a host file into a volume node in fixed-size chunks.
fn copy_contents(volume: &Volume, node: NodeIndex, path: &Path) -> Result<u64, String> {
    let mut file = fs::File::open(path).map_err(|err| err.to_string())?;
    let mut buffer = vec![0u8; COPY_CHUNK];
    let mut offset = 0u64;
    loop {
        let read = file.read(&mut buffer).map_err(|err| err.to_string())?;
        if read == 0 {
            return Ok(offset);
        }
        let written = volume
            .write(node, offset, &buffer[..read])
            .map_err(|err| err.to_string())?;
        offset += written as u64;
        if written < read {
            return Err(FsError::Full.to_string());
        }
    }
}

/// Timestamps for a host entry: its modified time on all four stamps,
/// falling back to "now" when the host will not say.
fn host_times(path: &Path) -> Timestamps {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .map(|modified| Timestamps::all(filetime_from_system_time(modified)))
        .unwrap_or_else(|_| Timestamps::now())
}

/// Create any ancestor directories missing from `dir_map`, outermost
/// first, and return the node for `target`.
///
/// `None` means an ancestor could not be created (budget exhausted); the
/// caller skips the entry rather than placing it under the wrong parent.
fn ensure_ancestors(
    volume: &Volume,
    dir_map: &mut HashMap<PathBuf, NodeIndex>,
    target: &Path,
    source: &Path,
) -> Option<NodeIndex> {
    let mut missing: Vec<PathBuf> = Vec::new();
    let mut current = target.to_path_buf();

    while !dir_map.contains_key(&current) && current != *source {
        missing.push(current.clone());
        current = current.parent()?.to_path_buf();
    }

    let mut parent = dir_map.get(&current).copied().unwrap_or(NodeIndex::ROOT);
    for ancestor in missing.into_iter().rev() {
        let name = ancestor
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let index = match volume.create(
            parent,
            &name,
            FileAttributes::DIRECTORY,
            0,
            host_times(&ancestor),
        ) {
            Ok(index) => index,
            // Already present: the main loop created it, or the name
            // collides under a case-insensitive volume. Reuse it.
            Err(FsError::AlreadyExists) => volume.lookup(parent, &name)?.0,
            Err(_) => return None,
        };
        dir_map.insert(ancestor, index);
        parent = index;
    }
    Some(parent)
}
