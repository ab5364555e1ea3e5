//! Feeding filesystem changes into [Scheduler::invalidate_paths].
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::scheduler::Scheduler;

/// Consumes batches of changed paths, from an external watcher or a
/// [PollingWatcher], and invalidates the scheduler accordingly. Changes
/// outside of [Scheduler::watch]ed roots are ignored.
///
/// Stops when dropped.
pub struct InvalidationWatcher {
    task: JoinHandle<()>,
}

impl InvalidationWatcher {
    pub fn spawn<S>(scheduler: Scheduler, changes: S) -> Self
    where
        S: Stream<Item = Vec<PathBuf>> + Send + 'static,
    {
        let handle = scheduler.handle().clone();
        let task = handle.spawn(async move {
            let mut changes = std::pin::pin!(changes);
            while let Some(batch) = changes.next().await {
                let relevant: Vec<PathBuf> = batch
                    .into_iter()
                    .filter(|path| scheduler.is_watched(path))
                    .collect();
                if relevant.is_empty() {
                    continue;
                }

                let result = scheduler.invalidate_paths(&relevant);
                debug!(
                    changed = relevant.len(),
                    cleared = result.cleared,
                    generation = result.generation,
                    "processed changes"
                );
            }
            debug!("change stream ended");
        });

        Self { task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for InvalidationWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    File,
    Directory,
    Symlink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    kind: FileKind,
    size: u64,
    mtime: Option<SystemTime>,
}

/// Detects changes below the watched roots by comparing the kind, size and
/// mtime of everything in there between polls.
pub struct PollingWatcher {
    scheduler: Scheduler,
    interval: Duration,
    stamps: Option<HashMap<PathBuf, FileStamp>>,
}

impl PollingWatcher {
    pub fn new(scheduler: Scheduler, interval: Duration) -> Self {
        Self {
            scheduler,
            interval,
            stamps: None,
        }
    }

    /// Scans all watched roots and returns what changed since the last
    /// scan, sorted. The first scan only records the baseline.
    pub async fn poll_once(&mut self) -> io::Result<Vec<PathBuf>> {
        let roots = self.scheduler.watch_roots();
        let current = tokio::task::spawn_blocking(move || scan(&roots))
            .await
            .map_err(io::Error::other)?;

        let changed = match self.stamps.take() {
            None => vec![],
            Some(previous) => diff(&previous, &current),
        };
        self.stamps = Some(current);

        Ok(changed)
    }

    /// Polls every interval, yielding non-empty batches of changes.
    pub fn into_stream(self) -> impl Stream<Item = Vec<PathBuf>> + Send {
        futures::stream::unfold(self, |mut watcher| async move {
            loop {
                tokio::time::sleep(watcher.interval).await;
                match watcher.poll_once().await {
                    Ok(changed) if !changed.is_empty() => return Some((changed, watcher)),
                    Ok(_) => {}
                    Err(e) => warn!(err=%e, "failed to poll watched roots"),
                }
            }
        })
    }

    /// Takes the baseline, then feeds changes to an [InvalidationWatcher].
    pub async fn spawn(mut self) -> io::Result<InvalidationWatcher> {
        self.poll_once().await?;
        let scheduler = self.scheduler.clone();
        Ok(InvalidationWatcher::spawn(scheduler, self.into_stream()))
    }
}

fn scan(roots: &[PathBuf]) -> HashMap<PathBuf, FileStamp> {
    let mut stamps = HashMap::new();
    for root in roots {
        // missing roots are fine, they may show up later.
        for entry in WalkDir::new(root).follow_links(false).into_iter().flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let kind = if metadata.is_symlink() {
                FileKind::Symlink
            } else if metadata.is_dir() {
                FileKind::Directory
            } else {
                FileKind::File
            };
            stamps.insert(
                entry.into_path(),
                FileStamp {
                    kind,
                    // directory sizes are filesystem specific, and their
                    // mtime only moves when entries are added or removed,
                    // which are reported as the entries themselves.
                    size: if kind == FileKind::Directory { 0 } else { metadata.len() },
                    mtime: match kind {
                        FileKind::Directory => None,
                        _ => metadata.modified().ok(),
                    },
                },
            );
        }
    }
    stamps
}

fn diff(previous: &HashMap<PathBuf, FileStamp>, current: &HashMap<PathBuf, FileStamp>) -> Vec<PathBuf> {
    let mut changed: Vec<PathBuf> = current
        .iter()
        .filter(|(path, stamp)| previous.get(*path) != Some(*stamp))
        .map(|(path, _)| path.clone())
        .chain(
            previous
                .keys()
                .filter(|path| !current.contains_key(*path))
                .cloned(),
        )
        .collect();
    changed.sort();
    changed
}
