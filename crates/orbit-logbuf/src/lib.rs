//! Bounded in-memory log ring with optional rotating file persistence.
//!
//! The supervisor streams child stdout/stderr lines into a [`LogRing`];
//! the newest `max_lines` entries stay queryable in memory. With
//! persistence enabled, added lines are also buffered and flushed to a
//! file one second after the first unflushed line arrives, rotating the
//! file once it crosses a size threshold.
//!
//! Flush and rotation failures never reach callers: failed lines are
//! requeued for the next flush and the in-memory ring is unaffected.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

const FLUSH_DEBOUNCE: Duration = Duration::from_secs(1);

/// File persistence knobs for a [`LogRing`].
#[derive(Debug, Clone)]
pub struct PersistSettings {
    /// Target file for appended lines.
    pub path: PathBuf,
    /// Size threshold that triggers rotation to `<path>.1`.
    pub max_size: u64,
    /// Total number of files kept (active plus rotated siblings).
    pub max_files: usize,
}

struct RingState {
    lines: VecDeque<String>,
    pending: Vec<String>,
    flush_scheduled: bool,
}

struct Inner {
    max_lines: usize,
    persist: Option<PersistSettings>,
    state: Mutex<RingState>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Bounded FIFO of formatted log lines.
///
/// Cloning is cheap and all clones share the same buffer.
#[derive(Clone)]
pub struct LogRing {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LogRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogRing")
            .field("max_lines", &self.inner.max_lines)
            .field("len", &self.len())
            .finish()
    }
}

impl LogRing {
    /// In-memory ring without file persistence.
    pub fn new(max_lines: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_lines: max_lines.max(1),
                persist: None,
                state: Mutex::new(RingState {
                    lines: VecDeque::new(),
                    pending: Vec::new(),
                    flush_scheduled: false,
                }),
            }),
        }
    }

    /// Ring with file persistence; loads the tail of an existing file so
    /// `get` returns historical context across restarts.
    pub fn with_persistence(max_lines: usize, persist: PersistSettings) -> Self {
        let max_lines = max_lines.max(1);
        let mut lines = VecDeque::new();
        match std::fs::read_to_string(&persist.path) {
            Ok(content) => {
                for line in content.lines().filter(|l| !l.is_empty()) {
                    if lines.len() == max_lines {
                        lines.pop_front();
                    }
                    lines.push_back(line.to_string());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                debug!(path = %persist.path.display(), error = %e, "could not load log history");
            }
        }

        Self {
            inner: Arc::new(Inner {
                max_lines,
                persist: Some(persist),
                state: Mutex::new(RingState {
                    lines,
                    pending: Vec::new(),
                    flush_scheduled: false,
                }),
            }),
        }
    }

    /// Append a formatted line, evicting the oldest on overflow.
    ///
    /// With persistence enabled this also buffers the line and arms a
    /// debounced flush; must be called from within a tokio runtime.
    pub fn add(&self, line: impl Into<String>) {
        let line = line.into();
        let schedule = {
            let mut state = self.inner.lock_state();
            if state.lines.len() == self.inner.max_lines {
                state.lines.pop_front();
            }
            state.lines.push_back(line.clone());

            if self.inner.persist.is_some() {
                state.pending.push(line);
                if !state.flush_scheduled {
                    state.flush_scheduled = true;
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };

        if schedule {
            let ring = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(FLUSH_DEBOUNCE).await;
                ring.flush().await;
            });
        }
    }

    /// The last `limit` entries (or the whole buffer), oldest first.
    pub fn get(&self, limit: Option<usize>) -> Vec<String> {
        let state = self.inner.lock_state();
        let len = state.lines.len();
        let take = limit.unwrap_or(len).min(len);
        state.lines.iter().skip(len - take).cloned().collect()
    }

    /// Number of buffered lines.
    pub fn len(&self) -> usize {
        self.inner.lock_state().lines.len()
    }

    /// Whether the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all in-memory entries (pending persistence is kept).
    pub fn clear(&self) {
        self.inner.lock_state().lines.clear();
    }

    /// Write buffered lines to the persistence file now.
    ///
    /// On failure the lines are returned to the front of the buffer for
    /// the next flush; the error is logged, not surfaced.
    pub async fn flush(&self) {
        let Some(persist) = self.inner.persist.clone() else {
            return;
        };

        let batch = {
            let mut state = self.inner.lock_state();
            state.flush_scheduled = false;
            std::mem::take(&mut state.pending)
        };
        if batch.is_empty() {
            return;
        }

        if let Err(e) = append_with_rotation(&persist, &batch).await {
            warn!(path = %persist.path.display(), error = %e, "log flush failed; requeueing");
            let mut state = self.inner.lock_state();
            let mut requeued = batch;
            requeued.extend(std::mem::take(&mut state.pending));
            state.pending = requeued;
        }
    }
}

async fn append_with_rotation(persist: &PersistSettings, batch: &[String]) -> Result<()> {
    if let Some(parent) = persist.path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create log dir {}", parent.display()))?;
    }

    let current_size = match tokio::fs::metadata(&persist.path).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };
    if current_size >= persist.max_size {
        rotate(persist).await;
    }

    let mut content = batch.join("\n");
    content.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&persist.path)
        .await
        .with_context(|| format!("failed to open log file {}", persist.path.display()))?;
    tokio::io::AsyncWriteExt::write_all(&mut file, content.as_bytes())
        .await
        .with_context(|| format!("failed to append to {}", persist.path.display()))?;
    Ok(())
}

/// Shift rotated siblings up one slot, move the live file to `<path>.1`,
/// then prune the oldest siblings past `max_files - 1`. Failures are
/// logged and never block the flush that triggered rotation.
async fn rotate(persist: &PersistSettings) {
    let keep = persist.max_files.saturating_sub(1);

    let mut siblings = rotated_siblings(persist).await;
    siblings.sort_unstable_by(|a, b| b.0.cmp(&a.0));
    for (index, path) in siblings {
        if index + 1 > keep {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                debug!(path = %path.display(), error = %e, "failed to prune rotated log");
            }
            continue;
        }
        let target = numbered(&persist.path, index + 1);
        if let Err(e) = tokio::fs::rename(&path, &target).await {
            debug!(path = %path.display(), error = %e, "failed to shift rotated log");
        }
    }

    if keep == 0 {
        if let Err(e) = tokio::fs::remove_file(&persist.path).await {
            debug!(path = %persist.path.display(), error = %e, "failed to drop rotated log");
        }
    } else if let Err(e) = tokio::fs::rename(&persist.path, numbered(&persist.path, 1)).await {
        debug!(path = %persist.path.display(), error = %e, "log rotation failed");
    }
}

fn numbered(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}", index));
    PathBuf::from(name)
}

async fn rotated_siblings(persist: &PersistSettings) -> Vec<(usize, PathBuf)> {
    let mut out = Vec::new();
    let Some(dir) = persist.path.parent() else {
        return out;
    };
    let Some(base) = persist.path.file_name().and_then(|n| n.to_str()) else {
        return out;
    };
    let prefix = format!("{}.", base);

    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return out;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(suffix) = name.strip_prefix(&prefix)
            && let Ok(index) = suffix.parse::<usize>()
        {
            out.push((index, entry.path()));
        }
    }
    out
}
