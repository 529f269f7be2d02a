//! Stop a loop when one of its configuration files changes.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Keeps the watch alive. Dropping it stops watching.
pub struct FileWatch {
    paths: Vec<PathBuf>,
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for FileWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatch")
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

/// Cancel `token` once any of `paths` is written, created, removed or
/// renamed. Reads do not count.
pub fn cancel_on_modify(
    token: &CancellationToken,
    paths: &[PathBuf],
) -> Result<FileWatch, notify::Error> {
    let cancel = token.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) if is_modification(&event.kind) => {
            if !cancel.is_cancelled() {
                info!(paths = ?event.paths, kind = ?event.kind, "watched file changed, stopping");
                cancel.cancel();
            }
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "file watch error"),
    })?;

    for path in paths {
        watcher.watch(path, RecursiveMode::NonRecursive)?;
    }
    Ok(FileWatch {
        paths: paths.to_vec(),
        _watcher: watcher,
    })
}

fn is_modification(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}
