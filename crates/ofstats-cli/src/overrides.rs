use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use ofstats_core::{OverrideTree, SpeedResolver, SpeedUnit};
use tokio::time::interval;
use tracing::{debug, warn};

pub fn read_tree(path: &Path, unit: SpeedUnit) -> Result<OverrideTree> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let tree = OverrideTree::parse(&text, unit).with_context(|| format!("parsing {}", path.display()))?;
    Ok(tree)
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Re-reads the override file whenever its modification time changes.
pub struct OverrideWatcher {
    path: PathBuf,
    resolver: Arc<SpeedResolver>,
    seen: Option<SystemTime>,
}

impl OverrideWatcher {
    pub fn new(path: PathBuf, resolver: Arc<SpeedResolver>) -> Self {
        Self {
            path,
            resolver,
            seen: None,
        }
    }

    /// Returns `true` when a new tree was swapped in. A missing or malformed
    /// file leaves the active tree as it is.
    pub fn check(&mut self) -> bool {
        let Some(stamp) = modified(&self.path) else {
            if self.seen.take().is_some() {
                warn!(path = %self.path.display(), "override file disappeared, keeping previous overrides");
            }
            return false;
        };
        if self.seen == Some(stamp) {
            return false;
        }
        self.seen = Some(stamp);

        match read_tree(&self.path, self.resolver.unit()) {
            Ok(tree) => {
                self.resolver.reload(tree);
                true
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %format!("{err:#}"), "override reload rejected");
                false
            }
        }
    }
}

pub async fn watch(mut watcher: OverrideWatcher, every: Duration) {
    let mut ticker = interval(every);
    loop {
        ticker.tick().await;
        if watcher.check() {
            debug!(path = %watcher.path.display(), "override file applied");
        }
    }
}
