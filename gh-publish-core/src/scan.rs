use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::contract::{ChangeSet, VcsPort};
use crate::error::PublishError;

/// Reads the current working-tree changes. Never caches; every call asks the
/// VCS again, so re-running a scan on resume is always safe.
#[derive(Clone)]
pub struct ScanStage {
    vcs: Arc<dyn VcsPort>,
}

impl ScanStage {
    pub fn new(vcs: Arc<dyn VcsPort>) -> Self {
        ScanStage { vcs }
    }

    pub async fn run(&self, repo: &Path) -> Result<ChangeSet, PublishError> {
        debug!(repo = %repo.display(), "Scanning working tree");
        let changes = self.vcs.status(repo).await?;
        info!(repo = %repo.display(), changes = changes.len(), "Scan complete");
        Ok(changes)
    }
}
