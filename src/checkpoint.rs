//! Per-role checkpoint: the JSON array of records finished so far.
//!
//! The file is rewritten in full after every item, so a crash loses at most
//! the item in flight. On resume the multiset of work items it holds is
//! exactly what counts as done.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{ResearchError, Result};
use crate::model::{ResultRecord, WorkItem};
use crate::session_store::atomic_write;

#[derive(Debug, Clone)]
pub struct CheckpointFile {
    path: PathBuf,
}

impl CheckpointFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Records saved so far; empty when no checkpoint exists yet.
    pub fn load(&self) -> Result<Vec<ResultRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)?;
        let records: Vec<ResultRecord> =
            serde_json::from_str(&data).map_err(|e| ResearchError::Checkpoint {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
        info!(
            path = %self.path.display(),
            records = records.len(),
            "resuming from checkpoint"
        );
        Ok(records)
    }

    pub fn save(&self, records: &[ResultRecord]) -> Result<()> {
        let data = serde_json::to_string_pretty(records)?;
        atomic_write(&self.path, &data)?;
        debug!(path = %self.path.display(), records = records.len(), "checkpoint saved");
        Ok(())
    }
}

/// Items still to process, with their input positions, after skipping one
/// input occurrence per item already recorded.
pub fn pending_items(items: &[WorkItem], done: &[ResultRecord]) -> Vec<(usize, WorkItem)> {
    let mut remaining: HashMap<&WorkItem, usize> = HashMap::new();
    for record in done {
        *remaining.entry(&record.work_item).or_default() += 1;
    }

    items
        .iter()
        .enumerate()
        .filter(|(_, item)| match remaining.get_mut(item) {
            Some(count) if *count > 0 => {
                *count -= 1;
                false
            }
            _ => true,
        })
        .map(|(index, item)| (index, item.clone()))
        .collect()
}
