//! Runs one batch driver per role concurrently over the same input.
//!
//! Each role writes into its own subdirectory with its own checkpoint, so
//! roles share no mutable state. A failing or panicking role is recorded and
//! never cancels its siblings.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::batch::{BatchDriver, BatchSettings};
use crate::checkpoint::CheckpointFile;
use crate::error::Result;
use crate::extract::union_attributes;
use crate::model::{ResultRecord, RoleContext, WorkItem};
use crate::report::ReportWriter;
use crate::service::JobService;

pub const ITEM_VIEW_FILE: &str = "combined_by_item.json";

pub fn checkpoint_name(role: &str) -> String {
    format!("{role}_batch_results.json")
}

/// Merged results of a multi-role run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RoleOutcomes {
    pub results: BTreeMap<String, Vec<ResultRecord>>,
    pub failures: BTreeMap<String, String>,
}

/// One work item seen across all roles.
#[derive(Debug, Clone, Serialize)]
pub struct ItemView {
    pub index: usize,
    pub work_item: WorkItem,
    pub by_role: BTreeMap<String, ResultRecord>,
    pub attributes: Vec<String>,
    pub citations: Vec<String>,
}

/// Matches records to input positions, one record per occurrence.
fn align<'r>(items: &[WorkItem], records: &'r [ResultRecord]) -> Vec<Option<&'r ResultRecord>> {
    let mut slots = vec![None; items.len()];
    for record in records {
        let free = items
            .iter()
            .enumerate()
            .find(|(i, item)| slots[*i].is_none() && **item == record.work_item);
        if let Some((i, _)) = free {
            slots[i] = Some(record);
        }
    }
    slots
}

impl RoleOutcomes {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Per-item views joining every role's record for that item.
    pub fn aggregate_by_item(&self, items: &[WorkItem]) -> Vec<ItemView> {
        let mut views: Vec<ItemView> = items
            .iter()
            .enumerate()
            .map(|(index, item)| ItemView {
                index,
                work_item: item.clone(),
                by_role: BTreeMap::new(),
                attributes: Vec::new(),
                citations: Vec::new(),
            })
            .collect();

        for (role, records) in &self.results {
            for (view, record) in views.iter_mut().zip(align(items, records)) {
                if let Some(record) = record {
                    view.by_role.insert(role.clone(), record.clone());
                }
            }
        }

        for view in &mut views {
            view.attributes = union_attributes(
                view.by_role
                    .values()
                    .map(|r| r.extracted_attributes.as_slice()),
            );
            view.citations =
                union_attributes(view.by_role.values().map(|r| r.citations.as_slice()));
        }
        views
    }
}

pub struct RoleScheduler<S> {
    service: Arc<S>,
    settings: BatchSettings,
    output_dir: PathBuf,
}

async fn run_role<S: JobService>(
    service: Arc<S>,
    settings: BatchSettings,
    dir: PathBuf,
    role: RoleContext,
    items: Arc<[WorkItem]>,
) -> Result<Vec<ResultRecord>> {
    let checkpoint = CheckpointFile::new(dir.join(checkpoint_name(&role.name)));
    let driver = BatchDriver::new(service, settings, ReportWriter::new(dir));
    driver.run(&items, &role, &checkpoint).await
}

impl<S: JobService + 'static> RoleScheduler<S> {
    pub fn new(service: Arc<S>, settings: BatchSettings, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            service,
            settings,
            output_dir: output_dir.into(),
        }
    }

    /// Runs every role to completion and merges their results by role name.
    pub async fn run_all(&self, roles: &[RoleContext], items: &[WorkItem]) -> RoleOutcomes {
        let items: Arc<[WorkItem]> = items.into();
        let semaphore = Arc::new(Semaphore::new(roles.len().max(1)));
        let mut outcomes = RoleOutcomes::default();
        let mut handles = Vec::with_capacity(roles.len());

        info!(roles = roles.len(), items = items.len(), "starting roles");
        for role in roles {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    outcomes.failures.insert(role.name.clone(), e.to_string());
                    continue;
                }
            };
            let service = Arc::clone(&self.service);
            let settings = self.settings.clone();
            let dir = self.output_dir.join(&role.name);
            let task_role = role.clone();
            let task_items = Arc::clone(&items);

            let handle = tokio::spawn(async move {
                let _permit = permit;
                run_role(service, settings, dir, task_role, task_items).await
            });
            handles.push((role.name.clone(), handle));
        }

        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(records)) => {
                    info!(role = %name, records = records.len(), "role finished");
                    outcomes.results.insert(name, records);
                }
                Ok(Err(e)) => {
                    error!(role = %name, error = %e, "role failed");
                    outcomes.failures.insert(name, e.to_string());
                }
                Err(e) => {
                    error!(role = %name, error = %e, "role task aborted");
                    outcomes.failures.insert(name, format!("task aborted: {e}"));
                }
            }
        }

        let writer = ReportWriter::new(&self.output_dir);
        if let Err(e) = writer.write_combined(&outcomes.results) {
            warn!(error = %e, "could not write combined results");
        }
        if let Err(e) = writer.write_json_file(ITEM_VIEW_FILE, &outcomes.aggregate_by_item(&items)) {
            warn!(error = %e, "could not write per-item view");
        }
        outcomes
    }
}
