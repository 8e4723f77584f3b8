//! End-to-end product pipeline: multi-role search, then product analysis.
//!
//! Both phases write under one base directory, and the run is recorded in
//! `pipeline_summary.json` there. A dry run checks the setup and reports
//! where output would go without contacting the service or writing files.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::analysis::ProductAnalyst;
use crate::batch::BatchSettings;
use crate::input::read_work_items;
use crate::model::RoleContext;
use crate::report::{ANALYSIS_DIR_PREFIX, OUTPUT_DIR_PREFIX, ReportWriter, stamped_dir};
use crate::scheduler::RoleScheduler;
use crate::service::JobService;

pub const PIPELINE_SUMMARY_FILE: &str = "pipeline_summary.json";
/// Prefix of the default pipeline base directory.
pub const PIPELINE_DIR_PREFIX: &str = "product_analysis_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Completed,
    Failed,
    Skipped,
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseReport {
    pub status: PhaseStatus,
    /// Wall time in seconds, rounded to hundredths; absent until run.
    pub duration_secs: Option<f64>,
    pub output_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn round_secs(started: Instant) -> f64 {
    (started.elapsed().as_secs_f64() * 100.0).round() / 100.0
}

impl PhaseReport {
    fn pending() -> Self {
        Self {
            status: PhaseStatus::Pending,
            duration_secs: None,
            output_dir: None,
            error: None,
        }
    }

    fn skipped(output_dir: PathBuf) -> Self {
        Self {
            status: PhaseStatus::Skipped,
            output_dir: Some(output_dir),
            ..Self::pending()
        }
    }

    fn completed(started: Instant, output_dir: PathBuf) -> Self {
        Self {
            status: PhaseStatus::Completed,
            duration_secs: Some(round_secs(started)),
            output_dir: Some(output_dir),
            error: None,
        }
    }

    fn failed(started: Instant, error: impl Into<String>) -> Self {
        Self {
            status: PhaseStatus::Failed,
            duration_secs: Some(round_secs(started)),
            output_dir: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelinePhases {
    pub search: PhaseReport,
    pub analysis: PhaseReport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineOutputs {
    pub search_results: Option<PathBuf>,
    pub reports: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub execution_time: DateTime<Local>,
    pub total_duration_secs: f64,
    pub dry_run: bool,
    /// `skipped` for a dry run.
    pub status: PhaseStatus,
    pub phases: PipelinePhases,
    pub outputs: PipelineOutputs,
    /// Why the setup check refused to start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineSummary {
    pub fn succeeded(&self) -> bool {
        self.status != PhaseStatus::Failed
    }
}

/// Where the analysis phase gets its input.
#[derive(Debug, Clone)]
pub enum SearchSource {
    /// Run every role over the work items in `input`.
    Run {
        input: PathBuf,
        roles: Vec<RoleContext>,
    },
    /// Reuse a finished search directory.
    Existing(PathBuf),
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub output_base: PathBuf,
    pub search: SearchSource,
    pub analysis_agent: String,
    pub settings: BatchSettings,
    pub dry_run: bool,
}

pub struct Pipeline<S> {
    service: Arc<S>,
    options: PipelineOptions,
}

impl<S: JobService + 'static> Pipeline<S> {
    pub fn new(service: Arc<S>, options: PipelineOptions) -> Self {
        Self { service, options }
    }

    fn check_environment(&self) -> Result<(), String> {
        if self.options.analysis_agent.trim().is_empty() {
            return Err("no analysis agent configured".into());
        }
        match &self.options.search {
            SearchSource::Run { input, roles } => {
                if !input.is_file() {
                    return Err(format!("input file not found: {}", input.display()));
                }
                if roles.is_empty() {
                    return Err("no roles to run".into());
                }
                if let Some(role) = roles.iter().find(|r| r.agent.trim().is_empty()) {
                    return Err(format!("role '{}' has no agent", role.name));
                }
            }
            SearchSource::Existing(dir) => {
                if !dir.is_dir() {
                    return Err(format!("search directory not found: {}", dir.display()));
                }
            }
        }
        Ok(())
    }

    /// Runs both phases. Analysis only starts once search succeeded or was
    /// skipped. Except on a dry run the summary is written even on failure.
    pub async fn run(&self) -> PipelineSummary {
        let started = Instant::now();
        let dry_run = self.options.dry_run;
        info!(base = %self.options.output_base.display(), dry_run, "starting pipeline");

        let mut phases = PipelinePhases {
            search: PhaseReport::pending(),
            analysis: PhaseReport::pending(),
        };
        let mut setup_error = None;

        match self.check_environment() {
            Err(e) => {
                error!(error = %e, "environment check failed");
                setup_error = Some(e);
            }
            Ok(()) => {
                info!("environment check passed");
                phases.search = self.search().await;
                let search_dir = match phases.search.status {
                    PhaseStatus::Completed | PhaseStatus::Skipped => phases.search.output_dir.clone(),
                    _ => None,
                };
                match search_dir {
                    Some(dir) => phases.analysis = self.analyse(dir).await,
                    None => error!("search phase failed, not starting analysis"),
                }
            }
        }

        let status = if setup_error.is_some()
            || [&phases.search, &phases.analysis]
                .iter()
                .any(|p| matches!(p.status, PhaseStatus::Failed | PhaseStatus::Pending))
        {
            PhaseStatus::Failed
        } else if dry_run {
            PhaseStatus::Skipped
        } else {
            PhaseStatus::Completed
        };

        let summary = PipelineSummary {
            execution_time: Local::now(),
            total_duration_secs: round_secs(started),
            dry_run,
            status,
            outputs: PipelineOutputs {
                search_results: phases.search.output_dir.clone(),
                reports: phases.analysis.output_dir.clone(),
            },
            phases,
            error: setup_error,
        };

        if !dry_run {
            let writer = ReportWriter::new(&self.options.output_base);
            match writer.write_json_file(PIPELINE_SUMMARY_FILE, &summary) {
                Ok(path) => info!(path = %path.display(), "pipeline summary saved"),
                Err(e) => warn!(error = %e, "could not write pipeline summary"),
            }
        }
        info!(status = %summary.status, total_secs = summary.total_duration_secs, "pipeline finished");
        summary
    }

    async fn search(&self) -> PhaseReport {
        let (input, roles) = match &self.options.search {
            SearchSource::Existing(dir) => {
                info!(dir = %dir.display(), "skipping search phase, using existing results");
                return PhaseReport::skipped(dir.clone());
            }
            SearchSource::Run { input, roles } => (input, roles),
        };
        let dir = stamped_dir(&self.options.output_base, OUTPUT_DIR_PREFIX);
        if self.options.dry_run {
            info!(
                input = %input.display(),
                roles = roles.len(),
                output = %dir.display(),
                "dry run: would run the search phase"
            );
            return PhaseReport::skipped(dir);
        }

        info!(roles = roles.len(), "starting search phase");
        let started = Instant::now();
        let items = match read_work_items(input) {
            Ok(items) => items,
            Err(e) => return PhaseReport::failed(started, e.to_string()),
        };
        let scheduler = RoleScheduler::new(
            Arc::clone(&self.service),
            self.options.settings.clone(),
            &dir,
        );
        let outcomes = scheduler.run_all(roles, &items).await;
        if !outcomes.is_complete() {
            let failed: Vec<&str> = outcomes.failures.keys().map(String::as_str).collect();
            error!(roles = %failed.join(", "), "search phase failed");
            return PhaseReport::failed(started, format!("roles failed: {}", failed.join(", ")));
        }
        let report = PhaseReport::completed(started, dir);
        info!(secs = report.duration_secs, "search phase completed");
        report
    }

    async fn analyse(&self, search_dir: PathBuf) -> PhaseReport {
        let dir = stamped_dir(&self.options.output_base, ANALYSIS_DIR_PREFIX);
        if self.options.dry_run {
            info!(
                input = %search_dir.display(),
                output = %dir.display(),
                "dry run: would run the analysis phase"
            );
            return PhaseReport::skipped(dir);
        }

        info!(input = %search_dir.display(), "starting analysis phase");
        let started = Instant::now();
        let analyst = ProductAnalyst::new(
            Arc::clone(&self.service),
            self.options.analysis_agent.clone(),
            self.options.settings.clone(),
            ReportWriter::new(&dir),
        );
        match analyst.run_dir(&search_dir).await {
            Ok(outcome) => {
                if !outcome.is_complete() {
                    warn!(
                        failed = outcome.reports.len() - outcome.succeeded(),
                        products = outcome.reports.len(),
                        "some product analyses failed"
                    );
                }
                let report = PhaseReport::completed(started, dir);
                info!(secs = report.duration_secs, "analysis phase completed");
                report
            }
            Err(e) => {
                error!(error = %e, "analysis phase failed");
                PhaseReport::failed(started, e.to_string())
            }
        }
    }
}
