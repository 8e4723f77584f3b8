//! Markdown and JSON artifacts: per-item reports, consolidated summaries,
//! per-role attribute unions, the combined cross-role results and
//! interactive transcripts.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::extract::union_attributes;
use crate::interactive::SessionTranscript;
use crate::model::{Metrics, ResultRecord};
use crate::session_store::atomic_write;

/// Prefix of timestamped output directories.
pub const OUTPUT_DIR_PREFIX: &str = "research_results_";
pub const COMBINED_RESULTS_FILE: &str = "combined_agent_results.json";
/// Prefix of the directories product analysis reports go to.
pub const ANALYSIS_DIR_PREFIX: &str = "product_analysis_reports_";

#[derive(Debug, Clone)]
pub struct ReportWriter {
    dir: PathBuf,
}

impl ReportWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.dir.join(name);
        atomic_write(&path, contents)?;
        Ok(path)
    }

    fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<PathBuf> {
        let data = serde_json::to_string_pretty(value)?;
        self.write(name, &data)
    }

    /// `{role}_{index:03}.md`; `index` is the 1-based input position.
    pub fn write_item(&self, role: &str, index: usize, record: &ResultRecord) -> Result<PathBuf> {
        self.write(
            &format!("{role}_{index:03}.md"),
            &render_item_markdown(index, record),
        )
    }

    pub fn write_summary(&self, role: &str, records: &[ResultRecord]) -> Result<PathBuf> {
        let path = self.write(
            &format!("{role}_summary.md"),
            &render_summary_markdown(role, records),
        )?;
        info!(path = %path.display(), "summary written");
        Ok(path)
    }

    /// Union of attributes discovered across the role's records.
    pub fn write_attributes(&self, role: &str, records: &[ResultRecord]) -> Result<PathBuf> {
        let attributes =
            union_attributes(records.iter().map(|r| r.extracted_attributes.as_slice()));
        self.write_json(
            &format!("{role}_attributes.json"),
            &serde_json::json!({ "role": role, "attributes": attributes }),
        )
    }

    pub fn write_combined(&self, results: &BTreeMap<String, Vec<ResultRecord>>) -> Result<PathBuf> {
        self.write_json(COMBINED_RESULTS_FILE, results)
    }

    pub fn write_json_file<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<PathBuf> {
        self.write_json(name, value)
    }

    pub fn write_text(&self, name: &str, contents: &str) -> Result<PathBuf> {
        self.write(name, contents)
    }

    /// Writes `{stem}.md` and `{stem}.json` for a finished session.
    pub fn write_transcript(
        &self,
        stem: &str,
        transcript: &SessionTranscript,
    ) -> Result<(PathBuf, PathBuf)> {
        let md = self.write(&format!("{stem}.md"), &render_transcript_markdown(transcript))?;
        let json = self.write_json(&format!("{stem}.json"), transcript)?;
        Ok((md, json))
    }
}

fn format_ttfo(metrics: &Metrics) -> String {
    match metrics.time_to_first_output {
        Some(secs) => format!("{secs:.2} seconds"),
        None => "n/a".to_string(),
    }
}

pub fn render_item_markdown(index: usize, record: &ResultRecord) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# Research Result {index}\n");
    let _ = writeln!(
        md,
        "**Generated on:** {}",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(role) = &record.role {
        let _ = writeln!(md, "**Role:** {role}");
    }
    let _ = writeln!(md, "**Question:** {}", record.work_item.prompt);
    if let Some(context) = &record.work_item.context {
        for (key, value) in context {
            let _ = writeln!(md, "- {key}: {value}");
        }
    }
    let _ = writeln!(md, "**Status:** {}\n", record.status);
    if let Some(error) = &record.error {
        let _ = writeln!(md, "**Error:** {error}\n");
    }

    let m = &record.metrics;
    let _ = writeln!(md, "## Metrics");
    let _ = writeln!(md, "- Time to First Output: {}", format_ttfo(m));
    let _ = writeln!(md, "- Total Time: {:.2} seconds", m.total_time);
    let _ = writeln!(md, "- Tokens In: {}", m.tokens_in);
    let _ = writeln!(md, "- Tokens Out: {}", m.tokens_out);
    let _ = writeln!(md, "- Total Tokens: {}\n", m.total_tokens);

    if !record.response_text.is_empty() {
        let _ = writeln!(md, "## Response\n");
        let _ = writeln!(md, "{}\n", record.response_text);
    }
    if !record.annotations.is_empty() {
        let _ = writeln!(md, "## References");
        for (i, c) in record.annotations.iter().enumerate() {
            let _ = writeln!(md, "{}. [{}]({})", i + 1, c.title, c.url);
        }
        md.push('\n');
    }
    if !record.citations.is_empty() {
        let _ = writeln!(md, "## Extracted Citations");
        for citation in &record.citations {
            let _ = writeln!(md, "- {citation}");
        }
        md.push('\n');
    }
    if !record.extracted_attributes.is_empty() {
        let _ = writeln!(md, "## Attributes");
        for attribute in &record.extracted_attributes {
            let _ = writeln!(md, "- {attribute}");
        }
    }
    md
}

/// Batch-level totals. Records without a value count as zero, and the
/// average divides by every record, failed ones included.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total_time: f64,
    pub total_tokens: u64,
    pub average_time: f64,
}

impl SummaryStats {
    pub fn from_records(records: &[ResultRecord]) -> Self {
        let total = records.len();
        let succeeded = records.iter().filter(|r| r.is_success()).count();
        let total_time: f64 = records.iter().map(|r| r.metrics.total_time).sum();
        let total_tokens = records.iter().map(|r| r.metrics.total_tokens).sum();
        let average_time = if total == 0 {
            0.0
        } else {
            total_time / total as f64
        };
        Self {
            total,
            succeeded,
            failed: total - succeeded,
            total_time,
            total_tokens,
            average_time,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.total as f64 * 100.0
        }
    }
}

pub fn render_summary_markdown(role: &str, records: &[ResultRecord]) -> String {
    let stats = SummaryStats::from_records(records);
    let mut md = String::new();
    let _ = writeln!(md, "# Batch Research Results: {role}\n");
    let _ = writeln!(
        md,
        "**Generated on:** {}",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    let _ = writeln!(md, "**Total Items Processed:** {}\n", stats.total);

    let _ = writeln!(md, "## Summary Statistics");
    let _ = writeln!(md, "- Total Processing Time: {:.2} seconds", stats.total_time);
    let _ = writeln!(md, "- Average Time per Item: {:.2} seconds", stats.average_time);
    let _ = writeln!(md, "- Total Tokens Used: {}", stats.total_tokens);
    let _ = writeln!(
        md,
        "- Success Rate: {}/{} ({:.1}%)",
        stats.succeeded,
        stats.total,
        stats.success_rate()
    );
    let _ = writeln!(md, "- Failed: {}\n", stats.failed);

    let _ = writeln!(md, "## Individual Results\n");
    for (i, record) in records.iter().enumerate() {
        let m = &record.metrics;
        let _ = writeln!(md, "### {}. {}", i + 1, record.work_item.label(100));
        let _ = writeln!(md, "**Status:** {}", record.status);
        if let Some(error) = &record.error {
            let _ = writeln!(md, "**Error:** {error}");
        }
        let _ = writeln!(md, "- Time to First Output: {}", format_ttfo(m));
        let _ = writeln!(md, "- Total Time: {:.2} seconds", m.total_time);
        let _ = writeln!(
            md,
            "- Tokens: {} in, {} out, {} total",
            m.tokens_in, m.tokens_out, m.total_tokens
        );
        let _ = writeln!(md, "\n---\n");
    }
    md
}

pub fn render_transcript_markdown(transcript: &SessionTranscript) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# Interactive Research Session\n");
    let _ = writeln!(md, "**Session:** {}", transcript.session_key);
    let _ = writeln!(md, "**Started:** {}", transcript.started_at.to_rfc3339());
    let _ = writeln!(md, "**Ended:** {}", transcript.ended_at.to_rfc3339());
    let _ = writeln!(md, "**End reason:** {}\n", transcript.end_reason);

    let _ = writeln!(md, "## Conversation\n");
    for turn in &transcript.turns {
        let _ = writeln!(md, "### {} ({})\n", turn.speaker, turn.kind);
        let _ = writeln!(md, "{}\n", turn.content);
    }

    let m = &transcript.metrics;
    let _ = writeln!(md, "## Metrics");
    let _ = writeln!(md, "- Time to First Output: {}", format_ttfo(m));
    let _ = writeln!(md, "- Total Time: {:.2} seconds", m.total_time);
    let _ = writeln!(
        md,
        "- Tokens: {} in, {} out, {} total",
        m.tokens_in, m.tokens_out, m.total_tokens
    );

    if !transcript.citations.is_empty() {
        let _ = writeln!(md, "\n## References");
        for (i, c) in transcript.citations.iter().enumerate() {
            let _ = writeln!(md, "{}. [{}]({})", i + 1, c.title, c.url);
        }
    }
    md
}

/// Picks the output directory for a batch run and whether resuming applies.
///
/// An explicit directory always wins. Otherwise resume reuses the newest
/// `research_results_*` directory under `root`; a fresh run gets a new
/// timestamped one. Resume without any previous directory starts fresh.
pub fn resolve_output_dir(
    root: &Path,
    explicit: Option<PathBuf>,
    resume: bool,
) -> std::io::Result<(PathBuf, bool)> {
    if let Some(dir) = explicit {
        return Ok((dir, resume));
    }
    if resume {
        if let Some(latest) = latest_output_dir(root)? {
            info!(dir = %latest.display(), "resuming in latest output directory");
            return Ok((latest, true));
        }
        info!("no previous output directory, starting fresh");
    }
    Ok((stamped_dir(root, OUTPUT_DIR_PREFIX), false))
}

/// `root/{prefix}{YYYYmmdd_HHMMSS}`.
pub fn stamped_dir(root: &Path, prefix: &str) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    root.join(format!("{prefix}{stamp}"))
}

/// The newest `research_results_*` directory under `root`, if any.
pub fn latest_output_dir(root: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(OUTPUT_DIR_PREFIX) && entry.file_type()?.is_dir() {
            candidates.push(name);
        }
    }
    // Timestamps sort lexicographically.
    Ok(candidates.into_iter().max().map(|name| root.join(name)))
}
