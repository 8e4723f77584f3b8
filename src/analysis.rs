//! Product analysis: one synthesis job per work item over every role's
//! findings, written out as per-product reports plus an index.
//!
//! Reads the `combined_agent_results.json` a multi-role run leaves behind.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use serde::Serialize;
use tracing::{info, warn};

use crate::batch::{BatchSettings, run_on_fresh_session};
use crate::error::{ResearchError, Result};
use crate::model::{JobStatus, Metrics, ResultRecord, WorkItem};
use crate::report::{COMBINED_RESULTS_FILE, ReportWriter};
use crate::scheduler::{ItemView, RoleOutcomes};
use crate::service::JobService;

pub const SUMMARY_REPORT_FILE: &str = "summary_report.md";
/// Role name recorded on analysis results.
pub const ANALYST_ROLE: &str = "analyst";

const ANALYSIS_INTRO: &str = "You are a product data analysis expert. Analyze the following \
information collected by multiple specialized agents about this product:";

const ANALYSIS_REQUEST: &str = "Based on the above information, please provide:

1. ANALYSIS: A comprehensive analysis of what information was returned about this product. \
What key facts did we learn? What categories of information were covered well?

2. QUALITY ASSESSMENT: An evaluation of the quality and completeness of the agent responses. \
Were there gaps, inconsistencies, or areas where more information is needed? \
How reliable do the sources appear to be?

3. COMPLETE ATTRIBUTES LIST: A consolidated, deduplicated list of all attributes discovered \
across all agents.

4. CATEGORIZED BREAKDOWN: Group the attributes by logical categories \
(e.g., Basic Information, Nutrition Facts, Ingredients, etc.)

Format your response as clear sections with markdown headers.";

/// Loads the per-role results of a finished multi-role run.
pub fn load_combined(dir: &Path) -> Result<BTreeMap<String, Vec<ResultRecord>>> {
    let path = dir.join(COMBINED_RESULTS_FILE);
    if !path.exists() {
        return Err(ResearchError::Input(format!(
            "combined results file not found: {}",
            path.display()
        )));
    }
    let data = std::fs::read_to_string(&path)?;
    let combined: BTreeMap<String, Vec<ResultRecord>> = serde_json::from_str(&data)?;
    info!(path = %path.display(), roles = combined.len(), "loaded combined results");
    Ok(combined)
}

/// One view per work item, in the order of the role holding the most
/// records. Items no role has a record for are left out.
pub fn product_views(combined: &BTreeMap<String, Vec<ResultRecord>>) -> Vec<ItemView> {
    let Some(longest) = combined
        .values()
        .reduce(|best, records| if records.len() > best.len() { records } else { best })
    else {
        return Vec::new();
    };
    let items: Vec<WorkItem> = longest.iter().map(|r| r.work_item.clone()).collect();
    let outcomes = RoleOutcomes {
        results: combined.clone(),
        failures: BTreeMap::new(),
    };
    outcomes
        .aggregate_by_item(&items)
        .into_iter()
        .filter(|view| !view.by_role.is_empty())
        .collect()
}

fn context_value<'a>(item: &'a WorkItem, key: &str) -> Option<&'a str> {
    item.context
        .as_ref()
        .and_then(|c| c.get(key))
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
}

/// Display name of a work item: the product name when known.
pub fn product_name(item: &WorkItem) -> String {
    match context_value(item, "short_desc") {
        Some(name) => name.to_string(),
        None => item.label(80),
    }
}

fn product_upc(item: &WorkItem) -> &str {
    context_value(item, "upc").unwrap_or("n/a")
}

/// Lowercase file-name fragment: word characters, `-` and `_` only.
pub fn slug(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || c.is_whitespace())
        .collect();
    let slug: String = kept
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
        .chars()
        .take(80)
        .collect();
    if slug.is_empty() { "item".to_string() } else { slug }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn render_analysis_prompt(view: &ItemView) -> String {
    let item = &view.work_item;
    let mut prompt = String::new();
    let _ = writeln!(prompt, "{ANALYSIS_INTRO}\n");
    let _ = writeln!(prompt, "Product Basic Information:");
    if item.context.is_some() {
        let _ = writeln!(prompt, "- UPC: {}", product_upc(item));
        let _ = writeln!(prompt, "- Product Name: {}", product_name(item));
        let _ = writeln!(
            prompt,
            "- Description: {}",
            context_value(item, "long_desc").unwrap_or("")
        );
    } else {
        let _ = writeln!(prompt, "- Question: {}", item.prompt);
    }

    for (role, record) in &view.by_role {
        let _ = writeln!(prompt, "\n## {} AGENT RESULTS:", role.to_uppercase());
        let _ = writeln!(prompt, "Response: {}", record.response_text);
        let _ = writeln!(
            prompt,
            "Discovered attributes: {}",
            record.extracted_attributes.join(", ")
        );
        let _ = writeln!(prompt, "Citations: {}", record.citations.join(", "));
    }
    let _ = write!(prompt, "\n{ANALYSIS_REQUEST}\n");
    prompt
}

#[derive(Serialize)]
struct RoleFindings<'a> {
    discovered_attributes: &'a [String],
    citations: &'a [String],
}

#[derive(Serialize)]
struct ProductReportJson<'a> {
    product_info: &'a WorkItem,
    analysis: &'a str,
    analysis_metrics: &'a Metrics,
    status: JobStatus,
    error: Option<&'a str>,
    agent_results: BTreeMap<&'a str, RoleFindings<'a>>,
}

fn analysis_text(record: &ResultRecord) -> String {
    match &record.error {
        Some(error) if record.response_text.is_empty() => {
            format!("Error generating analysis: {error}")
        }
        _ => record.response_text.clone(),
    }
}

pub fn render_product_markdown(view: &ItemView, analysis: &ResultRecord) -> String {
    let item = &view.work_item;
    let mut md = String::new();
    let _ = writeln!(md, "# Product Report: {}\n", product_name(item));
    let _ = writeln!(
        md,
        "**Generated on:** {}",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    let _ = writeln!(md, "**UPC:** {}", product_upc(item));
    if let Some(description) = context_value(item, "long_desc") {
        let _ = writeln!(md, "**Description:** {description}");
    }
    let _ = writeln!(md, "**Status:** {}\n", analysis.status);

    let _ = writeln!(md, "## Analysis\n");
    let _ = writeln!(md, "{}\n", analysis_text(analysis));

    let _ = writeln!(md, "## Agent Data Sources\n");
    for (role, record) in &view.by_role {
        let _ = writeln!(md, "### {} Agent", capitalize(role));
        let _ = writeln!(md, "**Citations:**");
        for citation in &record.citations {
            let _ = writeln!(md, "- {citation}");
        }
        md.push('\n');
    }
    md
}

/// Where one product's analysis went.
#[derive(Debug, Clone, Serialize)]
pub struct ProductReport {
    /// 1-based position among analysed products.
    pub index: usize,
    pub name: String,
    pub upc: String,
    pub status: JobStatus,
    pub markdown: PathBuf,
    pub json: PathBuf,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn render_summary_report(reports: &[ProductReport]) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# Product Reports Summary\n");
    let _ = writeln!(
        md,
        "**Generated on:** {}",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    let _ = writeln!(md, "**Total Products:** {}\n", reports.len());
    let _ = writeln!(md, "## Products Analyzed\n");
    for (i, report) in reports.iter().enumerate() {
        let _ = writeln!(md, "{}. **{}** (UPC: {})", i + 1, report.name, report.upc);
        let _ = writeln!(md, "   - [JSON Report]({})", file_name(&report.json));
        let _ = writeln!(md, "   - [Markdown Report]({})", file_name(&report.markdown));
        let _ = writeln!(md, "   - Status: {}\n", report.status);
    }
    md
}

#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub output_dir: PathBuf,
    pub reports: Vec<ProductReport>,
    pub summary: PathBuf,
}

impl AnalysisOutcome {
    pub fn succeeded(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| r.status == JobStatus::Completed)
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.succeeded() == self.reports.len()
    }
}

/// Runs the analysis job for each product and writes its reports.
pub struct ProductAnalyst<S> {
    service: Arc<S>,
    agent: String,
    settings: BatchSettings,
    reports: ReportWriter,
}

impl<S: JobService> ProductAnalyst<S> {
    pub fn new(
        service: Arc<S>,
        agent: impl Into<String>,
        settings: BatchSettings,
        reports: ReportWriter,
    ) -> Self {
        Self {
            service,
            agent: agent.into(),
            settings,
            reports,
        }
    }

    /// Analyses the combined results found in `input_dir`.
    pub async fn run_dir(&self, input_dir: &Path) -> Result<AnalysisOutcome> {
        let combined = load_combined(input_dir)?;
        self.run(&combined).await
    }

    /// Products are analysed one at a time, each on a fresh session. A
    /// failed job still gets a report; a report that cannot be written is
    /// logged and left out of the summary.
    pub async fn run(&self, combined: &BTreeMap<String, Vec<ResultRecord>>) -> Result<AnalysisOutcome> {
        let views = product_views(combined);
        let total = views.len();
        info!(products = total, roles = combined.len(), "starting product analysis");

        let mut reports = Vec::with_capacity(total);
        for (i, view) in views.iter().enumerate() {
            let name = product_name(&view.work_item);
            info!(product = i + 1, total, name = %name, "analysing");
            let record = run_on_fresh_session(
                self.service.as_ref(),
                &self.settings,
                &self.agent,
                &render_analysis_prompt(view),
                &view.work_item,
                ANALYST_ROLE,
            )
            .await;
            info!(product = i + 1, status = %record.status, "analysis settled");

            match self.write_product(i + 1, view, &record) {
                Ok(report) => reports.push(report),
                Err(e) => warn!(product = i + 1, error = %e, "could not write product report"),
            }
        }

        let summary = self
            .reports
            .write_text(SUMMARY_REPORT_FILE, &render_summary_report(&reports))?;
        info!(path = %summary.display(), products = reports.len(), "summary report written");
        Ok(AnalysisOutcome {
            output_dir: self.reports.dir().to_path_buf(),
            reports,
            summary,
        })
    }

    fn write_product(&self, index: usize, view: &ItemView, analysis: &ResultRecord) -> Result<ProductReport> {
        let item = &view.work_item;
        let name = product_name(item);
        let stem = format!("product_{index:03}_{}_report", slug(&name));

        let text = analysis_text(analysis);
        let json = ProductReportJson {
            product_info: item,
            analysis: &text,
            analysis_metrics: &analysis.metrics,
            status: analysis.status,
            error: analysis.error.as_deref(),
            agent_results: view
                .by_role
                .iter()
                .map(|(role, record)| {
                    (
                        role.as_str(),
                        RoleFindings {
                            discovered_attributes: &record.extracted_attributes,
                            citations: &record.citations,
                        },
                    )
                })
                .collect(),
        };
        let json = self.reports.write_json_file(&format!("{stem}.json"), &json)?;
        let markdown = self
            .reports
            .write_text(&format!("{stem}.md"), &render_product_markdown(view, analysis))?;

        Ok(ProductReport {
            index,
            name,
            upc: product_upc(item).to_string(),
            status: analysis.status,
            markdown,
            json,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RetryPolicy;
    use crate::poller::PollSettings;
    use crate::service::mock::{MockJobService, Reply};
    use std::time::Duration;
    use tempfile::tempdir;

    fn settings() -> BatchSettings {
        BatchSettings {
            timeout: Duration::from_millis(50),
            resume: false,
            retry: RetryPolicy {
                max_retries: 0,
                base_delay_ms: 1,
                max_delay_ms: 1,
            },
            poll: PollSettings {
                tick: Duration::from_millis(1),
                ..PollSettings::default()
            },
        }
    }

    fn product(upc: &str, name: &str) -> WorkItem {
        let context = [
            ("upc".to_string(), upc.to_string()),
            ("short_desc".to_string(), name.to_string()),
            ("long_desc".to_string(), format!("{name}, 5 lb bag")),
        ]
        .into_iter()
        .collect();
        WorkItem::with_context("Search for information about the following product:", context)
    }

    fn found(item: &WorkItem, role: &str, attributes: &[&str], citation: &str) -> ResultRecord {
        let mut record = ResultRecord::failed(item.clone(), Some(role.into()), "", Duration::ZERO);
        record.status = JobStatus::Completed;
        record.error = None;
        record.response_text = format!("{role} findings");
        record.extracted_attributes = attributes.iter().map(|a| a.to_string()).collect();
        record.citations = vec![citation.to_string()];
        record
    }

    fn combined() -> BTreeMap<String, Vec<ResultRecord>> {
        let dog = product("0001", "Acme Dog Food (Chicken)");
        let cat = product("0002", "Acme Cat Food");
        let mut combined = BTreeMap::new();
        combined.insert(
            "ingredients".to_string(),
            vec![found(&dog, "ingredients", &["Ingredients"], "https://a.example.com/dog")],
        );
        combined.insert(
            "nutrition".to_string(),
            vec![
                found(&dog, "nutrition", &["Calories", "Protein"], "https://n.example.com/dog"),
                found(&cat, "nutrition", &["Calories"], "https://n.example.com/cat"),
            ],
        );
        combined
    }

    #[test]
    fn slug_keeps_word_characters() {
        assert_eq!(slug("Acme Dog Food (Chicken)"), "acme_dog_food_chicken");
        assert_eq!(slug("  Grain-free  & Co. "), "grain-free_co");
        assert_eq!(slug("!!!"), "item");
    }

    #[test]
    fn views_follow_the_longest_role() {
        let views = product_views(&combined());
        let names: Vec<_> = views.iter().map(|v| product_name(&v.work_item)).collect();
        assert_eq!(names, vec!["Acme Dog Food (Chicken)", "Acme Cat Food"]);
        assert_eq!(views[0].by_role.len(), 2);
        assert_eq!(views[1].by_role.len(), 1);
        assert!(product_views(&BTreeMap::new()).is_empty());
    }

    #[test]
    fn prompt_carries_every_role() {
        let views = product_views(&combined());
        let prompt = render_analysis_prompt(&views[0]);

        assert!(prompt.starts_with(ANALYSIS_INTRO));
        assert!(prompt.contains("- UPC: 0001"));
        assert!(prompt.contains("- Product Name: Acme Dog Food (Chicken)"));
        assert!(prompt.contains("- Description: Acme Dog Food (Chicken), 5 lb bag"));
        assert!(prompt.contains("## INGREDIENTS AGENT RESULTS:\nResponse: ingredients findings"));
        assert!(prompt.contains("Discovered attributes: Calories, Protein"));
        assert!(prompt.contains("Citations: https://n.example.com/dog"));
        assert!(prompt.contains("4. CATEGORIZED BREAKDOWN"));
    }

    #[test]
    fn plain_question_prompt_names_the_question() {
        let item = WorkItem::new("What is X?");
        let mut combined = BTreeMap::new();
        combined.insert("r".to_string(), vec![found(&item, "r", &[], "https://x.example.com")]);
        let prompt = render_analysis_prompt(&product_views(&combined)[0]);
        assert!(prompt.contains("- Question: What is X?"));
        assert!(!prompt.contains("- UPC:"));
    }

    #[tokio::test]
    async fn writes_product_reports_and_summary() {
        let dir = tempdir().unwrap();
        let service = Arc::new(MockJobService::new(|_, _| Reply::Complete {
            after: 1,
            text: "## Analysis\nWell covered.".into(),
        }));
        let analyst = ProductAnalyst::new(
            service.clone(),
            "asst_analyst",
            settings(),
            ReportWriter::new(dir.path()),
        );

        let outcome = analyst.run(&combined()).await.unwrap();

        assert!(outcome.is_complete());
        assert_eq!(outcome.reports.len(), 2);
        assert_eq!(service.sessions_created(), 2);
        assert!(service.submitted_prompts()[0].contains("## NUTRITION AGENT RESULTS:"));

        let first = &outcome.reports[0];
        assert_eq!(
            first.markdown,
            dir.path().join("product_001_acme_dog_food_chicken_report.md")
        );
        let md = std::fs::read_to_string(&first.markdown).unwrap();
        assert!(md.starts_with("# Product Report: Acme Dog Food (Chicken)"));
        assert!(md.contains("**UPC:** 0001"));
        assert!(md.contains("Well covered."));
        assert!(md.contains("### Ingredients Agent\n**Citations:**\n- https://a.example.com/dog"));

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&first.json).unwrap()).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["product_info"]["context"]["upc"], "0001");
        assert_eq!(
            json["agent_results"]["nutrition"]["discovered_attributes"],
            serde_json::json!(["Calories", "Protein"])
        );

        let summary = std::fs::read_to_string(dir.path().join(SUMMARY_REPORT_FILE)).unwrap();
        assert!(summary.contains("**Total Products:** 2"));
        assert!(summary.contains("2. **Acme Cat Food** (UPC: 0002)"));
        assert!(summary.contains("[JSON Report](product_002_acme_cat_food_report.json)"));
    }

    #[tokio::test]
    async fn failed_analysis_still_gets_a_report() {
        let dir = tempdir().unwrap();
        let service = Arc::new(MockJobService::new(|_, _| Reply::Reject { status: 400 }));
        let analyst = ProductAnalyst::new(service, "asst_analyst", settings(), ReportWriter::new(dir.path()));

        let outcome = analyst.run(&combined()).await.unwrap();

        assert!(!outcome.is_complete());
        assert_eq!(outcome.reports.len(), 2);
        assert_eq!(outcome.reports[0].status, JobStatus::Error);
        let md = std::fs::read_to_string(&outcome.reports[0].markdown).unwrap();
        assert!(md.contains("Error generating analysis:"));
        assert!(md.contains("400"));
    }

    #[tokio::test]
    async fn missing_combined_file_is_an_input_error() {
        let dir = tempdir().unwrap();
        let analyst = ProductAnalyst::new(
            Arc::new(MockJobService::echo()),
            "asst_analyst",
            settings(),
            ReportWriter::new(dir.path().join("out")),
        );
        let err = analyst.run_dir(dir.path()).await.unwrap_err();
        assert!(matches!(err, ResearchError::Input(_)));
        assert!(err.to_string().contains(COMBINED_RESULTS_FILE));
    }
}
