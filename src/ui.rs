//! Terminal output: spinners and colored messages.
//!
//! Uses `indicatif` for the spinner shown while a job runs and `console`
//! for styling. [`ConsolePrompter`] is the terminal side of an interactive
//! session; the `print_*` helpers render run results.

use std::io::BufRead;
use std::time::Duration;

use console::{Style, Term};
use indicatif::{ProgressBar, ProgressStyle};

use crate::analysis::AnalysisOutcome;
use crate::interactive::Prompter;
use crate::model::{Citation, JobStatus, ResultRecord};
use crate::pipeline::{PhaseReport, PipelineSummary};
use crate::scheduler::RoleOutcomes;
use crate::service::{MessageRole, TranscriptMessage};

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg} {elapsed}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn print_citations(citations: &[Citation]) {
    if citations.is_empty() {
        return;
    }
    println!("\nReferences:");
    for (i, c) in citations.iter().enumerate() {
        println!("{}. {}: {}", i + 1, c.title, c.url);
    }
}

/// One line from `input` without its line ending; `None` at end of input.
fn read_answer(input: &mut impl BufRead) -> Option<String> {
    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
    }
}

/// Reads answers from the terminal and shows a spinner while jobs run.
pub struct ConsolePrompter {
    term: Term,
    spinner: Option<ProgressBar>,
    heading: Style,
    yellow: Style,
}

impl Default for ConsolePrompter {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsolePrompter {
    pub fn new() -> Self {
        Self {
            term: Term::stdout(),
            spinner: None,
            heading: Style::new().cyan().bold(),
            yellow: Style::new().yellow(),
        }
    }
}

impl Prompter for ConsolePrompter {
    fn ask(&mut self, prompt: &str) -> Option<String> {
        let _ = self.term.write_str(&format!("\n{prompt}"));
        let _ = self.term.flush();
        read_answer(&mut std::io::stdin().lock())
    }

    fn show_response(&mut self, text: &str, citations: &[Citation]) {
        println!("\n{}", self.heading.apply_to("--- Agent Response ---"));
        println!("{text}");
        println!("{}", self.heading.apply_to("--- End Response ---"));
        print_citations(citations);
    }

    fn notice(&mut self, message: &str) {
        println!("\n{}", self.yellow.apply_to(format!("[{message}]")));
    }

    fn waiting(&mut self) {
        self.spinner = Some(spinner("Researching"));
    }

    fn finished(&mut self) {
        if let Some(pb) = self.spinner.take() {
            pb.finish_and_clear();
        }
    }
}

/// Runs `fut` behind a spinner.
pub async fn with_spinner<F: std::future::Future>(message: &str, fut: F) -> F::Output {
    let pb = spinner(message);
    let output = fut.await;
    pb.finish_and_clear();
    output
}

pub fn print_record(record: &ResultRecord) {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    if record.is_success() {
        println!("{} {}", green.apply_to("✓"), record.status);
    } else {
        let error = record.error.as_deref().unwrap_or("");
        println!("{} {} {error}", red.apply_to("✗"), record.status);
    }
    if !record.response_text.is_empty() {
        println!("\n{}", record.response_text);
    }
    print_citations(&record.annotations);
}

pub fn print_history(messages: &[TranscriptMessage]) {
    if messages.is_empty() {
        println!("(no messages)");
        return;
    }
    let user = Style::new().cyan().bold();
    let agent = Style::new().green().bold();
    for message in messages {
        match message.role {
            MessageRole::User => println!("\n{}", user.apply_to("USER")),
            MessageRole::Agent => println!("\n{}", agent.apply_to("AGENT")),
        }
        println!("{}", message.text);
    }
}

/// Prints per-role counts and any role failures.
pub fn print_role_summary(outcomes: &RoleOutcomes) {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    println!();
    for (role, records) in &outcomes.results {
        let ok = records.iter().filter(|r| r.is_success()).count();
        println!(
            "  {} {role}: {ok}/{} succeeded",
            green.apply_to("✓"),
            records.len()
        );
    }
    for (role, error) in &outcomes.failures {
        println!("  {} {role}: {error}", red.apply_to("✗"));
    }
}

/// Lists the product reports of an analysis run.
pub fn print_analysis_summary(outcome: &AnalysisOutcome) {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    println!();
    for report in &outcome.reports {
        let mark = if report.status == JobStatus::Completed {
            green.apply_to("✓")
        } else {
            red.apply_to("✗")
        };
        println!("  {mark} {:03} {} ({})", report.index, report.name, report.status);
    }
    println!(
        "\n{}/{} products analysed",
        outcome.succeeded(),
        outcome.reports.len()
    );
    println!("Summary report: {}", outcome.summary.display());
    println!("All reports saved to: {}", outcome.output_dir.display());
}

fn print_phase(title: &str, phase: &PhaseReport) {
    println!("  {title}:");
    println!("    Status: {}", phase.status);
    match phase.duration_secs {
        Some(secs) => println!("    Duration: {secs:.2} seconds"),
        None => println!("    Duration: n/a"),
    }
    match &phase.output_dir {
        Some(dir) => println!("    Output: {}", dir.display()),
        None => println!("    Output: n/a"),
    }
    if let Some(error) = &phase.error {
        println!("    Error: {error}");
    }
}

pub fn print_pipeline_summary(summary: &PipelineSummary) {
    let rule = "=".repeat(60);
    let status = if summary.succeeded() {
        Style::new().green().bold()
    } else {
        Style::new().red().bold()
    };
    println!("\n{rule}");
    println!("PIPELINE EXECUTION SUMMARY");
    println!("{rule}");
    println!(
        "Status: {}",
        status.apply_to(summary.status.to_string().to_uppercase())
    );
    if summary.dry_run {
        println!("Dry run: nothing was executed");
    }
    if let Some(error) = &summary.error {
        println!("Error: {error}");
    }
    println!("Total Duration: {:.2} seconds", summary.total_duration_secs);
    println!("\nPhase Details:");
    print_phase("Search Phase", &summary.phases.search);
    println!();
    print_phase("Product Analysis Phase", &summary.phases.analysis);
    println!("{rule}");
}
