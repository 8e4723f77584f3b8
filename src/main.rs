use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use uuid::Uuid;

use research_orchestrator::analysis::ProductAnalyst;
use research_orchestrator::batch::BatchDriver;
use research_orchestrator::chat::KeyedChat;
use research_orchestrator::checkpoint::CheckpointFile;
use research_orchestrator::cli::{Cli, Command, RunArgs};
use research_orchestrator::config::ResearchConfig;
use research_orchestrator::input::read_work_items;
use research_orchestrator::interactive::{InteractiveController, InteractiveSettings};
use research_orchestrator::model::RoleContext;
use research_orchestrator::pipeline::{
    PIPELINE_DIR_PREFIX, Pipeline, PipelineOptions, SearchSource,
};
use research_orchestrator::report::{
    ANALYSIS_DIR_PREFIX, ReportWriter, latest_output_dir, resolve_output_dir, stamped_dir,
};
use research_orchestrator::scheduler::{RoleOutcomes, RoleScheduler, checkpoint_name};
use research_orchestrator::service::HttpJobService;
use research_orchestrator::session_store::{FileBackend, PeriodicSave, SessionStore};
use research_orchestrator::ui::{self, ConsolePrompter};

/// How long shutdown waits for the periodic saver before the final save.
const SAVE_GRACE: Duration = Duration::from_secs(2);

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(format!("research_orchestrator={level}").parse()?))
        .init();
    Ok(())
}

type Store = SessionStore<FileBackend>;

fn open_store(config: &ResearchConfig) -> (Arc<Store>, PeriodicSave) {
    let store = Arc::new(SessionStore::open(
        FileBackend::new(&config.session_dir),
        config.backup_policy(),
    ));
    let saver = store.spawn_periodic_save(config.save_interval());
    (store, saver)
}

/// Configured roles, narrowed to `only` when given.
fn select_roles(config: &ResearchConfig, only: &[String]) -> Result<Vec<RoleContext>> {
    let mut roles = config.role_contexts();
    if !only.is_empty() {
        roles.retain(|r| only.contains(&r.name));
        if roles.is_empty() {
            bail!("no configured role matches {}", only.join(", "));
        }
    }
    Ok(roles)
}

fn prepare_run(run: &RunArgs) -> Result<(std::path::PathBuf, bool)> {
    resolve_output_dir(Path::new("."), run.output_dir.clone(), run.resume)
        .context("choosing the output directory")
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = ResearchConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    let service = Arc::new(HttpJobService::new(&config.endpoint, &config.api_key)?);

    match cli.command {
        Command::Batch { run, role } => {
            let items = read_work_items(&run.input)?;
            let role = RoleContext::new(role, config.agent()?);
            let (dir, resume) = prepare_run(&run)?;
            let driver = BatchDriver::new(
                service,
                config.batch_settings(resume, run.timeout),
                ReportWriter::new(&dir),
            );
            let checkpoint = CheckpointFile::new(dir.join(checkpoint_name(&role.name)));

            let mut outcomes = RoleOutcomes::default();
            match driver.run(&items, &role, &checkpoint).await {
                Ok(records) => {
                    outcomes.results.insert(role.name, records);
                }
                Err(e) => {
                    outcomes.failures.insert(role.name, e.to_string());
                }
            }
            ui::print_role_summary(&outcomes);
            println!("\nResults saved to {}", dir.display());
            Ok(exit_code(outcomes.is_complete()))
        }

        Command::Roles { run, only } => {
            let items = read_work_items(&run.input)?;
            let roles = select_roles(&config, &only)?;
            let (dir, resume) = prepare_run(&run)?;
            let scheduler =
                RoleScheduler::new(service, config.batch_settings(resume, run.timeout), &dir);

            let outcomes = scheduler.run_all(&roles, &items).await;
            ui::print_role_summary(&outcomes);
            println!("\nResults saved to {}", dir.display());
            Ok(exit_code(outcomes.is_complete()))
        }

        Command::Analyze {
            input_dir,
            output_dir,
            timeout,
        } => {
            let input_dir = match input_dir {
                Some(dir) => dir,
                None => latest_output_dir(Path::new("."))?
                    .context("no research_results_* directory found; pass --input-dir")?,
            };
            let output_dir = output_dir.unwrap_or_else(|| stamped_dir(Path::new("."), ANALYSIS_DIR_PREFIX));
            println!("Using input directory: {}", input_dir.display());
            println!("Using output directory: {}", output_dir.display());

            let analyst = ProductAnalyst::new(
                service,
                config.analysis_agent()?,
                config.batch_settings(false, timeout),
                ReportWriter::new(&output_dir),
            );
            let outcome = analyst.run_dir(&input_dir).await?;
            ui::print_analysis_summary(&outcome);
            Ok(exit_code(outcome.is_complete()))
        }

        Command::Pipeline {
            input,
            skip_search: _,
            search_dir,
            output_base,
            dry_run,
            timeout,
            only,
        } => {
            let search = match (search_dir, input) {
                (Some(dir), _) => SearchSource::Existing(dir),
                (None, Some(input)) => SearchSource::Run {
                    input,
                    roles: select_roles(&config, &only)?,
                },
                (None, None) => bail!("pass an input file or --search-dir"),
            };
            let options = PipelineOptions {
                output_base: output_base
                    .unwrap_or_else(|| stamped_dir(Path::new("."), PIPELINE_DIR_PREFIX)),
                search,
                analysis_agent: config.analysis_agent()?.to_string(),
                settings: config.batch_settings(false, timeout),
                dry_run,
            };
            let summary = Pipeline::new(service, options).run().await;
            ui::print_pipeline_summary(&summary);
            Ok(exit_code(summary.succeeded()))
        }

        Command::Interactive {
            question,
            session,
            output_dir,
        } => {
            let settings = InteractiveSettings {
                session_key: session.unwrap_or_else(|| format!("interactive-{}", Uuid::new_v4())),
                agent: config.agent()?.to_string(),
                turn_timeout: Duration::from_secs(config.interactive_question_timeout_secs),
                session_budget: Duration::from_secs(config.interactive_session_timeout_secs),
                poll: config.poll_settings(),
            };
            let (store, saver) = open_store(&config);
            let controller = InteractiveController::new(
                service.as_ref(),
                store.as_ref(),
                ReportWriter::new(output_dir),
                settings,
            );
            let mut prompter = ConsolePrompter::new();
            let saved = controller.run(&mut prompter, question).await;
            store.shutdown(saver, SAVE_GRACE).await?;

            let saved = saved?;
            println!("\nSession {} ({})", saved.transcript.session_key, saved.transcript.end_reason);
            println!("Transcript saved to {}", saved.markdown.display());
            Ok(ExitCode::SUCCESS)
        }

        Command::Ask {
            key,
            question,
            timeout,
        } => {
            let agent = config.agent()?.to_string();
            let timeout = Duration::from_secs(timeout.unwrap_or(config.chat_timeout_secs));
            let (store, saver) = open_store(&config);
            let chat = KeyedChat::new(
                service.as_ref(),
                store.as_ref(),
                agent,
                config.poll_settings(),
                config.retry_policy(),
            );
            let record = ui::with_spinner("Researching", chat.ask(&key, &question, timeout)).await;
            store.shutdown(saver, SAVE_GRACE).await?;

            ui::print_record(&record);
            Ok(exit_code(record.is_success()))
        }

        Command::History { key } => {
            let (store, saver) = open_store(&config);
            let chat = KeyedChat::new(
                service.as_ref(),
                store.as_ref(),
                config.agent_id.clone(),
                config.poll_settings(),
                config.retry_policy(),
            );
            let messages = chat.history(&key).await;
            store.shutdown(saver, SAVE_GRACE).await?;

            ui::print_history(&messages?);
            Ok(ExitCode::SUCCESS)
        }

        Command::Reset { key } => {
            let (store, saver) = open_store(&config);
            let chat = KeyedChat::new(
                service.as_ref(),
                store.as_ref(),
                config.agent_id.clone(),
                config.poll_settings(),
                config.retry_policy(),
            );
            let handle = chat.reset(&key).await;
            store.shutdown(saver, SAVE_GRACE).await?;

            println!("Session '{key}' now uses {}", handle?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn exit_code(ok: bool) -> ExitCode {
    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.verbose) {
        eprintln!("error: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "aborted");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
