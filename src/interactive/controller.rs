use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use super::state::{SessionMachine, TurnEvent, TurnState};
use super::{EndReason, SessionTranscript, TranscriptTurn, TurnKind, is_clarification_request};
use crate::error::Result;
use crate::model::{Citation, JobStatus, Metrics};
use crate::poller::{JobPoller, PollOutcome, PollSettings};
use crate::report::ReportWriter;
use crate::service::{JobService, ServiceError};
use crate::session_store::{SessionBackend, SessionStore};

const CONTINUE_MESSAGE: &str = "Please continue.";

/// Unusable answers accepted in a row before a prompt gives up and the
/// session ends as if input had closed.
const MAX_INVALID_ANSWERS: usize = 5;
const GAVE_UP: &str = "No usable answer received. Ending session.";

/// Terminal side of a session: reads answers and shows agent output.
pub trait Prompter {
    /// Shows `prompt` and reads one line; `None` once input is closed.
    fn ask(&mut self, prompt: &str) -> Option<String>;

    fn show_response(&mut self, text: &str, citations: &[Citation]);

    fn notice(&mut self, message: &str);

    /// Called right before a job is submitted.
    fn waiting(&mut self) {}

    /// Called once the job has settled.
    fn finished(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct InteractiveSettings {
    /// Session store key whose conversation this session continues.
    pub session_key: String,
    pub agent: String,
    pub turn_timeout: Duration,
    /// Wall-clock budget for the whole session.
    pub session_budget: Duration,
    pub poll: PollSettings,
}

/// A finished session and where it was written.
#[derive(Debug, Clone)]
pub struct SavedSession {
    pub transcript: SessionTranscript,
    pub markdown: PathBuf,
    pub json: PathBuf,
}

/// Totals over every job run during the session.
#[derive(Default)]
struct Totals {
    first_output: Option<f64>,
    tokens_in: u64,
    tokens_out: u64,
    total_tokens: u64,
    citations: Vec<Citation>,
}

impl Totals {
    fn absorb(&mut self, turn_offset: Duration, outcome: &PollOutcome) {
        if self.first_output.is_none() {
            self.first_output = outcome
                .metrics
                .time_to_first_output
                .map(|ttfo| turn_offset.as_secs_f64() + ttfo);
        }
        self.tokens_in += outcome.metrics.tokens_in;
        self.tokens_out += outcome.metrics.tokens_out;
        self.total_tokens += outcome.metrics.total_tokens;
        for citation in &outcome.output.citations {
            if !self.citations.iter().any(|c| c.url == citation.url) {
                self.citations.push(citation.clone());
            }
        }
    }

    fn metrics(&self, elapsed: Duration) -> Metrics {
        Metrics {
            time_to_first_output: self.first_output,
            total_time: elapsed.as_secs_f64(),
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            total_tokens: self.total_tokens,
        }
    }
}

/// What the user wants after a turn settled.
enum Next {
    Send(String, TurnKind),
    Retry,
    End(EndReason),
}

fn read_line<P: Prompter>(prompter: &mut P, prompt: &str) -> Option<String> {
    prompter.ask(prompt).map(|line| line.trim().to_string())
}

fn is_exit(answer: &str) -> bool {
    answer.eq_ignore_ascii_case("exit")
}

pub struct InteractiveController<'a, S, B> {
    service: &'a S,
    store: &'a SessionStore<B>,
    reports: ReportWriter,
    settings: InteractiveSettings,
}

impl<'a, S: JobService, B: SessionBackend> InteractiveController<'a, S, B> {
    pub fn new(
        service: &'a S,
        store: &'a SessionStore<B>,
        reports: ReportWriter,
        settings: InteractiveSettings,
    ) -> Self {
        Self {
            service,
            store,
            reports,
            settings,
        }
    }

    /// Runs the conversation until the user exits, input closes or the
    /// session budget runs out, then writes the transcript.
    pub async fn run<P: Prompter>(
        &self,
        prompter: &mut P,
        initial_question: Option<String>,
    ) -> Result<SavedSession> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut machine = SessionMachine::new();
        let mut turns = Vec::new();
        let mut totals = Totals::default();

        let first = match initial_question.map(|q| q.trim().to_string()) {
            Some(q) if !q.is_empty() => Some(q),
            _ => ask_question(prompter),
        };
        let end_reason = match first {
            None => {
                machine.apply(TurnEvent::Exit(EndReason::InputClosed));
                EndReason::InputClosed
            }
            Some(question) => {
                let mut handle = self
                    .store
                    .get_or_create(self.service, &self.settings.session_key)
                    .await?;
                info!(key = %self.settings.session_key, handle = %handle, "interactive session started");
                self.converse(
                    prompter,
                    &mut machine,
                    &mut handle,
                    (question, TurnKind::Question),
                    clock,
                    &mut turns,
                    &mut totals,
                )
                .await
            }
        };

        let transcript = SessionTranscript {
            session_key: self.settings.session_key.clone(),
            started_at,
            ended_at: Utc::now(),
            end_reason,
            turns,
            metrics: totals.metrics(clock.elapsed()),
            citations: totals.citations,
        };
        let stem = format!("interactive_session_{}", started_at.format("%Y%m%d_%H%M%S"));
        let (markdown, json) = self.reports.write_transcript(&stem, &transcript)?;
        info!(reason = %end_reason, turns = transcript.turns.len(), path = %markdown.display(), "interactive session saved");

        Ok(SavedSession {
            transcript,
            markdown,
            json,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn converse<P: Prompter>(
        &self,
        prompter: &mut P,
        machine: &mut SessionMachine,
        handle: &mut String,
        first: (String, TurnKind),
        clock: Instant,
        turns: &mut Vec<TranscriptTurn>,
        totals: &mut Totals,
    ) -> EndReason {
        let poller = JobPoller::new(self.service, self.settings.poll.clone());
        let (mut message, mut kind) = first;
        let mut posted = false;
        let mut settled: Option<PollOutcome> = None;
        let mut failure = String::new();

        loop {
            let next = match machine.state() {
                TurnState::AwaitingUserInput => {
                    turns.push(TranscriptTurn::user(&message, kind));
                    posted = false;
                    machine.apply(TurnEvent::UserMessage);
                    continue;
                }
                TurnState::Submitted => {
                    let remaining = self.settings.session_budget.saturating_sub(clock.elapsed());
                    if remaining.is_zero() {
                        prompter.notice("Session time budget exhausted.");
                        Next::End(EndReason::BudgetExhausted)
                    } else {
                        let offset = clock.elapsed();
                        let timeout = self.settings.turn_timeout.min(remaining);
                        prompter.waiting();
                        let attempt = self
                            .attempt(&poller, handle, &message, &mut posted, timeout)
                            .await;
                        prompter.finished();
                        match attempt {
                            Ok(outcome) => {
                                totals.absorb(offset, &outcome);
                                settled = Some(outcome);
                                machine.apply(TurnEvent::JobSubmitted);
                            }
                            Err(e) => {
                                warn!(error = %e, "turn could not be submitted");
                                failure = e.to_string();
                                machine.apply(TurnEvent::SubmitFailed);
                            }
                        }
                        continue;
                    }
                }
                TurnState::Polling => {
                    let status = settled.as_ref().map_or(JobStatus::Error, |o| o.status());
                    machine.apply(TurnEvent::JobSettled(status));
                    continue;
                }
                TurnState::Responded => {
                    let text = match settled.take() {
                        Some(outcome) => {
                            let output = outcome.output;
                            prompter.show_response(&output.text, &output.citations);
                            turns.push(TranscriptTurn::agent(output.text.clone(), output.citations));
                            output.text
                        }
                        None => String::new(),
                    };
                    if is_clarification_request(&text) {
                        prompter.notice("The agent appears to be asking for clarification.");
                        answer_clarification(prompter)
                    } else {
                        choose_follow_up(prompter)
                    }
                }
                TurnState::Failed | TurnState::TimedOut => {
                    if let Some(outcome) = settled.take() {
                        failure = match (outcome.status(), outcome.error) {
                            (JobStatus::TimedOut, _) => outcome.output.text,
                            (status, Some(error)) => format!("Job {status}: {error}"),
                            (status, None) => format!("Job {status}"),
                        };
                    }
                    prompter.notice(&failure);
                    turns.push(TranscriptTurn::error(&failure));
                    choose_retry(prompter)
                }
                TurnState::Ended => return EndReason::UserExit,
            };

            match next {
                Next::Send(text, next_kind) => {
                    message = text;
                    kind = next_kind;
                    machine.apply(TurnEvent::Continue);
                }
                Next::Retry => {
                    info!(state = %machine.state(), "retrying last message");
                    machine.apply(TurnEvent::Retry);
                }
                Next::End(reason) => {
                    machine.apply(TurnEvent::Exit(reason));
                    return reason;
                }
            }
        }
    }

    /// Posts `message` unless it is already on the session, then runs a job.
    ///
    /// A rejected handle is replaced through the store; the message is then
    /// posted again on the next attempt.
    async fn attempt(
        &self,
        poller: &JobPoller<'_, S>,
        handle: &mut String,
        message: &str,
        posted: &mut bool,
        timeout: Duration,
    ) -> std::result::Result<PollOutcome, ServiceError> {
        let result = async {
            if !*posted {
                self.service.post_message(handle.as_str(), message).await?;
                *posted = true;
            }
            poller
                .resubmit(handle.as_str(), &self.settings.agent, timeout)
                .await
        }
        .await;

        if let Err(e) = &result {
            if e.is_session_invalid() {
                let key = &self.settings.session_key;
                self.store.invalidate(key);
                match self.store.get_or_create(self.service, key).await {
                    Ok(fresh) => {
                        warn!(key = %key, handle = %fresh, "session replaced");
                        *handle = fresh;
                        *posted = false;
                    }
                    Err(e) => warn!(key = %key, error = %e, "could not replace session"),
                }
            }
        }
        result
    }
}

fn ask_question<P: Prompter>(prompter: &mut P) -> Option<String> {
    for _ in 0..MAX_INVALID_ANSWERS {
        let question = read_line(prompter, "Enter your research question: ")?;
        if !question.is_empty() {
            return Some(question);
        }
        prompter.notice("Empty question not allowed. Please provide a question.");
    }
    prompter.notice(GAVE_UP);
    None
}

fn answer_clarification<P: Prompter>(prompter: &mut P) -> Next {
    for _ in 0..MAX_INVALID_ANSWERS {
        let Some(answer) = read_line(prompter, "Your response (or 'exit' to end session): ") else {
            return Next::End(EndReason::InputClosed);
        };
        if is_exit(&answer) {
            return Next::End(EndReason::UserExit);
        }
        if answer.is_empty() {
            prompter.notice("Empty response not allowed. Please provide a response.");
            continue;
        }
        return Next::Send(answer, TurnKind::ClarificationAnswer);
    }
    gave_up(prompter)
}

fn choose_follow_up<P: Prompter>(prompter: &mut P) -> Next {
    for _ in 0..MAX_INVALID_ANSWERS {
        let Some(choice) = read_line(
            prompter,
            "Do you have follow-up questions, want the agent to continue, or are you done? (yes/continue/no/exit): ",
        ) else {
            return Next::End(EndReason::InputClosed);
        };
        match choice.to_lowercase().as_str() {
            "no" | "exit" => return Next::End(EndReason::UserExit),
            "continue" => return Next::Send(CONTINUE_MESSAGE.to_string(), TurnKind::Continuation),
            "yes" => return ask_follow_up(prompter),
            _ => prompter.notice("Please answer yes, continue, no or exit."),
        }
    }
    gave_up(prompter)
}

fn ask_follow_up<P: Prompter>(prompter: &mut P) -> Next {
    for _ in 0..MAX_INVALID_ANSWERS {
        let Some(question) = read_line(prompter, "Please enter your follow-up question: ") else {
            return Next::End(EndReason::InputClosed);
        };
        if !question.is_empty() {
            return Next::Send(question, TurnKind::FollowUp);
        }
        prompter.notice("Empty question not allowed. Please provide a question.");
    }
    gave_up(prompter)
}

fn choose_retry<P: Prompter>(prompter: &mut P) -> Next {
    for _ in 0..MAX_INVALID_ANSWERS {
        let Some(choice) = read_line(prompter, "Would you like to retry or exit? (retry/exit): ")
        else {
            return Next::End(EndReason::InputClosed);
        };
        match choice.to_lowercase().as_str() {
            "exit" => return Next::End(EndReason::UserExit),
            "retry" | "" => return Next::Retry,
            _ => prompter.notice("Please answer retry or exit."),
        }
    }
    gave_up(prompter)
}

fn gave_up<P: Prompter>(prompter: &mut P) -> Next {
    prompter.notice(GAVE_UP);
    Next::End(EndReason::InputClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interactive::Speaker;
    use crate::service::mock::{MockJobService, Reply};
    use crate::session_store::{BackupPolicy, MemoryBackend};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    #[derive(Default)]
    struct Scripted {
        answers: VecDeque<String>,
        asked: Vec<String>,
        shown: Vec<String>,
        notices: Vec<String>,
    }

    impl Scripted {
        fn new(answers: &[&str]) -> Self {
            Self {
                answers: answers.iter().map(|s| s.to_string()).collect(),
                ..Self::default()
            }
        }
    }

    impl Prompter for Scripted {
        fn ask(&mut self, prompt: &str) -> Option<String> {
            self.asked.push(prompt.to_string());
            self.answers.pop_front()
        }

        fn show_response(&mut self, text: &str, _citations: &[Citation]) {
            self.shown.push(text.to_string());
        }

        fn notice(&mut self, message: &str) {
            self.notices.push(message.to_string());
        }
    }

    /// Stands in for a terminal whose reads always come back blank.
    #[derive(Default)]
    struct Blank {
        asked: usize,
        notices: Vec<String>,
    }

    impl Prompter for Blank {
        fn ask(&mut self, _prompt: &str) -> Option<String> {
            self.asked += 1;
            Some(String::new())
        }

        fn show_response(&mut self, _text: &str, _citations: &[Citation]) {}

        fn notice(&mut self, message: &str) {
            self.notices.push(message.to_string());
        }
    }

    fn settings(turn_ms: u64, budget_ms: u64) -> InteractiveSettings {
        InteractiveSettings {
            session_key: "interactive-test".into(),
            agent: "asst_research".into(),
            turn_timeout: Duration::from_millis(turn_ms),
            session_budget: Duration::from_millis(budget_ms),
            poll: PollSettings {
                tick: Duration::from_millis(1),
                ..PollSettings::default()
            },
        }
    }

    fn store() -> SessionStore<MemoryBackend> {
        SessionStore::open(
            MemoryBackend::new(),
            BackupPolicy {
                probability: 0.0,
                retention: 10,
            },
        )
    }

    fn kinds(saved: &SavedSession) -> Vec<(Speaker, TurnKind)> {
        saved
            .transcript
            .turns
            .iter()
            .map(|t| (t.speaker, t.kind))
            .collect()
    }

    #[tokio::test]
    async fn single_question_then_exit() {
        let dir = tempdir().unwrap();
        let service = MockJobService::echo();
        let store = store();
        let controller = InteractiveController::new(
            &service,
            &store,
            ReportWriter::new(dir.path()),
            settings(1_000, 10_000),
        );
        let mut prompter = Scripted::new(&["no"]);

        let saved = controller
            .run(&mut prompter, Some("What is X".into()))
            .await
            .unwrap();

        assert_eq!(saved.transcript.end_reason, EndReason::UserExit);
        assert_eq!(
            kinds(&saved),
            vec![
                (Speaker::User, TurnKind::Question),
                (Speaker::Agent, TurnKind::Response),
            ]
        );
        assert_eq!(prompter.shown, vec!["Answer to: What is X"]);
        assert_eq!(saved.transcript.metrics.total_tokens, 30);
        assert!(saved.transcript.metrics.time_to_first_output.is_some());
        assert!(saved.markdown.exists());
        assert!(saved.json.exists());
        assert!(store.get("interactive-test").is_some());
    }

    #[tokio::test]
    async fn clarification_answer_is_sent_on_same_session() {
        let dir = tempdir().unwrap();
        let service = MockJobService::new(|prompt, _| Reply::Complete {
            after: 1,
            text: if prompt == "Tell me about food" {
                "Which brand do you mean?".into()
            } else {
                format!("Facts about {prompt}.")
            },
        });
        let store = store();
        let controller = InteractiveController::new(
            &service,
            &store,
            ReportWriter::new(dir.path()),
            settings(1_000, 10_000),
        );
        let mut prompter = Scripted::new(&["", "Acme", "exit"]);

        let saved = controller
            .run(&mut prompter, Some("Tell me about food".into()))
            .await
            .unwrap();

        assert_eq!(
            kinds(&saved),
            vec![
                (Speaker::User, TurnKind::Question),
                (Speaker::Agent, TurnKind::Response),
                (Speaker::User, TurnKind::ClarificationAnswer),
                (Speaker::Agent, TurnKind::Response),
            ]
        );
        assert_eq!(service.sessions_created(), 1);
        assert_eq!(saved.transcript.metrics.total_tokens, 60);
        assert!(prompter.notices.iter().any(|n| n.contains("clarification")));
        assert!(prompter.notices.iter().any(|n| n.starts_with("Empty response")));
    }

    #[tokio::test]
    async fn follow_up_and_continue() {
        let dir = tempdir().unwrap();
        let service = MockJobService::echo();
        let store = store();
        let controller = InteractiveController::new(
            &service,
            &store,
            ReportWriter::new(dir.path()),
            settings(1_000, 10_000),
        );
        let mut prompter = Scripted::new(&["What is X", "yes", "", "What about Y", "continue", "no"]);

        let saved = controller.run(&mut prompter, None).await.unwrap();

        let user_turns: Vec<_> = saved
            .transcript
            .turns
            .iter()
            .filter(|t| t.speaker == Speaker::User)
            .map(|t| (t.kind, t.content.as_str()))
            .collect();
        assert_eq!(
            user_turns,
            vec![
                (TurnKind::Question, "What is X"),
                (TurnKind::FollowUp, "What about Y"),
                (TurnKind::Continuation, CONTINUE_MESSAGE),
            ]
        );
        assert_eq!(
            service.submitted_prompts(),
            vec!["What is X", "What about Y", CONTINUE_MESSAGE]
        );
    }

    #[tokio::test]
    async fn timed_out_turn_can_be_retried() {
        let dir = tempdir().unwrap();
        let calls = AtomicU32::new(0);
        let service = MockJobService::new(move |_, _| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Reply::Hang {
                    text: "Partial findings".into(),
                }
            } else {
                Reply::Complete {
                    after: 1,
                    text: "Full findings.".into(),
                }
            }
        });
        let store = store();
        let controller = InteractiveController::new(
            &service,
            &store,
            ReportWriter::new(dir.path()),
            settings(20, 10_000),
        );
        let mut prompter = Scripted::new(&["retry", "exit"]);

        let saved = controller
            .run(&mut prompter, Some("Research Z".into()))
            .await
            .unwrap();

        assert_eq!(
            kinds(&saved),
            vec![
                (Speaker::User, TurnKind::Question),
                (Speaker::System, TurnKind::Error),
                (Speaker::Agent, TurnKind::Response),
            ]
        );
        assert!(saved.transcript.turns[1].content.contains("timed out"));
        assert_eq!(service.canceled_jobs().len(), 1);
        // The retry reuses the posted message instead of posting it again.
        let handle = store.get("interactive-test").unwrap();
        let messages = service.list_messages(&handle).await.unwrap();
        assert_eq!(messages.iter().filter(|m| m.text == "Research Z").count(), 1);
        assert_eq!(service.submitted_prompts(), vec!["Research Z", "Research Z"]);
    }

    #[tokio::test]
    async fn budget_exhaustion_ends_session() {
        let dir = tempdir().unwrap();
        let service = MockJobService::new(|_, _| Reply::Hang {
            text: String::new(),
        });
        let store = store();
        let controller = InteractiveController::new(
            &service,
            &store,
            ReportWriter::new(dir.path()),
            settings(60_000, 30),
        );
        let mut prompter = Scripted::new(&["retry", "retry", "retry"]);

        let saved = controller
            .run(&mut prompter, Some("Endless".into()))
            .await
            .unwrap();

        assert_eq!(saved.transcript.end_reason, EndReason::BudgetExhausted);
        assert!(saved.transcript.metrics.total_time >= 0.03);
        assert!(saved.transcript.metrics.time_to_first_output.is_none());
    }

    #[tokio::test]
    async fn closed_input_ends_without_turns() {
        let dir = tempdir().unwrap();
        let service = MockJobService::echo();
        let store = store();
        let controller = InteractiveController::new(
            &service,
            &store,
            ReportWriter::new(dir.path()),
            settings(1_000, 10_000),
        );
        let mut prompter = Scripted::new(&[]);

        let saved = controller.run(&mut prompter, None).await.unwrap();

        assert_eq!(saved.transcript.end_reason, EndReason::InputClosed);
        assert!(saved.transcript.turns.is_empty());
        assert_eq!(service.sessions_created(), 0);
    }

    #[tokio::test]
    async fn stale_cached_session_is_replaced() {
        let dir = tempdir().unwrap();
        let service = MockJobService::echo();
        let store = store();
        let stale = store.get_or_create(&service, "interactive-test").await.unwrap();
        service.kill_session(&stale);
        let controller = InteractiveController::new(
            &service,
            &store,
            ReportWriter::new(dir.path()),
            settings(1_000, 10_000),
        );
        let mut prompter = Scripted::new(&["no"]);

        let saved = controller
            .run(&mut prompter, Some("First question".into()))
            .await
            .unwrap();

        assert_ne!(store.get("interactive-test").unwrap(), stale);
        assert_eq!(service.sessions_created(), 2);
        assert_eq!(saved.transcript.responses().count(), 1);
    }

    /// Kills the first session whenever the user is asked something.
    struct Killing<'a> {
        inner: Scripted,
        service: &'a MockJobService,
    }

    impl Prompter for Killing<'_> {
        fn ask(&mut self, prompt: &str) -> Option<String> {
            self.service.kill_session("thread_1");
            self.inner.ask(prompt)
        }

        fn show_response(&mut self, text: &str, citations: &[Citation]) {
            self.inner.show_response(text, citations);
        }

        fn notice(&mut self, message: &str) {
            self.inner.notice(message);
        }
    }

    #[tokio::test]
    async fn session_lost_mid_conversation_is_replaced_on_retry() {
        let dir = tempdir().unwrap();
        let service = MockJobService::echo();
        let store = store();
        let controller = InteractiveController::new(
            &service,
            &store,
            ReportWriter::new(dir.path()),
            settings(1_000, 10_000),
        );
        let mut prompter = Killing {
            inner: Scripted::new(&["yes", "Second question", "retry", "no"]),
            service: &service,
        };

        let saved = controller
            .run(&mut prompter, Some("First question".into()))
            .await
            .unwrap();

        assert_eq!(
            kinds(&saved),
            vec![
                (Speaker::User, TurnKind::Question),
                (Speaker::Agent, TurnKind::Response),
                (Speaker::User, TurnKind::FollowUp),
                (Speaker::System, TurnKind::Error),
                (Speaker::Agent, TurnKind::Response),
            ]
        );
        assert_eq!(service.sessions_created(), 2);
        assert_ne!(store.get("interactive-test").unwrap(), "thread_1");
        let handle = store.get("interactive-test").unwrap();
        let messages = service.list_messages(&handle).await.unwrap();
        assert_eq!(messages[0].text, "Second question");
    }

    #[tokio::test]
    async fn blank_answers_end_the_session() {
        let dir = tempdir().unwrap();
        let service = MockJobService::echo();
        let store = store();
        let controller = InteractiveController::new(
            &service,
            &store,
            ReportWriter::new(dir.path()),
            settings(100, 200),
        );

        let mut prompter = Blank::default();
        let saved = tokio::time::timeout(Duration::from_secs(2), controller.run(&mut prompter, None))
            .await
            .expect("session ends")
            .unwrap();
        assert_eq!(saved.transcript.end_reason, EndReason::InputClosed);
        assert_eq!(prompter.asked, MAX_INVALID_ANSWERS);
        assert_eq!(prompter.notices.last().map(String::as_str), Some(GAVE_UP));
        assert_eq!(service.sessions_created(), 0);

        let mut prompter = Blank::default();
        let saved = tokio::time::timeout(
            Duration::from_secs(2),
            controller.run(&mut prompter, Some("What is X".into())),
        )
        .await
        .expect("session ends")
        .unwrap();
        assert_eq!(saved.transcript.end_reason, EndReason::InputClosed);
        assert_eq!(saved.transcript.turns.len(), 2);
        assert!(saved.json.exists());
    }

    #[tokio::test]
    async fn blank_retry_answers_stop_at_the_budget() {
        let dir = tempdir().unwrap();
        let service = MockJobService::new(|_, _| Reply::Fail {
            after: 1,
            message: "upstream error".into(),
        });
        let store = store();
        let controller = InteractiveController::new(
            &service,
            &store,
            ReportWriter::new(dir.path()),
            settings(100, 200),
        );
        let mut prompter = Blank::default();

        let saved = tokio::time::timeout(
            Duration::from_secs(2),
            controller.run(&mut prompter, Some("What is X".into())),
        )
        .await
        .expect("session ends")
        .unwrap();
        assert!(matches!(
            saved.transcript.end_reason,
            EndReason::BudgetExhausted | EndReason::InputClosed
        ));
        assert!(saved.markdown.exists());
    }
}
