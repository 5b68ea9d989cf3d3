//! Reporting pipeline
//!
//! Decodes worker-sent progress and result events and fans them out to the
//! progress cache, the external observer and the durable record store. The
//! two streams are independent: the progress stream feeds live status, the
//! result stream reconciles final results into storage.
//!
//! Events for one task are expected in the order Started -> Compiled ->
//! Progress* -> Finished -> Reported; out-of-order arrival is a worker bug,
//! not something this pipeline reorders.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::progress::StatusSnapshot;
use crate::server::ServerState;

/// Per-case status codes reported by workers.
///
/// `WAITING` and `JUDGING` are the two "still pending" codes; a case counts
/// as finished iff its status is neither.
pub mod case_status {
    pub const WAITING: i32 = 0;
    pub const JUDGING: i32 = 1;
    pub const ACCEPTED: i32 = 2;
    pub const WRONG_ANSWER: i32 = 3;
    pub const TIME_LIMIT_EXCEEDED: i32 = 4;
    pub const MEMORY_LIMIT_EXCEEDED: i32 = 5;
    pub const RUNTIME_ERROR: i32 = 6;
    pub const SYSTEM_ERROR: i32 = 7;
}

pub fn is_case_finished(status: i32) -> bool {
    status != case_status::WAITING && status != case_status::JUDGING
}

fn verdict_name(status: i32) -> &'static str {
    match status {
        case_status::ACCEPTED => "Accepted",
        case_status::WRONG_ANSWER => "Wrong Answer",
        case_status::TIME_LIMIT_EXCEEDED => "Time Limit Exceeded",
        case_status::MEMORY_LIMIT_EXCEEDED => "Memory Limit Exceeded",
        case_status::RUNTIME_ERROR => "Runtime Error",
        case_status::SYSTEM_ERROR => "System Error",
        _ => "Judgement Failed",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseProgress {
    pub status: i32,
    #[serde(default)]
    pub time: u32,
    #[serde(default)]
    pub memory: u32,
    #[serde(default)]
    pub score: f64,
}

/// Raw progress payload for a whole task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JudgeProgress {
    #[serde(default)]
    pub cases: Vec<CaseProgress>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileStatus {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Progress stream events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started,
    Compiled(CompileStatus),
    Progress(JudgeProgress),
    Finished(JudgeProgress),
    Reported,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub task_id: String,
    pub event: ProgressEvent,
}

/// Result stream events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum ResultEvent {
    Finished(JudgeProgress),
    Compiled(CompileStatus),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultReport {
    pub task_id: String,
    pub event: ResultEvent,
}

/// Converted final numbers for a progress payload
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSummary {
    pub status: String,
    pub score: f64,
    pub time: u32,
    pub memory: u32,
}

/// External result-conversion collaborator.
pub trait ResultSummarizer: Send + Sync {
    fn summarize(&self, progress: &JudgeProgress) -> ResultSummary;
}

/// Default conversion: sum case scores and times, take peak memory, and name
/// the status after the first non-accepted finished case.
pub struct CaseSummarizer;

impl ResultSummarizer for CaseSummarizer {
    fn summarize(&self, progress: &JudgeProgress) -> ResultSummary {
        let mut score = 0.0;
        let mut time = 0u32;
        let mut memory = 0u32;
        let mut status: Option<&'static str> = None;

        for case in &progress.cases {
            if !is_case_finished(case.status) {
                continue;
            }
            score += case.score;
            time = time.saturating_add(case.time);
            memory = memory.max(case.memory);
            if case.status != case_status::ACCEPTED && status.is_none() {
                status = Some(verdict_name(case.status));
            }
        }

        ResultSummary {
            status: status.unwrap_or("Accepted").to_string(),
            score,
            time,
            memory,
        }
    }
}

fn running_phase(progress: &JudgeProgress) -> String {
    let finished = progress
        .cases
        .iter()
        .filter(|c| is_case_finished(c.status))
        .count();
    format!("Running {}/{}", finished, progress.cases.len())
}

/// Progress stream handler. Infallible by design: every fan-out target is
/// either in-process or fire-and-forget.
pub async fn handle_progress(state: &ServerState, report: ProgressReport) {
    let task_id = &report.task_id;
    match report.event {
        ProgressEvent::Started => {
            debug!("Task {} started", task_id);
            state.notifier.task_started(task_id).await;
            state.cache.update(task_id, StatusSnapshot::compiling());
        }
        ProgressEvent::Compiled(status) => {
            debug!("Task {} compiled: success={}", task_id, status.success);
            state.notifier.compile_status(task_id, &status).await;
        }
        ProgressEvent::Progress(progress) => {
            let summary = state.summarizer.summarize(&progress);
            state.cache.update(
                task_id,
                StatusSnapshot {
                    result: running_phase(&progress),
                    score: summary.score,
                    time: summary.time,
                    memory: summary.memory,
                },
            );
            state.notifier.progress(task_id, &progress).await;
        }
        ProgressEvent::Finished(progress) => {
            debug!("Task {} finished", task_id);
            state.notifier.finished(task_id, &progress).await;
            // Delayed, not immediate: late status reads still succeed
            state.cache.retire(task_id);
        }
        ProgressEvent::Reported => {
            // Only the observer's transient state is released here; the cache
            // entry was already scheduled for retirement on Finished.
            state.notifier.cleanup(task_id).await;
        }
    }
}

/// Result stream handler. A report for a task id with no durable record is
/// a race with record deletion, not an error: drop it silently.
pub async fn handle_result(state: &ServerState, report: ResultReport) -> Result<()> {
    let task_id = &report.task_id;
    match report.event {
        ResultEvent::Finished(progress) => {
            let Some(mut record) = state.records.load(task_id).await? else {
                debug!("Dropping result for untracked task {}", task_id);
                return Ok(());
            };
            state.notifier.cleanup(task_id).await;

            let summary = state.summarizer.summarize(&progress);
            record.score = summary.score;
            record.pending = false;
            record.status = summary.status;
            record.total_time = summary.time;
            record.max_memory = summary.memory;
            record.result = Some(serde_json::to_value(&progress)?);
            state.records.save(&record).await?;
            state.records.propagate(&record).await?;
            info!(
                "Task {} result saved: status={}, score={}",
                task_id, record.status, record.score
            );
        }
        ResultEvent::Compiled(status) => {
            let Some(mut record) = state.records.load(task_id).await? else {
                debug!("Dropping compile result for untracked task {}", task_id);
                return Ok(());
            };
            record.compilation = Some(serde_json::to_value(&status)?);
            state.records.save(&record).await?;
        }
    }
    Ok(())
}
