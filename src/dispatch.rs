//! Dispatch request builder
//!
//! Translates a pending evaluation (submission + problem definition) into a
//! queueable task. For submit-answer problems the submitted file is read from
//! artifact storage before anything is enqueued, so a storage failure fails
//! the whole submit instead of producing a partial task.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::server::ServerState;
use crate::task::{QueueEntry, Task, TaskParam};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemKind {
    Traditional,
    Interaction,
    SubmitAnswer,
}

/// Judge-relevant slice of a problem definition
#[derive(Debug, Clone)]
pub struct ProblemInfo {
    pub kind: ProblemKind,
    /// Test data set name workers resolve against their data store
    pub test_data: String,
    /// Time limit in milliseconds
    pub time_limit: u32,
    /// Memory limit in MB
    pub memory_limit: u32,
    pub file_io_input: Option<String>,
    pub file_io_output: Option<String>,
}

/// A submission awaiting evaluation
#[derive(Debug, Clone)]
pub struct PendingJudging {
    pub task_id: String,
    pub language: String,
    pub code: String,
    /// Storage key of the submitted answer file (submit-answer problems)
    pub answer_file: Option<String>,
}

/// Build the task for this evaluation and enqueue it.
pub async fn submit(
    state: &ServerState,
    judging: &PendingJudging,
    problem: &ProblemInfo,
    priority: f64,
) -> Result<()> {
    let task_id = judging.task_id.clone();
    let test_data = problem.test_data.clone();

    let entry = match problem.kind {
        ProblemKind::Traditional => {
            let mut param = base_param(judging, problem);
            param.file_io_input = problem.file_io_input.clone();
            param.file_io_output = problem.file_io_output.clone();
            QueueEntry::new(Task::standard(task_id, test_data, priority, param))
        }
        ProblemKind::Interaction => QueueEntry::new(Task::interaction(
            task_id,
            test_data,
            priority,
            base_param(judging, problem),
        )),
        ProblemKind::SubmitAnswer => {
            let key = judging
                .answer_file
                .as_deref()
                .ok_or_else(|| anyhow!("Submit-answer judging has no answer file"))?;
            let bytes = state
                .storage
                .download(key)
                .await
                .with_context(|| format!("Failed to read submitted answer {}", key))?;
            QueueEntry::with_extra_data(
                Task::answer_submission(task_id, test_data, priority),
                bytes,
            )
        }
    };

    state.queue.push(&entry).await?;
    info!(
        "Enqueued task {} (type={:?}, priority={})",
        entry.content.task_id, entry.content.task_type, priority
    );
    Ok(())
}

fn base_param(judging: &PendingJudging, problem: &ProblemInfo) -> TaskParam {
    TaskParam {
        language: judging.language.clone(),
        code: judging.code.clone(),
        time_limit: problem.time_limit,
        memory_limit: problem.memory_limit,
        file_io_input: None,
        file_io_output: None,
    }
}
