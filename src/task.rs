//! Task data model
//!
//! A `Task` is one unit of evaluation work handed to a remote worker. The
//! `QueueEntry` wrapper is both the member stored in the priority queue and
//! the envelope delivered over the wire, so a requeued entry is byte-for-byte
//! the entry that was originally pushed.

use serde::{Deserialize, Serialize};

/// Kind of evaluation a worker has to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Compile, run against test data, compare output
    Standard,
    /// Compile, run against an interactor
    Interaction,
    /// No program to run; the submitted answer file itself is graded
    AnswerSubmission,
}

/// Judge parameters for tasks that carry a program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskParam {
    pub language: String,
    pub code: String,
    /// Time limit in milliseconds
    pub time_limit: u32,
    /// Memory limit in MB
    pub memory_limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_io_input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_io_output: Option<String>,
}

/// Content of a dispatched task.
///
/// `param` is `Some` exactly for `Standard` and `Interaction` tasks; answer
/// submissions instead carry their payload in `QueueEntry::extra_data`. The
/// constructors below are the only way the rest of the crate builds tasks,
/// which keeps that invariant in one place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    /// Name of the test data set the worker should fetch
    pub test_data: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub priority: f64,
    pub param: Option<TaskParam>,
}

impl Task {
    pub fn standard(task_id: String, test_data: String, priority: f64, param: TaskParam) -> Self {
        Self {
            task_id,
            test_data,
            task_type: TaskType::Standard,
            priority,
            param: Some(param),
        }
    }

    pub fn interaction(
        task_id: String,
        test_data: String,
        priority: f64,
        mut param: TaskParam,
    ) -> Self {
        // Interactive problems have no file IO
        param.file_io_input = None;
        param.file_io_output = None;
        Self {
            task_id,
            test_data,
            task_type: TaskType::Interaction,
            priority,
            param: Some(param),
        }
    }

    pub fn answer_submission(task_id: String, test_data: String, priority: f64) -> Self {
        Self {
            task_id,
            test_data,
            task_type: TaskType::AnswerSubmission,
            priority,
            param: None,
        }
    }
}

/// Queue member and `task` wire envelope.
///
/// `extra_data` holds the raw submitted answer file for answer-submission
/// tasks and is `None` for every other type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub content: Task,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_data: Option<Vec<u8>>,
}

impl QueueEntry {
    pub fn new(content: Task) -> Self {
        Self {
            content,
            extra_data: None,
        }
    }

    pub fn with_extra_data(content: Task, extra_data: Vec<u8>) -> Self {
        Self {
            content,
            extra_data: Some(extra_data),
        }
    }

    /// Priority score used by the queue; lives on the content so a requeue
    /// automatically restores the original priority.
    pub fn priority(&self) -> f64 {
        self.content.priority
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param() -> TaskParam {
        TaskParam {
            language: "cpp".into(),
            code: "int main() {}".into(),
            time_limit: 1000,
            memory_limit: 256,
            file_io_input: Some("data.in".into()),
            file_io_output: Some("data.out".into()),
        }
    }

    #[test]
    fn test_interaction_strips_file_io() {
        let task = Task::interaction("t1".into(), "prob1".into(), 5.0, param());
        let p = task.param.unwrap();
        assert!(p.file_io_input.is_none());
        assert!(p.file_io_output.is_none());
    }

    #[test]
    fn test_answer_submission_has_no_param() {
        let task = Task::answer_submission("t2".into(), "prob2".into(), 1.0);
        assert!(task.param.is_none());
        assert_eq!(task.task_type, TaskType::AnswerSubmission);
    }

    #[test]
    fn test_entry_roundtrips_through_json() {
        let entry = QueueEntry::with_extra_data(
            Task::answer_submission("t3".into(), "prob3".into(), 2.5),
            vec![1, 2, 3],
        );
        let json = serde_json::to_string(&entry).unwrap();
        let back: QueueEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
        assert_eq!(back.priority(), 2.5);
    }
}
