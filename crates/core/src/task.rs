//! Tasks: the tracked handle of one asynchronous operation dispatched to a connector.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{DomainError, DomainResult};
use crate::id::{ConnectorId, TaskId};

/// Kind of work a task tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    InstallConnector,
    UninstallConnector,
    ResetConnector,
    CreateTransfer,
    CreatePayout,
    ReverseTransfer,
    ReversePayout,
    CreateBankAccount,
    ForwardUser,
    DeleteUser,
    DeleteUserConnector,
    DeleteUserConnection,
}

impl TaskKind {
    fn prefix(self) -> &'static str {
        match self {
            TaskKind::InstallConnector => "install",
            TaskKind::UninstallConnector => "uninstall",
            TaskKind::ResetConnector => "reset",
            TaskKind::CreateTransfer => "create-transfer",
            TaskKind::CreatePayout => "create-payout",
            TaskKind::ReverseTransfer => "reverse-transfer",
            TaskKind::ReversePayout => "reverse-payout",
            TaskKind::CreateBankAccount => "create-bank-account",
            TaskKind::ForwardUser => "forward-user",
            TaskKind::DeleteUser => "delete-user",
            TaskKind::DeleteUserConnector => "delete-user-connector",
            TaskKind::DeleteUserConnection => "delete-user-connection",
        }
    }

    /// Deterministic task reference: `{kind}-{stack}-{parts...}`.
    ///
    /// The same logical operation always yields the same reference, which is
    /// what makes task creation safe to retry.
    pub fn reference(self, stack: &str, parts: &[&str]) -> String {
        let mut reference = format!("{}-{}", self.prefix(), stack);
        for part in parts {
            reference.push('-');
            reference.push_str(part);
        }
        reference
    }
}

/// Task completion state. `Pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }
}

/// Terminal result recorded on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TaskOutcome {
    /// The work finished; `created_object_id` names what it produced, if anything.
    Succeeded { created_object_id: Option<String> },
    /// The work failed; the provider's error is kept verbatim.
    Failed { error: String },
}

impl TaskOutcome {
    pub fn succeeded(created_object_id: Option<String>) -> Self {
        Self::Succeeded { created_object_id }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub connector_id: Option<ConnectorId>,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_object_id: Option<String>,
    pub error: Option<String>,
}

impl Task {
    /// Create a pending task.
    pub fn new(id: TaskId, kind: TaskKind) -> Self {
        let now = Utc::now();
        Self {
            connector_id: id.connector_id.clone(),
            id,
            kind,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            created_object_id: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move the task to its terminal state.
    ///
    /// A task is completed exactly once; completing a terminal task is a
    /// conflict and leaves it untouched.
    pub fn complete(&mut self, outcome: TaskOutcome) -> DomainResult<()> {
        if self.is_terminal() {
            return Err(DomainError::conflict(format!(
                "task {} is already {:?}",
                self.id.reference, self.status
            )));
        }

        match outcome {
            TaskOutcome::Succeeded { created_object_id } => {
                self.status = TaskStatus::Succeeded;
                self.created_object_id = created_object_id;
            }
            TaskOutcome::Failed { error } => {
                self.status = TaskStatus::Failed;
                self.error = Some(error);
            }
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

impl Entity for Task {
    type Id = TaskId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_task() -> Task {
        let connector = ConnectorId::new("psp-1");
        let reference = TaskKind::CreateTransfer.reference("local", &["0", "pi"]);
        Task::new(TaskId::new(reference, Some(connector)), TaskKind::CreateTransfer)
    }

    #[test]
    fn reference_is_deterministic() {
        assert_eq!(
            TaskKind::CreateTransfer.reference("local", &["1", "abc"]),
            "create-transfer-local-1-abc"
        );
        assert_eq!(TaskKind::DeleteUser.reference("prod", &["u"]), "delete-user-prod-u");
    }

    #[test]
    fn task_lifecycle() {
        let mut task = test_task();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.connector_id.is_some());

        task.complete(TaskOutcome::succeeded(Some("obj".into()))).unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.created_object_id.as_deref(), Some("obj"));
    }

    #[test]
    fn terminal_state_is_written_once() {
        let mut task = test_task();
        task.complete(TaskOutcome::failed("provider down")).unwrap();

        let err = task.complete(TaskOutcome::succeeded(None)).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("provider down"));
    }
}
