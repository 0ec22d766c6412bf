//! Polling of asynchronous remote tasks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::{ControlPlaneError, Result};
use crate::session::Session;
use crate::types::{ManagedObjectRef, Task, TaskCompletion};
use crate::wire::{self, TaskInfo, TaskState};

/// Waits for tasks to reach a terminal state.
///
/// A timeout only stops the waiting; the remote task keeps running and its
/// outcome is unknown to the caller.
pub struct TaskWaiter {
    session: Arc<Session>,
    poll_interval: Duration,
    timeout: Duration,
}

impl TaskWaiter {
    pub fn new(session: Arc<Session>, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            session,
            poll_interval,
            timeout,
        }
    }

    /// Interpret the reply of a `*_Task` method as a task handle.
    pub fn task_from_reply(reply: &Value, kind: &str) -> Result<Task> {
        let task_ref: ManagedObjectRef = wire::decode(kind, reply)?;
        Ok(Task::submitted(task_ref, kind))
    }

    /// Wait with the configured poll interval and timeout.
    pub async fn wait(&self, task: &Task) -> Result<TaskCompletion> {
        self.wait_with(task, self.poll_interval, self.timeout).await
    }

    /// Poll `task` every `poll_interval` until it succeeds, fails, or
    /// `timeout` has elapsed.
    #[instrument(skip(self, task), fields(task = %task.task_ref, kind = %task.kind))]
    pub async fn wait_with(&self, task: &Task, poll_interval: Duration, timeout: Duration) -> Result<TaskCompletion> {
        let start = Instant::now();

        loop {
            let props = self.session.properties(&task.task_ref, &["info"]).await?;
            let info: TaskInfo = wire::required(&props, "info")?;

            match info.state {
                TaskState::Success if info.progress.unwrap_or(100) >= 100 => {
                    info!(elapsed_ms = start.elapsed().as_millis() as u64, "Task completed");
                    return Ok(TaskCompletion {
                        task: task.clone(),
                        result: info.result,
                        completed_at: Utc::now(),
                    });
                }
                TaskState::Error => {
                    let error = info.error.unwrap_or(Value::Null);
                    warn!(error = %error, "Task failed");
                    return Err(ControlPlaneError::TaskFailed {
                        task: task.task_ref.to_string(),
                        error,
                    });
                }
                state => debug!(?state, progress = ?info.progress, "Task in progress"),
            }

            let waited = start.elapsed();
            if waited >= timeout {
                warn!(waited_ms = waited.as_millis() as u64, "Timed out waiting for task");
                return Err(ControlPlaneError::Timeout {
                    task: task.task_ref.to_string(),
                    waited,
                });
            }

            tokio::time::sleep(poll_interval.min(timeout - waited)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockControlPlane;
    use crate::transport::{Credentials, Endpoint};
    use crate::types::kinds;
    use serde_json::json;

    fn waiter(mock: &Arc<MockControlPlane>) -> (Arc<Session>, TaskWaiter) {
        let session = Arc::new(Session::new(
            Endpoint::parse("https://10.0.0.2/sdk").unwrap(),
            Credentials::new("admin", "secret"),
            mock.clone(),
            100,
        ));
        let waiter = TaskWaiter::new(session.clone(), Duration::from_millis(5), Duration::from_secs(5));
        (session, waiter)
    }

    async fn submit(session: &Session, vm: &ManagedObjectRef, method: &str) -> Task {
        let reply = session.invoke(vm, method, json!({})).await.unwrap();
        TaskWaiter::task_from_reply(&reply, method).unwrap()
    }

    #[tokio::test]
    async fn test_waits_through_running_polls() {
        let mock = Arc::new(MockControlPlane::demo());
        mock.task_polls(3);
        let (session, waiter) = waiter(&mock);
        let vm = mock.find(kinds::VIRTUAL_MACHINE, "db-01").unwrap();

        let task = submit(&session, &vm, "PowerOnVM_Task").await;
        let completion = waiter.wait(&task).await.unwrap();

        assert_eq!(completion.task.kind, "PowerOnVM_Task");
        assert!(completion.completed_at >= task.submitted_at);
        assert_eq!(mock.calls_of("properties").len(), 3);
    }

    #[tokio::test]
    async fn test_failed_task_carries_remote_error() {
        let mock = Arc::new(MockControlPlane::demo());
        mock.fail_tasks("PowerOnVM_Task", json!({"fault": "InsufficientResourcesFault"}));
        let (session, waiter) = waiter(&mock);
        let vm = mock.find(kinds::VIRTUAL_MACHINE, "db-01").unwrap();

        let task = submit(&session, &vm, "PowerOnVM_Task").await;
        match waiter.wait(&task).await.unwrap_err() {
            ControlPlaneError::TaskFailed { error, .. } => {
                assert_eq!(error["fault"], "InsufficientResourcesFault");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stalled_task_times_out() {
        let mock = Arc::new(MockControlPlane::demo());
        mock.stall_tasks(true);
        let (session, waiter) = waiter(&mock);
        let vm = mock.find(kinds::VIRTUAL_MACHINE, "db-01").unwrap();

        let task = submit(&session, &vm, "PowerOnVM_Task").await;
        let err = waiter
            .wait_with(&task, Duration::from_millis(10), Duration::from_millis(50))
            .await
            .unwrap_err();

        match err {
            ControlPlaneError::Timeout { waited, .. } => assert!(waited >= Duration::from_millis(50)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_task_from_malformed_reply() {
        assert!(matches!(
            TaskWaiter::task_from_reply(&json!("task-1"), "Destroy_Task"),
            Err(ControlPlaneError::MalformedReply(_))
        ));
    }
}
