//! Turns job-lifecycle notifications into usage events.
//!
//! The broker adapter acknowledges deliveries on receipt and hands the
//! decoded payload to [`Recorder::handle_update`]; downstream deduplication
//! rides on the job's `usage_last_update`, so at-least-once delivery is
//! safe here.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::EndDateRetry;
use crate::error::{Result, UsageError};
use crate::event::{EventId, EventKind, UsageEvent};
use crate::jobs::JobCatalog;
use crate::queue::EventQueue;

/// Job lifecycle states carried by the inbound topic.
///
/// Only the terminal states trigger a usage calculation; everything else
/// is ignored. Unrecognised states decode as `Other` rather than failing
/// the message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobState {
    Submitted,
    Queued,
    Running,
    Succeeded,
    Failed,
    Other,
}

impl JobState {
    /// Whether this state ends a job's execution.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    fn as_str(&self) -> &'static str {
        match self {
            JobState::Submitted => "Submitted",
            JobState::Queued => "Queued",
            JobState::Running => "Running",
            JobState::Succeeded => "Succeeded",
            JobState::Failed => "Failed",
            JobState::Other => "Other",
        }
    }
}

impl From<String> for JobState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Submitted" => JobState::Submitted,
            "Queued" => JobState::Queued,
            "Running" => JobState::Running,
            "Succeeded" => JobState::Succeeded,
            "Failed" => JobState::Failed,
            _ => JobState::Other,
        }
    }
}

impl From<JobState> for String {
    fn from(state: JobState) -> Self {
        state.as_str().to_string()
    }
}

/// The job reference inside an inbound update.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRef {
    pub uuid: String,
    #[serde(default)]
    pub condor_id: String,
}

/// An inbound job-lifecycle update.
///
/// Only the external id and the state matter; the rest of the envelope is
/// carried for logging.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobUpdate {
    #[serde(rename = "Job")]
    pub job: JobRef,
    #[serde(rename = "State")]
    pub state: JobState,
    #[serde(rename = "Message", default)]
    pub message: String,
    #[serde(rename = "SentOn", default)]
    pub sent_on: String,
    #[serde(rename = "Sender", default)]
    pub sender: String,
}

impl JobUpdate {
    /// Reject payloads missing the required fields.
    pub fn validate(&self) -> Result<()> {
        if self.job.uuid.is_empty() {
            return Err(UsageError::Malformed("external id was unset".into()));
        }
        Ok(())
    }
}

/// Computes CPU hours for finished jobs and enqueues the resulting events.
pub struct Recorder<S> {
    store: Arc<S>,
    retry: EndDateRetry,
}

impl<S> Recorder<S>
where
    S: JobCatalog + EventQueue,
{
    pub fn new(store: Arc<S>, retry: EndDateRetry) -> Self {
        Self { store, retry }
    }

    /// Handle one inbound update.
    ///
    /// Non-terminal states are ignored (`Ok(None)`); malformed payloads and
    /// unknown external ids surface as errors for the broker adapter to
    /// log. Returns the id of the enqueued event, or `None` when nothing
    /// was enqueued.
    pub async fn handle_update(&self, update: &JobUpdate) -> Result<Option<EventId>> {
        update.validate()?;

        if !update.state.is_terminal() {
            debug!(
                external_id = %update.job.uuid,
                state = ?update.state,
                "ignoring non-terminal state"
            );
            return Ok(None);
        }

        self.calculate_for_job(&update.job.uuid).await
    }

    /// Compute usage for the job behind `external_id` and enqueue an Add
    /// event for it.
    ///
    /// A job that reserved no millicores consumed nothing; its calculation
    /// still advances `usage_last_update` but no event is enqueued.
    pub async fn calculate_for_job(&self, external_id: &str) -> Result<Option<EventId>> {
        let job_id = self.store.job_id_by_external_id(external_id).await?;
        debug!(external_id, job = %job_id, "resolved job for usage calculation");

        let calc = self.store.compute_usage(job_id, self.retry).await?;
        info!(
            job = %calc.job,
            user = %calc.user,
            cpu_hours = %calc.cpu_hours,
            basis = %calc.basis,
            calc = %calc.calc,
            "calculated cpu hours"
        );

        if calc.millicores == 0 {
            debug!(job = %calc.job, "no millicores reserved, skipping event");
            return Ok(None);
        }

        let event = UsageEvent::now(EventKind::Add, calc.cpu_hours, calc.user);
        let event_id = self.store.record_event(&event).await?;
        Ok(Some(event_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Other.is_terminal());
    }

    #[test]
    fn update_decodes_wire_format() {
        let raw = r#"{
            "Job": {"uuid": "a1b2", "condor_id": "42"},
            "State": "Succeeded",
            "Message": "done",
            "SentOn": "1700000000",
            "Sender": "condor"
        }"#;
        let update: JobUpdate = serde_json::from_str(raw).unwrap();
        assert_eq!(update.job.uuid, "a1b2");
        assert_eq!(update.state, JobState::Succeeded);
        update.validate().unwrap();
    }

    #[test]
    fn unknown_state_decodes_as_other() {
        let raw = r#"{"Job": {"uuid": "a1b2"}, "State": "Impending"}"#;
        let update: JobUpdate = serde_json::from_str(raw).unwrap();
        assert_eq!(update.state, JobState::Other);
    }

    #[test]
    fn empty_external_id_is_malformed() {
        let raw = r#"{"Job": {"uuid": ""}, "State": "Failed"}"#;
        let update: JobUpdate = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            update.validate(),
            Err(UsageError::Malformed(_))
        ));
    }
}
