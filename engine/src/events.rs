use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::job::{JobId, JobState, TenantId};
use crate::serde_util::serialize_iso;

/// One state transition of one job. `from` is `None` for admission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleEvent {
    pub job_id: JobId,
    pub tenant: TenantId,
    pub from: Option<JobState>,
    pub to: JobState,
    #[serde(serialize_with = "serialize_iso")]
    pub at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(job_id: JobId, tenant: TenantId, from: Option<JobState>, to: JobState) -> Self {
        Self {
            job_id,
            tenant,
            from,
            to,
            at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.to.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Outcome;

    #[test]
    fn serializes_states_and_timestamp() {
        let event = LifecycleEvent::new(
            JobId::new(),
            TenantId::new("acme"),
            Some(JobState::Running),
            JobState::Terminal(Outcome::TimedOut),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["tenant"], "acme");
        assert_eq!(value["from"], "running");
        assert_eq!(value["to"], "timed_out");
        let at = value["at"].as_str().unwrap();
        assert!(at.ends_with('Z'));
        assert_eq!(at.len(), 24);
        assert!(event.is_terminal());
    }

    #[test]
    fn admission_event_has_no_source_state() {
        let event = LifecycleEvent::new(JobId::new(), TenantId::new("a"), None, JobState::Queued);
        let value = serde_json::to_value(&event).unwrap();
        assert!(value["from"].is_null());
        assert!(!event.is_terminal());
    }
}
