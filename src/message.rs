//! The unit of work routed through a procedure.

use chrono::{DateTime, SubsecRound, Utc};
use courier_plugin::Payload;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::ksuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
    EnumString, AsRefStr, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Status {
    WaitingForProcessing,
    InProcess,
    Finished,
    FinishedWithError,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Finished | Status::FinishedWithError)
    }
}

/// Timestamps are kept at the precision the store persists.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Message {
    pub id: Option<i64>,
    pub correlation_id: String,
    pub status: Status,
    pub procedure: String,
    pub previous_step: Option<String>,
    pub next_step: Option<String>,
    pub payload: Payload,
    pub error: Option<String>,
    pub reception_time: DateTime<Utc>,
    pub last_changed_time: DateTime<Utc>,
}

impl Message {
    /// A fresh, unsaved message waiting for processing.
    pub fn new(procedure: impl Into<String>, payload: Payload) -> Self {
        let received = now();
        Self {
            id: None,
            correlation_id: ksuid::correlation_id(),
            status: Status::WaitingForProcessing,
            procedure: procedure.into(),
            previous_step: None,
            next_step: None,
            payload,
            error: None,
            reception_time: received,
            last_changed_time: received,
        }
    }

    /// Refreshes `last_changed_time`. Never moves it backwards, even if the
    /// wall clock does.
    pub fn touch(&mut self) {
        self.last_changed_time = self.last_changed_time.max(now());
    }

    pub fn claim(&mut self) {
        self.status = Status::InProcess;
        self.touch();
    }

    pub fn finish(&mut self) {
        self.status = Status::Finished;
        self.next_step = None;
        self.error = None;
        self.touch();
    }

    /// Keeps the payload as it is; `error` is the rendered failure.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = Status::FinishedWithError;
        self.next_step = None;
        self.error = Some(error.into());
        self.touch();
    }

    pub fn requeue(&mut self) {
        self.status = Status::WaitingForProcessing;
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::str::FromStr;

    #[test]
    fn status_is_snake_case_everywhere() {
        assert_eq!(Status::FinishedWithError.to_string(), "finished_with_error");
        assert_eq!(Status::from_str("in_process").unwrap(), Status::InProcess);
        assert_eq!(
            serde_json::to_value(Status::WaitingForProcessing).unwrap(),
            serde_json::json!("waiting_for_processing")
        );
        assert!(Status::from_str("done").is_err());
    }

    #[test]
    fn new_message_is_waiting_with_fresh_id() {
        let a = Message::new("p", Payload::new());
        let b = Message::new("p", Payload::new());
        assert_eq!(a.status, Status::WaitingForProcessing);
        assert_eq!(a.correlation_id.len(), ksuid::ENCODED_LEN);
        assert_ne!(a.correlation_id, b.correlation_id);
        assert_eq!(a.reception_time, a.last_changed_time);
        assert_eq!(a.id, None);
    }

    #[test]
    fn touch_never_goes_backwards() {
        let mut m = Message::new("p", Payload::new());
        let future = now() + Duration::hours(1);
        m.last_changed_time = future;
        m.touch();
        assert_eq!(m.last_changed_time, future);

        let mut m = Message::new("p", Payload::new());
        let before = m.last_changed_time;
        std::thread::sleep(std::time::Duration::from_millis(2));
        m.claim();
        assert!(m.last_changed_time > before);
    }

    #[test]
    fn terminal_transitions_clear_the_pending_step() {
        let mut m = Message::new("p", Payload::new());
        m.claim();
        m.next_step = Some("step-2".into());
        m.fail("boom");
        assert_eq!(m.status, Status::FinishedWithError);
        assert!(m.status.is_terminal());
        assert_eq!(m.next_step, None);
        assert_eq!(m.error.as_deref(), Some("boom"));

        m.next_step = Some("x".into());
        m.finish();
        assert_eq!(m.next_step, None);
        assert_eq!(m.error, None);
    }
}
