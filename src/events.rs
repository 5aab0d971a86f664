use crate::sessions::Session;
use serde::{Deserialize, Serialize};

/// Messages exchanged on a session topic between the background worker and
/// the request that streams its output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The session as persisted after an interaction was finalized.
    SessionSnapshot { session: Box<Session> },
    WorkerFragment {
        session_id: String,
        interaction_id: String,
        message: String,
    },
    WorkerDone {
        session_id: String,
        interaction_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionSnapshot { .. } => "session_snapshot",
            Self::WorkerFragment { .. } => "worker_fragment",
            Self::WorkerDone { .. } => "worker_done",
        }
    }
}
