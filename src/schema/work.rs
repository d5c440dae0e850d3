use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One unit of language-model work queued by the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub sender: String,
    pub text: String,
    pub channel: u32,
    /// True when the sender has an open triage session and the text belongs
    /// to that transcript rather than general chat.
    pub triage: bool,
    pub trace: Uuid,
}
