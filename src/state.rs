use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{mpsc, watch};

use crate::config::Config;
use crate::schema::{
    CloseReason, Pending911, RestrictedEntry, Role, TranscriptEntry, TriageSession, WorkItem,
};
use crate::services::llm::ChatMessage;
use crate::services::{AuditLog, SharedLlm, SharedRadio};

/// Exchange pairs kept per sender for general (non-emergency) chat.
const GENERAL_HISTORY_TURNS: usize = 4;

/// All per-sender switchboard state. Lives behind one exclusive guard:
/// restrict must close the triage session and clear any pending menu in a
/// single critical section, so sharding the maps buys nothing here. The
/// guard is never held across a radio send or an LLM call.
#[derive(Default)]
pub struct DispatchState {
    pub sessions: HashMap<String, TriageSession>,
    pub restricted: HashMap<String, RestrictedEntry>,
    pub pending_911: HashMap<String, Pending911>,
    /// Responder id to the restricted-sender snapshot their next numeric
    /// reply is interpreted against.
    pub pending_cancel: HashMap<String, Vec<String>>,
    /// Responder id to the citizen most recently dispatched to them; the
    /// referent for `!spam`, `!ack` and `!responding`.
    pub last_dispatch: HashMap<String, String>,
    chat_history: HashMap<String, Vec<ChatMessage>>,
    rate_gates: HashMap<String, RateGate>,
    next_incident: u64,
}

#[derive(Default)]
struct RateGate {
    last_request: Option<DateTime<Utc>>,
    last_warning: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct ClosedSession {
    pub session: TriageSession,
    pub reason: CloseReason,
    pub duration_secs: i64,
}

#[derive(Debug)]
pub enum RestrictionCheck {
    Active(RestrictedEntry),
    Expired(RestrictedEntry),
    Absent,
}

impl DispatchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_incident(&mut self) -> u64 {
        self.next_incident += 1;
        self.next_incident
    }

    /// Register a freshly dispatched session. At most one open session per
    /// sender: if one exists it is kept and only its activity clock is
    /// refreshed, and the caller learns the registration was a no-op.
    pub fn open_session(&mut self, session: TriageSession) -> bool {
        match self.sessions.get_mut(&session.sender) {
            Some(existing) => {
                existing.last_activity = session.last_activity;
                false
            }
            None => {
                self.sessions.insert(session.sender.clone(), session);
                true
            }
        }
    }

    pub fn close_session(
        &mut self,
        sender: &str,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> Option<ClosedSession> {
        let session = self.sessions.remove(sender)?;
        let duration_secs = (now - session.started_at).num_seconds().max(0);
        Some(ClosedSession {
            session,
            reason,
            duration_secs,
        })
    }

    pub fn close_all(&mut self, reason: CloseReason, now: DateTime<Utc>) -> Vec<ClosedSession> {
        let senders: Vec<String> = self.sessions.keys().cloned().collect();
        senders
            .into_iter()
            .filter_map(|sender| self.close_session(&sender, reason, now))
            .collect()
    }

    /// Append one transcript entry, trim, refresh the activity clock.
    /// Returns false when the sender has no open session.
    pub fn append_transcript(
        &mut self,
        sender: &str,
        role: Role,
        text: &str,
        now: DateTime<Utc>,
        max_entries: usize,
    ) -> bool {
        let Some(session) = self.sessions.get_mut(sender) else {
            return false;
        };
        session.transcript.push(TranscriptEntry {
            ts: now,
            role,
            text: text.to_string(),
        });
        trim_transcript(&mut session.transcript, max_entries);
        session.last_activity = now;
        true
    }

    pub fn snapshot_session(&self, sender: &str) -> Option<TriageSession> {
        self.sessions.get(sender).cloned()
    }

    /// Lazy restriction lookup: an entry found expired is removed here and
    /// reported so the caller can audit the expiry.
    pub fn restriction_check(&mut self, sender: &str, now: DateTime<Utc>) -> RestrictionCheck {
        let Some(entry) = self.restricted.get(sender) else {
            return RestrictionCheck::Absent;
        };
        if entry.expired(now) {
            match self.restricted.remove(sender) {
                Some(entry) => RestrictionCheck::Expired(entry),
                None => RestrictionCheck::Absent,
            }
        } else {
            RestrictionCheck::Active(entry.clone())
        }
    }

    /// Cooldown gate for general chat. An accepted message stamps the gate;
    /// a message inside the window is rejected without re-stamping so a
    /// sender cannot push their own cooldown forward by spamming.
    pub fn general_allowed(
        &mut self,
        sender: &str,
        now: DateTime<Utc>,
        cooldown_secs: i64,
    ) -> bool {
        let gate = self.rate_gates.entry(sender.to_string()).or_default();
        if let Some(last) = gate.last_request
            && (now - last).num_seconds() < cooldown_secs
        {
            return false;
        }
        gate.last_request = Some(now);
        true
    }

    /// At most one cooldown warning per throttle window per sender.
    pub fn should_warn(&mut self, sender: &str, now: DateTime<Utc>, throttle_secs: i64) -> bool {
        let gate = self.rate_gates.entry(sender.to_string()).or_default();
        if let Some(last) = gate.last_warning
            && (now - last).num_seconds() < throttle_secs
        {
            return false;
        }
        gate.last_warning = Some(now);
        true
    }

    pub fn history(&self, sender: &str) -> Vec<ChatMessage> {
        self.chat_history.get(sender).cloned().unwrap_or_default()
    }

    /// Record one general exchange, keeping the most recent turns only.
    pub fn push_history(&mut self, sender: &str, user_text: &str, reply: &str) {
        let history = self.chat_history.entry(sender.to_string()).or_default();
        history.push(ChatMessage::user(user_text));
        history.push(ChatMessage::assistant(reply));
        let max_entries = GENERAL_HISTORY_TURNS * 2;
        if history.len() > max_entries {
            history.drain(..history.len() - max_entries);
        }
    }
}

/// Bound the transcript while preserving the incident anchor: the original
/// emergency statement and the first operator turn survive every trim.
pub fn trim_transcript(transcript: &mut Vec<TranscriptEntry>, max_entries: usize) {
    let keep_head = 2.min(max_entries);
    let keep_tail = max_entries.saturating_sub(keep_head);
    if transcript.len() <= max_entries {
        return;
    }
    let tail_start = transcript.len() - keep_tail;
    transcript.drain(keep_head..tail_start);
}

/// FIFO work queue between the router and the single AI worker. Unbounded
/// because triage items must never be refused; the router enforces the
/// depth gate for general items against `depth()`.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<WorkItem>,
    depth: Arc<AtomicUsize>,
}

pub struct WorkReceiver {
    rx: mpsc::UnboundedReceiver<WorkItem>,
    depth: Arc<AtomicUsize>,
}

impl WorkQueue {
    pub fn new() -> (Self, WorkReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        (
            Self {
                tx,
                depth: depth.clone(),
            },
            WorkReceiver { rx, depth },
        )
    }

    pub fn push(&self, item: WorkItem) {
        if self.tx.send(item).is_err() {
            // worker gone, only possible during shutdown
            tracing::debug!("work queue closed, dropping item");
            return;
        }
        self.depth.fetch_add(1, Ordering::SeqCst);
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

impl WorkReceiver {
    pub async fn recv(&mut self) -> Option<WorkItem> {
        let item = self.rx.recv().await;
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }
}

/// Everything a switchboard task needs, cheap to clone per task.
#[derive(Clone)]
pub struct Ctx {
    pub config: Arc<Config>,
    pub radio: SharedRadio,
    pub llm: SharedLlm,
    pub audit: AuditLog,
    pub state: Arc<tokio::sync::Mutex<DispatchState>>,
    pub queue: WorkQueue,
    pub boot_time: DateTime<Utc>,
    shutdown: watch::Receiver<bool>,
}

impl Ctx {
    pub fn new(
        config: Arc<Config>,
        radio: SharedRadio,
        llm: SharedLlm,
        audit: AuditLog,
        queue: WorkQueue,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            radio,
            llm,
            audit,
            state: Arc::new(tokio::sync::Mutex::new(DispatchState::new())),
            queue,
            boot_time: Utc::now(),
            shutdown,
        }
    }

    /// Resolves once the process begins shutting down.
    pub async fn shutdown_signal(&self) {
        let mut rx = self.shutdown.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{IncidentStatus, SosTrigger};
    use chrono::TimeDelta;

    fn session(sender: &str, now: DateTime<Utc>) -> TriageSession {
        TriageSession {
            sender: sender.to_string(),
            display_name: sender.trim_start_matches('!').to_string(),
            trigger: SosTrigger::Fire,
            context: Some("kitchen stove".to_string()),
            position: None,
            dispatched_to: vec!["!fire_node".to_string()],
            incident: 1,
            status: IncidentStatus::Dispatched,
            channel: 0,
            started_at: now,
            last_activity: now,
            transcript: Vec::new(),
        }
    }

    #[test]
    fn at_most_one_open_session_per_sender() {
        let now = Utc::now();
        let mut state = DispatchState::new();
        assert!(state.open_session(session("!n1", now)));

        let later = now + TimeDelta::seconds(30);
        let mut second = session("!n1", later);
        second.incident = 2;
        assert!(!state.open_session(second));

        let kept = state.snapshot_session("!n1").unwrap();
        assert_eq!(kept.incident, 1);
        assert_eq!(kept.last_activity, later);
    }

    #[test]
    fn close_reports_reason_and_duration() {
        let now = Utc::now();
        let mut state = DispatchState::new();
        state.open_session(session("!n1", now));

        let closed = state
            .close_session("!n1", CloseReason::Safe, now + TimeDelta::seconds(90))
            .unwrap();
        assert_eq!(closed.reason, CloseReason::Safe);
        assert_eq!(closed.duration_secs, 90);
        assert!(state.close_session("!n1", CloseReason::Safe, now).is_none());
    }

    #[test]
    fn transcript_trim_preserves_the_anchor() {
        let now = Utc::now();
        let mut state = DispatchState::new();
        state.open_session(session("!n1", now));

        for i in 0..20 {
            let role = if i % 2 == 0 {
                Role::Citizen
            } else {
                Role::Operator
            };
            assert!(state.append_transcript("!n1", role, &format!("msg {i}"), now, 12));
        }

        let snapshot = state.snapshot_session("!n1").unwrap();
        assert_eq!(snapshot.transcript.len(), 12);
        assert_eq!(snapshot.transcript[0].text, "msg 0");
        assert_eq!(snapshot.transcript[1].text, "msg 1");
        assert_eq!(snapshot.transcript[2].text, "msg 10");
        assert_eq!(snapshot.transcript[11].text, "msg 19");
    }

    #[test]
    fn append_without_session_reports_false() {
        let mut state = DispatchState::new();
        assert!(!state.append_transcript("!ghost", Role::Citizen, "hello", Utc::now(), 12));
    }

    #[test]
    fn restriction_check_removes_expired_entries() {
        let now = Utc::now();
        let mut state = DispatchState::new();
        state.restricted.insert(
            "!n4".to_string(),
            RestrictedEntry {
                display_name: "n4".to_string(),
                expires_at: now + TimeDelta::minutes(120),
                restricted_by: "!police_node".to_string(),
            },
        );

        assert!(matches!(
            state.restriction_check("!n4", now),
            RestrictionCheck::Active(_)
        ));

        let after = now + TimeDelta::minutes(121);
        assert!(matches!(
            state.restriction_check("!n4", after),
            RestrictionCheck::Expired(_)
        ));
        // removed by the expired check
        assert!(matches!(
            state.restriction_check("!n4", after),
            RestrictionCheck::Absent
        ));
    }

    #[test]
    fn cooldown_rejects_without_moving_the_window() {
        let now = Utc::now();
        let mut state = DispatchState::new();
        assert!(state.general_allowed("!n1", now, 10));
        assert!(!state.general_allowed("!n1", now + TimeDelta::seconds(5), 10));
        // the rejected attempt did not reset the clock
        assert!(state.general_allowed("!n1", now + TimeDelta::seconds(10), 10));
    }

    #[test]
    fn warnings_are_throttled_per_sender() {
        let now = Utc::now();
        let mut state = DispatchState::new();
        assert!(state.should_warn("!n1", now, 10));
        assert!(!state.should_warn("!n1", now + TimeDelta::seconds(3), 10));
        assert!(state.should_warn("!n2", now + TimeDelta::seconds(3), 10));
        assert!(state.should_warn("!n1", now + TimeDelta::seconds(10), 10));
    }

    #[test]
    fn general_history_keeps_four_turns() {
        let mut state = DispatchState::new();
        for i in 0..6 {
            state.push_history("!n1", &format!("q{i}"), &format!("a{i}"));
        }
        let history = state.history("!n1");
        assert_eq!(history.len(), 8);
        assert_eq!(history[0].content, "q2");
        assert_eq!(history[7].content, "a5");
    }

    #[tokio::test]
    async fn queue_depth_tracks_push_and_recv() {
        let (queue, mut rx) = WorkQueue::new();
        assert_eq!(queue.depth(), 0);
        for i in 0..3 {
            queue.push(WorkItem {
                sender: "!n1".to_string(),
                text: format!("msg {i}"),
                channel: 0,
                triage: false,
                trace: uuid::Uuid::new_v4(),
            });
        }
        assert_eq!(queue.depth(), 3);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.text, "msg 0");
        assert_eq!(queue.depth(), 2);
    }
}
