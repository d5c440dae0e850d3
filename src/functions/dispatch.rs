use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::schema::{IncidentStatus, Position, SosTrigger, TriageSession, WorkItem, render_gps};
use crate::services::radio::{broadcast, display_name, send_dm};
use crate::state::Ctx;

/// Deterministic triage opener used when a trigger arrives with no context.
pub const TRIAGE_OPENER: &str = "What is your emergency?";

/// Appended to every operator transmission in an open triage.
pub const SAFE_FOOTER: &str = "[Send !safe when emergency is resolved]";

const CONTEXT_MAX_CHARS: usize = 80;

/// One accepted SOS, ready to claim an incident.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub sender: String,
    pub trigger: SosTrigger,
    pub context: String,
    pub channel: u32,
    /// Position captured earlier (the 911 menu flow); None resolves from the
    /// node directory at claim time.
    pub position: Option<Position>,
    pub trace: Uuid,
}

/// A claimed incident: the session is already registered, only the paced
/// send sequence remains.
pub struct PreparedDispatch {
    request: DispatchRequest,
    gps: String,
    sender_name: String,
    recipients: Vec<String>,
}

/// Claim the incident synchronously, then run the paced send sequence on its
/// own task so the router's receive path never sleeps. Returns false when
/// the sender already has an open session and nothing was dispatched.
pub async fn dispatch_sos(ctx: &Ctx, request: DispatchRequest) -> bool {
    let Some(prepared) = prepare_dispatch(ctx, request).await else {
        return false;
    };
    let ctx = ctx.clone();
    tokio::spawn(async move {
        run_dispatch_sends(&ctx, prepared).await;
    });
    true
}

/// Resolve routing and register the session in one critical section. The
/// session exists before this returns, so a burst of triggers during the
/// multi-second send window cannot open a second incident. The incident
/// number is allocated, and `sos_dispatch` recorded, only when the session
/// actually opens.
pub async fn prepare_dispatch(ctx: &Ctx, request: DispatchRequest) -> Option<PreparedDispatch> {
    let radio = ctx.radio.as_ref();
    let position = request
        .position
        .or_else(|| radio.node_info(&request.sender).and_then(|n| n.position));
    let gps = render_gps(position.as_ref());
    let sender_name = display_name(radio, &request.sender);

    // a trigger mapped to a single responder goes only there; otherwise every
    // configured responder in turn; with none configured, the channel hears it
    let recipients: Vec<String> = match ctx.config.responder_for(request.trigger) {
        Some(id) => vec![id],
        None => ctx.config.responder_ids(),
    };

    let now = Utc::now();
    let incident = {
        let mut state = ctx.state.lock().await;
        if state.sessions.contains_key(&request.sender) {
            None
        } else {
            let incident = state.next_incident();
            state.open_session(TriageSession {
                sender: request.sender.clone(),
                display_name: sender_name.clone(),
                trigger: request.trigger,
                context: (!request.context.is_empty()).then(|| request.context.clone()),
                position,
                dispatched_to: recipients.clone(),
                incident,
                status: IncidentStatus::Dispatched,
                channel: request.channel,
                started_at: now,
                last_activity: now,
                transcript: Vec::new(),
            });
            for responder in &recipients {
                state
                    .last_dispatch
                    .insert(responder.clone(), request.sender.clone());
            }
            Some(incident)
        }
    };

    let Some(incident) = incident else {
        tracing::info!(sender = %request.sender, "dispatch: session already open, routing as triage");
        return None;
    };

    tracing::info!(
        incident,
        sender = %request.sender,
        trigger = request.trigger.token(),
        gps = %gps,
        "dispatch: SOS accepted"
    );

    ctx.audit
        .record(
            "sos_dispatch",
            serde_json::json!({
                "trace": request.trace,
                "incident": incident,
                "trigger": request.trigger.label(),
                "category": request.trigger.category(),
                "sender": request.sender,
                "name": sender_name,
                "gps": gps,
                "context": request.context,
                "recipients": recipients,
            }),
        )
        .await;
    ctx.audit
        .record(
            "session_open",
            serde_json::json!({
                "trace": request.trace,
                "incident": incident,
                "sender": request.sender,
            }),
        )
        .await;

    Some(PreparedDispatch {
        request,
        gps,
        sender_name,
        recipients,
    })
}

/// The ordered send sequence for a claimed incident: citizen ACK, safety
/// note, responder dispatch, initial triage seed, with inter-send spacing
/// for the link's duty cycle. Transmission failures are logged by the send
/// helper and never abort later steps.
pub async fn run_dispatch_sends(ctx: &Ctx, prepared: PreparedDispatch) {
    let PreparedDispatch {
        request,
        gps,
        sender_name,
        recipients,
    } = prepared;
    let spacing = Duration::from_secs(ctx.config.switchboard.send_spacing_secs);
    let radio = ctx.radio.as_ref();

    send_dm(
        radio,
        &format!("[SOS] {} RECEIVED. GPS: {}", request.trigger.label(), gps),
        &request.sender,
        request.channel,
    )
    .await;
    tokio::time::sleep(spacing).await;

    send_dm(
        radio,
        "[SOS] Responders are being notified. Send !safe when the emergency is resolved.",
        &request.sender,
        request.channel,
    )
    .await;
    tokio::time::sleep(spacing).await;

    let line = dispatch_line(
        request.trigger.label(),
        &sender_name,
        &gps,
        Utc::now(),
        &request.context,
    );

    if recipients.is_empty() {
        broadcast(radio, &line, request.channel).await;
    } else {
        for (index, responder) in recipients.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(spacing).await;
            }
            send_dm(radio, &line, responder, request.channel).await;
        }
    }

    if !request.context.is_empty() {
        // the context seeds the triage so the model opens with a follow-up
        ctx.queue.push(WorkItem {
            sender: request.sender.clone(),
            text: request.context.clone(),
            channel: request.channel,
            triage: true,
            trace: request.trace,
        });
    } else {
        // no context to react to; open the triage deterministically
        let max = ctx.config.switchboard.triage_max_transcript;
        ctx.state.lock().await.append_transcript(
            &request.sender,
            crate::schema::Role::Operator,
            TRIAGE_OPENER,
            Utc::now(),
            max,
        );
        tokio::time::sleep(spacing).await;
        send_dm(
            radio,
            &format!("{TRIAGE_OPENER} {SAFE_FOOTER}"),
            &request.sender,
            request.channel,
        )
        .await;
    }
}

/// `[DISPATCH] <TRIGGER> | From: <name> | GPS: <pos> | Time: HH:MM:SS` with
/// the free-text context capped at 80 characters when present.
pub fn dispatch_line(
    trigger_label: &str,
    name: &str,
    gps: &str,
    now: DateTime<Utc>,
    context: &str,
) -> String {
    let mut line = format!(
        "[DISPATCH] {} | From: {} | GPS: {} | Time: {}",
        trigger_label,
        name,
        gps,
        now.format("%H:%M:%S"),
    );
    if !context.is_empty() {
        let capped: String = context.chars().take(CONTEXT_MAX_CHARS).collect();
        line.push_str(" | ");
        line.push_str(&capped);
    }
    line
}
