use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::functions::dispatch::{DispatchRequest, dispatch_sos};
use crate::schema::{
    CloseReason, IncidentStatus, Pending911, RestrictedEntry, SosTrigger, TextPacket, WorkItem,
    render_gps,
};
use crate::services::radio::{display_name, send_dm};
use crate::state::{ClosedSession, Ctx, RestrictionCheck};

/// Verbatim menu sent in response to `!911`. Transmitted as one frame; the
/// first line is the acknowledgment.
pub const MENU_911: &str = "[SOS] Emergency received.\n\
Reply with a NUMBER:\n\
1 = Fire\n\
2 = Medical\n\
3 = Police\n\
4 = Other\n\
5 = Accident (sent by mistake)";

const RESTRICT_NOTICE: &str = "[SYSTEM] Access restricted by emergency services.";
const BUSY_NOTICE: &str = "[SYSTEM] Operator is busy. Try again in a minute.";
const RELIST_NOTICE: &str =
    "[SYSTEM] Invalid selection. Send !cancel to list restricted senders.";

/// Sole inbound entry point. Consumes the driver's packet channel until
/// shutdown; every packet is classified and handled without blocking beyond
/// short sends.
pub async fn run_router(ctx: Ctx, mut inbound: mpsc::UnboundedReceiver<TextPacket>) {
    loop {
        tokio::select! {
            _ = ctx.shutdown_signal() => break,
            packet = inbound.recv() => {
                let Some(packet) = packet else { break };
                handle_packet(&ctx, packet).await;
            }
        }
    }
    tracing::info!("router stopped");
}

pub async fn handle_packet(ctx: &Ctx, packet: TextPacket) {
    let now = Utc::now();
    let text = packet.text.trim().to_string();
    let sender = packet.from.clone();

    // malformed or foreign traffic is dropped before anything observes it
    if text.is_empty() || sender.is_empty() {
        return;
    }
    if sender == ctx.radio.local_id() {
        return;
    }
    if packet.channel != ctx.config.radio.channel_index {
        return;
    }

    // the radio replays buffered packets at connect; anything from before
    // boot must not re-trigger SOS
    let stale_cutoff =
        ctx.boot_time - TimeDelta::seconds(ctx.config.switchboard.stale_window_secs);
    if packet.rx_time < stale_cutoff {
        tracing::debug!(sender = %sender, rx_time = %packet.rx_time, "dropping stale packet");
        return;
    }

    let trace = Uuid::new_v4();
    ctx.audit
        .record(
            "rx",
            serde_json::json!({
                "trace": trace,
                "from": sender,
                "channel": packet.channel,
                "text": text,
            }),
        )
        .await;

    if ctx.config.is_responder(&sender)
        && handle_responder_command(ctx, &sender, &text, packet.channel, trace, now).await
    {
        return;
    }

    match ctx.state.lock().await.restriction_check(&sender, now) {
        RestrictionCheck::Active(entry) => {
            let notice = format!(
                "{RESTRICT_NOTICE} ~{} min remaining.",
                entry.minutes_left(now)
            );
            send_dm(ctx.radio.as_ref(), &notice, &sender, packet.channel).await;
            ctx.audit
                .record(
                    "bouncer_drop",
                    serde_json::json!({ "trace": trace, "sender": sender, "reason": "restricted" }),
                )
                .await;
            return;
        }
        RestrictionCheck::Expired(entry) => {
            ctx.audit
                .record(
                    "restriction_expired",
                    serde_json::json!({
                        "trace": trace,
                        "sender": sender,
                        "name": entry.display_name,
                    }),
                )
                .await;
        }
        RestrictionCheck::Absent => {}
    }

    let lower = text.to_ascii_lowercase();
    match lower.as_str() {
        "!ping" => {
            send_dm(
                ctx.radio.as_ref(),
                "[SYSTEM] Pong. Operator online.",
                &sender,
                packet.channel,
            )
            .await;
            audit_command(ctx, trace, &sender, "ping").await;
            return;
        }
        "!status" => {
            let status = {
                let state = ctx.state.lock().await;
                format!(
                    "[SYSTEM] Queue: {} | Nodes: {} | Responders: {} | Active SOS: {} | Restricted: {}",
                    ctx.queue.depth(),
                    ctx.radio.node_count(),
                    ctx.config.responder_ids().len(),
                    state.sessions.len(),
                    state.restricted.len(),
                )
            };
            send_dm(ctx.radio.as_ref(), &status, &sender, packet.channel).await;
            audit_command(ctx, trace, &sender, "status").await;
            return;
        }
        "!safe" => {
            handle_safe(ctx, &sender, packet.channel, trace, now).await;
            return;
        }
        "!911" => {
            handle_911(ctx, &sender, packet.channel, trace, now).await;
            return;
        }
        _ => {}
    }

    if let Some(digit) = parse_menu_digit(&text)
        && handle_menu_selection(ctx, &sender, digit, trace).await
    {
        return;
    }

    if let Some((trigger, context)) = SosTrigger::match_message(&text) {
        // SOS is never subject to the cooldown or the queue-depth gate. The
        // claim happens under the guard before this returns, so a burst of
        // triggers during the paced send window cannot open a second incident.
        let accepted = dispatch_sos(
            ctx,
            DispatchRequest {
                sender: sender.clone(),
                trigger,
                context,
                channel: packet.channel,
                position: None,
                trace,
            },
        )
        .await;
        if accepted {
            return;
        }
        // an open session swallows a re-trigger as triage context
    }

    let has_session = ctx.state.lock().await.sessions.contains_key(&sender);
    if has_session {
        ctx.queue.push(WorkItem {
            sender,
            text,
            channel: packet.channel,
            triage: true,
            trace,
        });
        return;
    }

    // general chat only past this point: cooldown first, then capacity
    let switchboard = &ctx.config.switchboard;
    let (allowed, warn) = {
        let mut state = ctx.state.lock().await;
        let allowed = state.general_allowed(&sender, now, switchboard.cooldown_secs);
        let warn =
            !allowed && state.should_warn(&sender, now, switchboard.warn_throttle_secs);
        (allowed, warn)
    };
    if !allowed {
        if warn {
            let notice = format!(
                "[SYSTEM] Slow down. One message every {}s please.",
                switchboard.cooldown_secs
            );
            send_dm(ctx.radio.as_ref(), &notice, &sender, packet.channel).await;
        }
        ctx.audit
            .record(
                "bouncer_drop",
                serde_json::json!({ "trace": trace, "sender": sender, "reason": "cooldown" }),
            )
            .await;
        return;
    }

    if ctx.queue.depth() > switchboard.queue_limit {
        send_dm(ctx.radio.as_ref(), BUSY_NOTICE, &sender, packet.channel).await;
        ctx.audit
            .record(
                "bouncer_drop",
                serde_json::json!({ "trace": trace, "sender": sender, "reason": "queue_full" }),
            )
            .await;
        return;
    }

    ctx.queue.push(WorkItem {
        sender,
        text,
        channel: packet.channel,
        triage: false,
        trace,
    });
}

/// `!spam`, `!cancel`, `!ack`, `!responding`, and numeric replies against a
/// pending cancel list. Returns false when the message is not a responder
/// command and normal routing should continue.
async fn handle_responder_command(
    ctx: &Ctx,
    responder: &str,
    text: &str,
    channel: u32,
    trace: Uuid,
    now: DateTime<Utc>,
) -> bool {
    match text.to_ascii_lowercase().as_str() {
        "!spam" => {
            handle_restrict(ctx, responder, channel, trace, now).await;
            true
        }
        "!cancel" => {
            handle_cancel_list(ctx, responder, channel, trace, now).await;
            true
        }
        "!ack" => {
            handle_status_mark(ctx, responder, channel, trace, IncidentStatus::Acknowledged).await;
            true
        }
        "!responding" => {
            handle_status_mark(ctx, responder, channel, trace, IncidentStatus::Responding).await;
            true
        }
        _ => match parse_cancel_index(text) {
            Some(index) => handle_cancel_selection(ctx, responder, index, channel, trace).await,
            None => false,
        },
    }
}

/// Restrict the citizen most recently dispatched to this responder: close
/// their triage, clear any pending menu, lock them out for the configured
/// duration, tell both parties.
async fn handle_restrict(
    ctx: &Ctx,
    responder: &str,
    channel: u32,
    trace: Uuid,
    now: DateTime<Utc>,
) {
    let minutes = ctx.config.switchboard.restriction_mins;
    let (citizen, closed, name) = {
        let mut state = ctx.state.lock().await;
        let Some(citizen) = state.last_dispatch.get(responder).cloned() else {
            drop(state);
            send_dm(
                ctx.radio.as_ref(),
                "[SYSTEM] No recent dispatch to restrict.",
                responder,
                channel,
            )
            .await;
            return;
        };
        let closed = state.close_session(&citizen, CloseReason::Restricted, now);
        state.pending_911.remove(&citizen);
        let name = closed
            .as_ref()
            .map(|c| c.session.display_name.clone())
            .unwrap_or_else(|| display_name(ctx.radio.as_ref(), &citizen));
        state.restricted.insert(
            citizen.clone(),
            RestrictedEntry {
                display_name: name.clone(),
                expires_at: now + TimeDelta::minutes(minutes),
                restricted_by: responder.to_string(),
            },
        );
        (citizen, closed, name)
    };

    if let Some(closed) = &closed {
        audit_close(ctx, trace, closed).await;
    }
    ctx.audit
        .record(
            "restricted",
            serde_json::json!({
                "trace": trace,
                "sender": citizen,
                "name": name,
                "by": responder,
                "minutes": minutes,
            }),
        )
        .await;

    send_dm(
        ctx.radio.as_ref(),
        &format!("{RESTRICT_NOTICE} ~{minutes} min remaining."),
        &citizen,
        channel,
    )
    .await;
    send_dm(
        ctx.radio.as_ref(),
        &format!("[SYSTEM] {name} restricted for {minutes} min."),
        responder,
        channel,
    )
    .await;
}

/// Snapshot the active restrictions for this responder and send the numbered
/// list their next numeric reply is interpreted against.
async fn handle_cancel_list(
    ctx: &Ctx,
    responder: &str,
    channel: u32,
    trace: Uuid,
    now: DateTime<Utc>,
) {
    let entries: Vec<(String, String, i64)> = {
        let mut state = ctx.state.lock().await;
        let mut entries: Vec<(String, String, i64)> = state
            .restricted
            .iter()
            .filter(|(_, e)| !e.expired(now))
            .map(|(id, e)| (id.clone(), e.display_name.clone(), e.minutes_left(now)))
            .collect();
        entries.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)));
        if entries.is_empty() {
            state.pending_cancel.remove(responder);
        } else {
            state.pending_cancel.insert(
                responder.to_string(),
                entries.iter().map(|(id, _, _)| id.clone()).collect(),
            );
        }
        entries
    };

    audit_command(ctx, trace, responder, "cancel-list").await;

    if entries.is_empty() {
        send_dm(
            ctx.radio.as_ref(),
            "[SYSTEM] No senders are currently restricted.",
            responder,
            channel,
        )
        .await;
        return;
    }

    let mut list = String::from("[SYSTEM] Restricted senders:");
    for (index, (_, name, minutes)) in entries.iter().enumerate() {
        list.push_str(&format!("\n{}. {} — ~{} min left", index + 1, name, minutes));
    }
    list.push_str("\nReply with a number to lift.");
    send_dm(ctx.radio.as_ref(), &list, responder, channel).await;
}

/// A numeric reply is resolved against the snapshot taken at `!cancel` time,
/// never the live list, and the snapshot is consumed either way.
async fn handle_cancel_selection(
    ctx: &Ctx,
    responder: &str,
    index: usize,
    channel: u32,
    trace: Uuid,
) -> bool {
    enum Outcome {
        NotInCancelFlow,
        Invalid,
        AlreadyClear(String),
        Lifted { citizen: String, name: String },
    }

    let outcome = {
        let mut state = ctx.state.lock().await;
        match state.pending_cancel.remove(responder) {
            None if state.pending_911.contains_key(responder) => Outcome::NotInCancelFlow,
            None => Outcome::Invalid,
            Some(snapshot) => match snapshot.get(index.wrapping_sub(1)) {
                None => Outcome::Invalid,
                Some(citizen) => {
                    let citizen = citizen.clone();
                    match state.restricted.remove(&citizen) {
                        Some(entry) => Outcome::Lifted {
                            citizen,
                            name: entry.display_name,
                        },
                        None => Outcome::AlreadyClear(citizen),
                    }
                }
            },
        }
    };

    match outcome {
        // the responder is mid-911 themselves; let the menu flow take the digit
        Outcome::NotInCancelFlow => false,
        Outcome::Invalid => {
            send_dm(ctx.radio.as_ref(), RELIST_NOTICE, responder, channel).await;
            true
        }
        Outcome::AlreadyClear(citizen) => {
            send_dm(
                ctx.radio.as_ref(),
                &format!("[SYSTEM] {citizen} is no longer restricted."),
                responder,
                channel,
            )
            .await;
            true
        }
        Outcome::Lifted { citizen, name } => {
            ctx.audit
                .record(
                    "restriction_lifted",
                    serde_json::json!({
                        "trace": trace,
                        "sender": citizen,
                        "name": name,
                        "by": responder,
                    }),
                )
                .await;
            send_dm(
                ctx.radio.as_ref(),
                "[SYSTEM] Access restored by emergency services.",
                &citizen,
                channel,
            )
            .await;
            send_dm(
                ctx.radio.as_ref(),
                &format!("[SYSTEM] Restriction lifted for {name}."),
                responder,
                channel,
            )
            .await;
            true
        }
    }
}

/// `!ack` / `!responding`: record the lifecycle mark on the open session of
/// the responder's last-dispatched citizen and announce it.
async fn handle_status_mark(
    ctx: &Ctx,
    responder: &str,
    channel: u32,
    trace: Uuid,
    status: IncidentStatus,
) {
    let marked = {
        let mut state = ctx.state.lock().await;
        let citizen = state.last_dispatch.get(responder).cloned();
        citizen.and_then(|citizen| {
            state.sessions.get_mut(&citizen).map(|session| {
                session.status = status;
                (citizen, session.incident, session.dispatched_to.clone())
            })
        })
    };

    let Some((citizen, incident, dispatched_to)) = marked else {
        send_dm(
            ctx.radio.as_ref(),
            "[SYSTEM] No open triage to update.",
            responder,
            channel,
        )
        .await;
        return;
    };

    let citizen_note = match status {
        IncidentStatus::Responding => "[SOS] Help is on the way.",
        _ => "[SOS] A responder has acknowledged your request.",
    };
    send_dm(ctx.radio.as_ref(), citizen_note, &citizen, channel).await;

    let responder_name = display_name(ctx.radio.as_ref(), responder);
    for other in dispatched_to.iter().filter(|id| id.as_str() != responder) {
        send_dm(
            ctx.radio.as_ref(),
            &format!(
                "[SOS] {} is {} incident #{}.",
                responder_name,
                status.as_str(),
                incident
            ),
            other,
            channel,
        )
        .await;
    }

    ctx.audit
        .record(
            "command",
            serde_json::json!({
                "trace": trace,
                "sender": responder,
                "cmd": status.as_str(),
                "incident": incident,
            }),
        )
        .await;
}

async fn handle_safe(ctx: &Ctx, sender: &str, channel: u32, trace: Uuid, now: DateTime<Utc>) {
    let closed = ctx
        .state
        .lock()
        .await
        .close_session(sender, CloseReason::Safe, now);
    audit_command(ctx, trace, sender, "safe").await;

    let Some(closed) = closed else {
        send_dm(
            ctx.radio.as_ref(),
            "No active SOS to cancel.",
            sender,
            channel,
        )
        .await;
        return;
    };

    audit_close(ctx, trace, &closed).await;
    send_dm(
        ctx.radio.as_ref(),
        "[SOS] Cancelled. Glad you are safe.",
        sender,
        channel,
    )
    .await;

    let note = format!(
        "[SOS] {} reports safe. Incident #{} closed.",
        closed.session.display_name, closed.session.incident
    );
    notify_incident_responders(ctx, &closed.session.dispatched_to, &note, channel).await;
}

async fn handle_911(ctx: &Ctx, sender: &str, channel: u32, trace: Uuid, now: DateTime<Utc>) {
    let position = ctx
        .radio
        .node_info(sender)
        .and_then(|node| node.position);

    send_dm(ctx.radio.as_ref(), MENU_911, sender, channel).await;

    ctx.state.lock().await.pending_911.insert(
        sender.to_string(),
        Pending911 {
            menu_sent_at: now,
            position,
            channel,
        },
    );

    ctx.audit
        .record(
            "sos_911_triggered",
            serde_json::json!({
                "trace": trace,
                "sender": sender,
                "gps": render_gps(position.as_ref()),
            }),
        )
        .await;
}

/// Returns false when the sender has no pending menu and the digit should
/// flow onward as ordinary text.
async fn handle_menu_selection(ctx: &Ctx, sender: &str, digit: u8, trace: Uuid) -> bool {
    let Some(pending) = ctx.state.lock().await.pending_911.remove(sender) else {
        return false;
    };

    if digit == 5 {
        send_dm(
            ctx.radio.as_ref(),
            "[SOS] Cancelled. No emergency recorded. Stay safe.",
            sender,
            pending.channel,
        )
        .await;
        ctx.audit
            .record(
                "sos_false_alarm",
                serde_json::json!({ "trace": trace, "sender": sender }),
            )
            .await;
        return true;
    }

    let Some(trigger) = SosTrigger::from_menu_digit(digit) else {
        return false;
    };
    let accepted = dispatch_sos(
        ctx,
        DispatchRequest {
            sender: sender.to_string(),
            trigger,
            context: String::new(),
            channel: pending.channel,
            position: pending.position,
            trace,
        },
    )
    .await;
    if !accepted {
        tracing::warn!(sender = %sender, "menu selection ignored, session already open");
    }
    true
}

async fn notify_incident_responders(ctx: &Ctx, dispatched_to: &[String], note: &str, channel: u32) {
    if dispatched_to.is_empty() {
        crate::services::radio::broadcast(ctx.radio.as_ref(), note, channel).await;
        return;
    }
    for responder in dispatched_to {
        send_dm(ctx.radio.as_ref(), note, responder, channel).await;
    }
}

async fn audit_command(ctx: &Ctx, trace: Uuid, sender: &str, cmd: &str) {
    ctx.audit
        .record(
            "command",
            serde_json::json!({ "trace": trace, "sender": sender, "cmd": cmd }),
        )
        .await;
}

pub async fn audit_close(ctx: &Ctx, trace: Uuid, closed: &ClosedSession) {
    ctx.audit
        .record(
            "sos_closed",
            serde_json::json!({
                "trace": trace,
                "incident": closed.session.incident,
                "sender": closed.session.sender,
                "reason": closed.reason.as_str(),
                "duration_secs": closed.duration_secs,
            }),
        )
        .await;
}

/// A single menu digit, 1 through 5.
fn parse_menu_digit(text: &str) -> Option<u8> {
    let trimmed = text.trim();
    if trimmed.len() == 1
        && let Some(c) = trimmed.chars().next()
        && ('1'..='5').contains(&c)
    {
        return Some(c as u8 - b'0');
    }
    None
}

/// Any small integer a responder might send against a cancel list.
fn parse_cancel_index(text: &str) -> Option<usize> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.len() > 2 || !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    trimmed.parse().ok()
}
