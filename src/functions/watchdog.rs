use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::functions::dispatch::dispatch_line;
use crate::functions::router::audit_close;
use crate::schema::{CloseReason, render_gps};
use crate::services::radio::{broadcast, display_name, send_dm};
use crate::state::{ClosedSession, Ctx};

/// Periodic sweep driving the three timed transitions: triage inactivity,
/// 911 menus nobody answered, and restriction expiry. Runs until shutdown.
pub async fn run_watchdog(ctx: Ctx) {
    let interval =
        std::time::Duration::from_secs(ctx.config.switchboard.watchdog_interval_secs.max(1));
    loop {
        tokio::select! {
            _ = ctx.shutdown_signal() => break,
            _ = tokio::time::sleep(interval) => {
                let transitions = watchdog_tick(&ctx, Utc::now()).await;
                if transitions > 0 {
                    tracing::info!(transitions, "watchdog tick");
                }
            }
        }
    }
    tracing::info!("watchdog stopped");
}

/// One sweep. Collects every aged entry under the guard, releases it, then
/// performs the notifications. Idempotent: a second sweep at the same
/// instant finds nothing left to age out.
pub async fn watchdog_tick(ctx: &Ctx, now: DateTime<Utc>) -> usize {
    let switchboard = &ctx.config.switchboard;
    let triage_cutoff = now - TimeDelta::seconds(switchboard.triage_timeout_secs);
    let menu_cutoff = now - TimeDelta::seconds(switchboard.menu_timeout_secs);
    let responders = ctx.config.responder_ids();

    struct DeadMenu {
        sender: String,
        channel: u32,
        line: String,
    }

    let (timed_out, dead_menus, expired): (Vec<ClosedSession>, Vec<DeadMenu>, Vec<(String, String)>) = {
        let mut state = ctx.state.lock().await;

        let idle: Vec<String> = state
            .sessions
            .values()
            .filter(|s| s.last_activity < triage_cutoff)
            .map(|s| s.sender.clone())
            .collect();
        let timed_out: Vec<ClosedSession> = idle
            .into_iter()
            .filter_map(|sender| state.close_session(&sender, CloseReason::Timeout, now))
            .collect();

        let dead: Vec<String> = state
            .pending_911
            .iter()
            .filter(|(_, p)| p.menu_sent_at < menu_cutoff)
            .map(|(sender, _)| sender.clone())
            .collect();
        let mut dead_menus = Vec::new();
        for sender in dead {
            let Some(pending) = state.pending_911.remove(&sender) else {
                continue;
            };
            let name = display_name(ctx.radio.as_ref(), &sender);
            let line = dispatch_line(
                "!911 NO RESPONSE",
                &name,
                &render_gps(pending.position.as_ref()),
                now,
                &format!(
                    "No menu selection within {}s",
                    switchboard.menu_timeout_secs
                ),
            );
            // make the silent sender restrictable by any responder
            for responder in &responders {
                state
                    .last_dispatch
                    .insert(responder.clone(), sender.clone());
            }
            dead_menus.push(DeadMenu {
                sender,
                channel: pending.channel,
                line,
            });
        }

        let gone: Vec<String> = state
            .restricted
            .iter()
            .filter(|(_, e)| e.expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        let expired: Vec<(String, String)> = gone
            .into_iter()
            .filter_map(|id| {
                state
                    .restricted
                    .remove(&id)
                    .map(|entry| (id, entry.display_name))
            })
            .collect();

        (timed_out, dead_menus, expired)
    };

    let transitions = timed_out.len() + dead_menus.len() + expired.len();
    let trace = Uuid::new_v4();

    for closed in &timed_out {
        let session = &closed.session;
        tracing::info!(
            incident = session.incident,
            sender = %session.sender,
            "watchdog: triage timed out"
        );
        audit_close(ctx, trace, closed).await;
        send_dm(
            ctx.radio.as_ref(),
            &format!(
                "[SOS] Triage closed after {}s of inactivity. Send !sos again if you still need help.",
                ctx.config.switchboard.triage_timeout_secs
            ),
            &session.sender,
            session.channel,
        )
        .await;
        let note = format!(
            "[SOS] Triage with {} timed out. Incident #{} closed.",
            session.display_name, session.incident
        );
        for responder in &session.dispatched_to {
            send_dm(ctx.radio.as_ref(), &note, responder, session.channel).await;
        }
    }

    for menu in &dead_menus {
        ctx.audit
            .record(
                "sos_911_no_response",
                serde_json::json!({ "trace": trace, "sender": menu.sender }),
            )
            .await;
        if responders.is_empty() {
            broadcast(ctx.radio.as_ref(), &menu.line, menu.channel).await;
        } else {
            for responder in &responders {
                send_dm(ctx.radio.as_ref(), &menu.line, responder, menu.channel).await;
            }
        }
    }

    for (sender, name) in &expired {
        ctx.audit
            .record(
                "restriction_expired",
                serde_json::json!({ "trace": trace, "sender": sender, "name": name }),
            )
            .await;
    }

    transitions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::router::handle_packet;
    use crate::schema::RestrictedEntry;
    use crate::testing::{TestBed, packet};
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn idle_triage_times_out_and_notifies_both_sides() {
        let bed = TestBed::new().await;
        handle_packet(&bed.ctx, packet("!n1", "!fire stove")).await;
        settle().await;
        bed.radio.clear();

        // nothing has aged yet
        assert_eq!(watchdog_tick(&bed.ctx, Utc::now()).await, 0);

        let later = Utc::now() + TimeDelta::seconds(601);
        assert_eq!(watchdog_tick(&bed.ctx, later).await, 1);

        assert!(bed.ctx.state.lock().await.sessions.is_empty());
        assert!(
            bed.radio.sent_to("!n1")[0].contains("closed after 600s of inactivity")
        );
        assert!(bed.radio.sent_to("!fire_node")[0].contains("timed out"));

        // second sweep at the same instant is a no-op
        bed.radio.clear();
        assert_eq!(watchdog_tick(&bed.ctx, later).await, 0);
        assert!(bed.radio.sent().is_empty());
    }

    #[tokio::test]
    async fn unanswered_menu_becomes_a_no_response_dispatch() {
        let bed = TestBed::new().await;
        handle_packet(&bed.ctx, packet("!n3", "!911")).await;
        bed.radio.clear();

        let later = Utc::now() + TimeDelta::seconds(121);
        assert_eq!(watchdog_tick(&bed.ctx, later).await, 1);

        assert!(!bed.ctx.state.lock().await.pending_911.contains_key("!n3"));
        // no session opens for a silent sender
        assert!(bed.ctx.state.lock().await.sessions.is_empty());

        for responder in ["!ems_node", "!fire_node", "!police_node"] {
            let sent = bed.radio.sent_to(responder);
            assert_eq!(sent.len(), 1);
            assert!(sent[0].starts_with("[DISPATCH] !911 NO RESPONSE"));
            assert!(sent[0].contains("No menu selection within 120s"));
        }
        assert!(
            bed.audit_types()
                .contains(&"sos_911_no_response".to_string())
        );

        // the silent sender is now the restrict referent for every responder
        let state = bed.ctx.state.lock().await;
        assert_eq!(
            state.last_dispatch.get("!police_node").map(String::as_str),
            Some("!n3")
        );
    }

    #[tokio::test]
    async fn expired_restrictions_are_swept() {
        let bed = TestBed::new().await;
        let now = Utc::now();
        bed.ctx.state.lock().await.restricted.insert(
            "!n4".to_string(),
            RestrictedEntry {
                display_name: "n4".to_string(),
                expires_at: now + TimeDelta::minutes(120),
                restricted_by: "!police_node".to_string(),
            },
        );

        assert_eq!(watchdog_tick(&bed.ctx, now).await, 0);
        assert_eq!(
            watchdog_tick(&bed.ctx, now + TimeDelta::minutes(121)).await,
            1
        );
        assert!(bed.ctx.state.lock().await.restricted.is_empty());
        assert!(
            bed.audit_types()
                .contains(&"restriction_expired".to_string())
        );
    }

    #[tokio::test]
    async fn fresh_activity_defers_the_triage_timeout() {
        let bed = TestBed::new().await;
        handle_packet(&bed.ctx, packet("!n1", "!fire stove")).await;
        settle().await;

        // a follow-up refreshes the activity clock via the transcript append
        let max = bed.ctx.config.switchboard.triage_max_transcript;
        let refreshed = Utc::now() + TimeDelta::seconds(500);
        bed.ctx.state.lock().await.append_transcript(
            "!n1",
            crate::schema::Role::Citizen,
            "still burning",
            refreshed,
            max,
        );

        assert_eq!(
            watchdog_tick(&bed.ctx, Utc::now() + TimeDelta::seconds(601)).await,
            0
        );
        assert!(bed.ctx.state.lock().await.sessions.contains_key("!n1"));
    }
}
