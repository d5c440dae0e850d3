use anyhow::Result;
use chrono::Utc;
use std::fmt::Write as _;
use std::time::Duration;

use crate::functions::dispatch::SAFE_FOOTER;
use crate::schema::{Role, TriageSession, WorkItem, render_gps};
use crate::services::llm::ChatMessage;
use crate::services::radio::{chunked_send, send_dm};
use crate::state::Ctx;

const FALLBACK_REPLY: &str = "No response generated. Please try again.";

const GENERAL_PERSONA: &str = "You are the Operator, an AI assistant reachable over a \
low-bandwidth packet radio link. Give a clear, helpful answer in 3 or 4 short sentences. \
Do not use markdown.";

const TRIAGE_RULES: &str = "Rules: Triage this emergency only. If the citizen drifts \
off-topic, redirect them back to the emergency. Ask exactly one follow-up question. \
Keep your reply to at most 2 sentences. Do not use markdown.";

/// Single consumer of the work queue. One consumer means per-sender replies
/// stay in receive order and a citizen bursting messages mid-triage never
/// gets interleaved answers.
pub async fn run_worker(ctx: Ctx, mut work: crate::state::WorkReceiver) {
    loop {
        tokio::select! {
            _ = ctx.shutdown_signal() => break,
            item = work.recv() => {
                let Some(item) = item else { break };
                process_item(&ctx, &item).await;
            }
        }
    }
    tracing::info!("ai worker stopped");
}

/// Drains one item, converting any model or transport failure into a short
/// notice to the sender. The worker itself never dies on a bad item.
pub async fn process_item(ctx: &Ctx, item: &WorkItem) {
    if let Err(e) = handle_item(ctx, item).await {
        tracing::error!(sender = %item.sender, error = %e, "ai worker error");
        ctx.audit
            .record(
                "ai_worker_error",
                serde_json::json!({
                    "trace": item.trace,
                    "sender": item.sender,
                    "error": e.to_string(),
                }),
            )
            .await;
        send_dm(
            ctx.radio.as_ref(),
            "[SYSTEM] Operator error. Your message was received; please try again.",
            &item.sender,
            item.channel,
        )
        .await;
    }
}

async fn handle_item(ctx: &Ctx, item: &WorkItem) -> Result<()> {
    if item.triage {
        handle_triage(ctx, item).await
    } else {
        handle_general(ctx, item).await
    }
}

async fn handle_triage(ctx: &Ctx, item: &WorkItem) -> Result<()> {
    let max = ctx.config.switchboard.triage_max_transcript;
    let snapshot: Option<TriageSession> = {
        let mut state = ctx.state.lock().await;
        if state.append_transcript(&item.sender, Role::Citizen, &item.text, Utc::now(), max) {
            state.snapshot_session(&item.sender)
        } else {
            None
        }
    };

    // the session can close between enqueue and processing; the message is
    // still answered, just as ordinary chat
    let Some(session) = snapshot else {
        return handle_general(ctx, item).await;
    };

    let messages = build_triage_prompt(&session, &item.text);
    let reply = complete_or_fallback(ctx, &messages).await?;

    ctx.state.lock().await.append_transcript(
        &item.sender,
        Role::Operator,
        &reply,
        Utc::now(),
        max,
    );

    transmit(ctx, item, &format!("{reply} {SAFE_FOOTER}")).await;

    ctx.audit
        .record(
            "triage_exchange",
            serde_json::json!({
                "trace": item.trace,
                "sender": item.sender,
                "incident": session.incident,
                "citizen_chars": item.text.chars().count(),
                "reply_chars": reply.chars().count(),
            }),
        )
        .await;
    Ok(())
}

async fn handle_general(ctx: &Ctx, item: &WorkItem) -> Result<()> {
    let history = ctx.state.lock().await.history(&item.sender);

    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(GENERAL_PERSONA));
    messages.extend(history);
    messages.push(ChatMessage::user(&item.text));

    let reply = complete_or_fallback(ctx, &messages).await?;

    ctx.state
        .lock()
        .await
        .push_history(&item.sender, &item.text, &reply);

    transmit(ctx, item, &reply).await;

    ctx.audit
        .record(
            "general_exchange",
            serde_json::json!({
                "trace": item.trace,
                "sender": item.sender,
                "reply_chars": reply.chars().count(),
            }),
        )
        .await;
    Ok(())
}

/// Runs the model under the hard request timeout. An elapsed timeout or an
/// empty completion yields the fixed fallback; only transport failures
/// bubble up to the error notice.
async fn complete_or_fallback(ctx: &Ctx, messages: &[ChatMessage]) -> Result<String> {
    let budget = Duration::from_secs(ctx.config.llm.request_timeout_secs);
    let reply = match tokio::time::timeout(
        budget,
        ctx.llm.complete(messages, ctx.config.llm.max_tokens),
    )
    .await
    {
        Err(_) => {
            tracing::warn!("LLM call exceeded its request timeout");
            String::new()
        }
        Ok(Err(e)) if is_timeout(&e) => {
            tracing::warn!(error = %e, "LLM transport timed out");
            String::new()
        }
        Ok(Err(e)) => return Err(e),
        Ok(Ok(text)) => text,
    };

    let reply = reply.trim().to_string();
    if reply.is_empty() {
        Ok(FALLBACK_REPLY.to_string())
    } else {
        Ok(reply)
    }
}

fn is_timeout(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<reqwest::Error>()
        .is_some_and(reqwest::Error::is_timeout)
}

async fn transmit(ctx: &Ctx, item: &WorkItem, text: &str) {
    chunked_send(
        ctx.radio.as_ref(),
        text,
        Some(&item.sender),
        item.channel,
        ctx.config.switchboard.chunk_width,
        Duration::from_secs(ctx.config.switchboard.chunk_delay_secs),
    )
    .await;
}

/// Deterministic triage context: incident header, transcript so far, fixed
/// rules. The newest citizen message rides as the user turn, not in the
/// transcript block.
fn build_triage_prompt(session: &TriageSession, newest: &str) -> Vec<ChatMessage> {
    let mut system = String::from("You are an emergency triage operator on a packet radio link.\n");
    let _ = writeln!(
        system,
        "Incident #{}: {} ({})",
        session.incident,
        session.trigger.label(),
        session.trigger.category()
    );
    let _ = writeln!(
        system,
        "Started: {} UTC",
        session.started_at.format("%H:%M:%S")
    );
    let _ = writeln!(
        system,
        "Citizen: {} ({})",
        session.display_name, session.sender
    );
    let _ = writeln!(system, "GPS: {}", render_gps(session.position.as_ref()));
    let _ = writeln!(system, "Dispatched to: {}", session.dispatched_to_label());

    let prior: Vec<&crate::schema::TranscriptEntry> = session
        .transcript
        .iter()
        .take(session.transcript.len().saturating_sub(1))
        .collect();
    if !prior.is_empty() {
        system.push_str("Transcript so far:\n");
        for entry in prior {
            let _ = writeln!(
                system,
                "[{}] {}: {}",
                entry.ts.format("%H:%M:%S"),
                entry.role.as_str(),
                entry.text
            );
        }
    }
    system.push('\n');
    system.push_str(TRIAGE_RULES);

    vec![ChatMessage::system(system), ChatMessage::user(newest)]
}
