use crate::schema::NodeInfo;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Outbound side of the radio driver plus its node directory. Inbound text
/// arrives on an mpsc channel produced by the concrete driver.
#[async_trait]
pub trait RadioLink: Send + Sync {
    async fn send_text(
        &self,
        text: &str,
        dest: Option<&str>,
        channel: u32,
        want_ack: bool,
    ) -> Result<()>;

    fn node_info(&self, id: &str) -> Option<NodeInfo>;
    fn node_count(&self) -> usize;
    fn local_id(&self) -> String;
}

/// Display name for a node, falling back to the raw id when the directory
/// has no entry.
pub fn display_name(radio: &dyn RadioLink, id: &str) -> String {
    radio
        .node_info(id)
        .map(|n| n.display_name())
        .unwrap_or_else(|| id.to_string())
}

/// Word-safe wrap with `width` measured in characters, not bytes.
/// Whitespace runs (including newlines) collapse to single spaces; words
/// longer than `width` are hard-split rather than overflowing the frame.
pub fn wrap_words(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0;

    for word in text.split_whitespace() {
        let mut word = word;
        let mut word_chars = word.chars().count();
        while word_chars > width {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_chars = 0;
            }
            let split = char_offset(word, width);
            chunks.push(word[..split].to_string());
            word = &word[split..];
            word_chars -= width;
        }
        if word.is_empty() {
            continue;
        }
        if current.is_empty() {
            current.push_str(word);
            current_chars = word_chars;
        } else if current_chars + 1 + word_chars <= width {
            current.push(' ');
            current.push_str(word);
            current_chars += 1 + word_chars;
        } else {
            chunks.push(std::mem::take(&mut current));
            current.push_str(word);
            current_chars = word_chars;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Byte offset of the `chars`-th character, or the end of the string.
fn char_offset(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map_or(s.len(), |(index, _)| index)
}

/// One direct message. Transport errors are logged and swallowed; the slow
/// link drops frames routinely and callers must not unwind over it.
pub async fn send_dm(radio: &dyn RadioLink, text: &str, to: &str, channel: u32) {
    if let Err(e) = radio.send_text(text, Some(to), channel, true).await {
        tracing::warn!(to, channel, error = %e, "send failed");
    }
}

pub async fn broadcast(radio: &dyn RadioLink, text: &str, channel: u32) {
    if let Err(e) = radio.send_text(text, None, channel, false).await {
        tracing::warn!(channel, error = %e, "broadcast failed");
    }
}

/// Word-safe chunked transmission with `[i/n]` pagination when the reply
/// spans frames and a mandatory pause between chunks. The pagination prefix
/// rides on top of `width`, so `width` must leave headroom under the
/// channel's frame cap.
pub async fn chunked_send(
    radio: &dyn RadioLink,
    text: &str,
    dest: Option<&str>,
    channel: u32,
    width: usize,
    delay: Duration,
) {
    let chunks = wrap_words(text, width);
    let total = chunks.len();
    for (index, chunk) in chunks.iter().enumerate() {
        let framed = if total > 1 {
            format!("[{}/{}] {}", index + 1, total, chunk)
        } else {
            chunk.clone()
        };
        match dest {
            Some(to) => send_dm(radio, &framed, to, channel).await,
            None => broadcast(radio, &framed, channel).await,
        }
        if index + 1 < total {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Shared ownership alias used across tasks.
pub type SharedRadio = Arc<dyn RadioLink>;
