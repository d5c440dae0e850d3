use crate::schema::packet::Position;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Emergency trigger tokens, longest-first so prefix matching never picks a
/// shorter token that happens to lead a longer one.
const TRIGGER_TOKENS: [(&str, SosTrigger); 5] = [
    ("!police", SosTrigger::Police),
    ("!fire", SosTrigger::Fire),
    ("!help", SosTrigger::Help),
    ("!ems", SosTrigger::Ems),
    ("!sos", SosTrigger::Sos),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SosTrigger {
    Sos,
    Police,
    Fire,
    Ems,
    Help,
}

impl SosTrigger {
    pub fn token(&self) -> &'static str {
        match self {
            SosTrigger::Sos => "!sos",
            SosTrigger::Police => "!police",
            SosTrigger::Fire => "!fire",
            SosTrigger::Ems => "!ems",
            SosTrigger::Help => "!help",
        }
    }

    /// Uppercased form used in ACKs and dispatch lines.
    pub fn label(&self) -> &'static str {
        match self {
            SosTrigger::Sos => "!SOS",
            SosTrigger::Police => "!POLICE",
            SosTrigger::Fire => "!FIRE",
            SosTrigger::Ems => "!EMS",
            SosTrigger::Help => "!HELP",
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            SosTrigger::Police => "police",
            SosTrigger::Fire => "fire",
            SosTrigger::Ems => "medical",
            SosTrigger::Sos | SosTrigger::Help => "general",
        }
    }

    /// Key into the configured responder map.
    pub fn responder_key(&self) -> &'static str {
        match self {
            SosTrigger::Sos => "sos",
            SosTrigger::Police => "police",
            SosTrigger::Fire => "fire",
            SosTrigger::Ems => "ems",
            SosTrigger::Help => "help",
        }
    }

    /// 911 menu selections: 1 = Fire, 2 = Medical, 3 = Police, 4 = Other.
    pub fn from_menu_digit(digit: u8) -> Option<Self> {
        match digit {
            1 => Some(SosTrigger::Fire),
            2 => Some(SosTrigger::Ems),
            3 => Some(SosTrigger::Police),
            4 => Some(SosTrigger::Sos),
            _ => None,
        }
    }

    /// Match a message against the trigger vocabulary. The token must be the
    /// whole message or be followed by whitespace; the remainder is captured
    /// as free-text context.
    pub fn match_message(text: &str) -> Option<(Self, String)> {
        let trimmed = text.trim();
        let lower = trimmed.to_ascii_lowercase();
        for (token, trigger) in TRIGGER_TOKENS {
            if lower == token {
                return Some((trigger, String::new()));
            }
            if let Some(rest) = lower.strip_prefix(token)
                && rest.starts_with(char::is_whitespace)
            {
                let context = trimmed[token.len()..].trim().to_string();
                return Some((trigger, context));
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Citizen,
    Operator,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Citizen => "citizen",
            Role::Operator => "operator",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseReason {
    Safe,
    Timeout,
    Restricted,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Safe => "safe",
            CloseReason::Timeout => "timeout",
            CloseReason::Restricted => "restricted",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Responder-driven lifecycle markers. Recorded and announced only; triage
/// routing never depends on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Dispatched,
    Acknowledged,
    Responding,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Dispatched => "dispatched",
            IncidentStatus::Acknowledged => "acknowledged",
            IncidentStatus::Responding => "responding",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub ts: DateTime<Utc>,
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageSession {
    pub sender: String,
    pub display_name: String,
    pub trigger: SosTrigger,
    pub context: Option<String>,
    pub position: Option<Position>,
    /// Node ids the dispatch line went to; empty means channel broadcast.
    pub dispatched_to: Vec<String>,
    pub incident: u64,
    pub status: IncidentStatus,
    pub channel: u32,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub transcript: Vec<TranscriptEntry>,
}

impl TriageSession {
    /// Human form of the dispatch target for prompts and notices.
    pub fn dispatched_to_label(&self) -> String {
        if self.dispatched_to.is_empty() {
            "ALL".to_string()
        } else {
            self.dispatched_to.join(", ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_bare_trigger_token() {
        let (trigger, context) = SosTrigger::match_message("!fire").unwrap();
        assert_eq!(trigger, SosTrigger::Fire);
        assert!(context.is_empty());
    }

    #[test]
    fn matches_trigger_with_context() {
        let (trigger, context) = SosTrigger::match_message("!fire kitchen stove").unwrap();
        assert_eq!(trigger, SosTrigger::Fire);
        assert_eq!(context, "kitchen stove");
    }

    #[test]
    fn trigger_match_is_case_insensitive_but_context_keeps_case() {
        let (trigger, context) = SosTrigger::match_message("!EMS Chest Pain").unwrap();
        assert_eq!(trigger, SosTrigger::Ems);
        assert_eq!(context, "Chest Pain");
    }

    #[test]
    fn token_must_be_whole_word() {
        assert!(SosTrigger::match_message("!sosumi").is_none());
        assert!(SosTrigger::match_message("!helper needed").is_none());
        assert!(SosTrigger::match_message("please !sos").is_none());
    }

    #[test]
    fn menu_digits_map_to_triggers() {
        assert_eq!(SosTrigger::from_menu_digit(1), Some(SosTrigger::Fire));
        assert_eq!(SosTrigger::from_menu_digit(2), Some(SosTrigger::Ems));
        assert_eq!(SosTrigger::from_menu_digit(3), Some(SosTrigger::Police));
        assert_eq!(SosTrigger::from_menu_digit(4), Some(SosTrigger::Sos));
        assert_eq!(SosTrigger::from_menu_digit(5), None);
    }

    #[test]
    fn dispatched_to_label_shows_all_for_broadcast() {
        let session = TriageSession {
            sender: "!n1".to_string(),
            display_name: "n1".to_string(),
            trigger: SosTrigger::Sos,
            context: None,
            position: None,
            dispatched_to: Vec::new(),
            incident: 1,
            status: IncidentStatus::Dispatched,
            channel: 0,
            started_at: Utc::now(),
            last_activity: Utc::now(),
            transcript: Vec::new(),
        };
        assert_eq!(session.dispatched_to_label(), "ALL");
    }
}
