use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One decoded text frame delivered by the radio driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextPacket {
    pub text: String,
    pub from: String,
    pub channel: u32,
    pub rx_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

impl Position {
    /// Fixed wire rendering used in ACKs and dispatch lines.
    pub fn render(&self) -> String {
        format!("{:.5},{:.5}", self.latitude, self.longitude)
    }
}

/// Render an optional position the way every outbound message does.
pub fn render_gps(position: Option<&Position>) -> String {
    match position {
        Some(p) => p.render(),
        None => "UNKNOWN".to_string(),
    }
}

/// Directory entry from the radio's node database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub position: Option<Position>,
}

impl NodeInfo {
    /// Best available display name, falling back to the raw node id.
    pub fn display_name(&self) -> String {
        self.long_name
            .clone()
            .or_else(|| self.short_name.clone())
            .unwrap_or_else(|| self.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_position_with_five_decimals() {
        let p = Position {
            latitude: 40.712776,
            longitude: -74.005974,
        };
        assert_eq!(p.render(), "40.71278,-74.00597");
    }

    #[test]
    fn missing_position_renders_unknown() {
        assert_eq!(render_gps(None), "UNKNOWN");
    }

    #[test]
    fn display_name_prefers_long_name() {
        let node = NodeInfo {
            id: "!a1b2c3".to_string(),
            long_name: Some("Ridge Relay".to_string()),
            short_name: Some("RR".to_string()),
            position: None,
        };
        assert_eq!(node.display_name(), "Ridge Relay");

        let bare = NodeInfo {
            id: "!a1b2c3".to_string(),
            ..Default::default()
        };
        assert_eq!(bare.display_name(), "!a1b2c3");
    }
}
