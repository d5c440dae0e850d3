use crate::schema::{NodeInfo, Position, TextPacket};
use crate::services::radio::RadioLink;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::io::BufRead;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Stdin/stdout bench adapter standing in for the hardware driver.
///
/// Inbound lines:
///   `<from>|<text>`            packet on the primary channel
///   `<from>|<channel>|<text>`  packet on an explicit channel
///   `#pos <from> <lat> <lon>`  set a directory position for a node
///   `#name <from> <name>`      set a directory long name for a node
///
/// Outbound frames are printed, one line each.
pub struct ConsoleRadio {
    local: String,
    primary_channel: u32,
    nodes: Mutex<HashMap<String, NodeInfo>>,
}

impl ConsoleRadio {
    pub fn spawn(primary_channel: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<TextPacket>) {
        let radio = Arc::new(Self {
            local: "!console".to_string(),
            primary_channel,
            nodes: Mutex::new(HashMap::new()),
        });
        let (tx, rx) = mpsc::unbounded_channel();

        let reader = radio.clone();
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Some(directive) = line.strip_prefix('#') {
                    reader.apply_directive(directive);
                    continue;
                }
                let Some(packet) = reader.parse_packet(line) else {
                    eprintln!("unparseable input, expected from|text: {line}");
                    continue;
                };
                reader.learn_node(&packet.from);
                if tx.send(packet).is_err() {
                    break;
                }
            }
        });

        (radio, rx)
    }

    fn parse_packet(&self, line: &str) -> Option<TextPacket> {
        let parts: Vec<&str> = line.splitn(3, '|').collect();
        let (from, channel, text) = match parts.as_slice() {
            [from, text] => (*from, self.primary_channel, *text),
            [from, channel, text] => (*from, channel.trim().parse().ok()?, *text),
            _ => return None,
        };
        if from.trim().is_empty() {
            return None;
        }
        Some(TextPacket {
            text: text.to_string(),
            from: from.trim().to_string(),
            channel,
            rx_time: Utc::now(),
        })
    }

    fn apply_directive(&self, directive: &str) {
        let fields: Vec<&str> = directive.split_whitespace().collect();
        match fields.as_slice() {
            ["pos", id, lat, lon] => {
                let (Ok(latitude), Ok(longitude)) = (lat.parse(), lon.parse()) else {
                    eprintln!("bad #pos coordinates: {directive}");
                    return;
                };
                let mut nodes = self.nodes.lock().unwrap();
                entry(&mut nodes, id).position = Some(Position {
                    latitude,
                    longitude,
                });
            }
            ["name", id, rest @ ..] if !rest.is_empty() => {
                let mut nodes = self.nodes.lock().unwrap();
                entry(&mut nodes, id).long_name = Some(rest.join(" "));
            }
            _ => eprintln!("unknown directive: #{directive}"),
        }
    }

    fn learn_node(&self, id: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        entry(&mut nodes, id);
    }
}

fn entry<'a>(nodes: &'a mut HashMap<String, NodeInfo>, id: &str) -> &'a mut NodeInfo {
    nodes.entry(id.to_string()).or_insert_with(|| NodeInfo {
        id: id.to_string(),
        ..Default::default()
    })
}

#[async_trait]
impl RadioLink for ConsoleRadio {
    async fn send_text(
        &self,
        text: &str,
        dest: Option<&str>,
        channel: u32,
        _want_ack: bool,
    ) -> Result<()> {
        match dest {
            Some(to) => println!("[tx ch{channel} -> {to}] {text}"),
            None => println!("[tx ch{channel} broadcast] {text}"),
        }
        Ok(())
    }

    fn node_info(&self, id: &str) -> Option<NodeInfo> {
        self.nodes.lock().unwrap().get(id).cloned()
    }

    fn node_count(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }

    fn local_id(&self) -> String {
        self.local.clone()
    }
}
