//! MQTT topic definitions

use crate::router::{Address, TopicKind};

/// MQTT topic patterns
pub struct Topics;

impl Topics {
    /// Update notification topic for one device
    pub fn ota_update(device_id: &str) -> String {
        format!("gridlink/{}/ota/update", device_id)
    }

    /// Session status topic for one device
    pub fn ota_status(device_id: &str) -> String {
        format!("gridlink/{}/ota/status", device_id)
    }

    /// Operational command topic for one device
    pub fn command(device_id: &str) -> String {
        format!("gridlink/{}/command", device_id)
    }

    /// Command acknowledgment topic for one device
    pub fn command_ack(device_id: &str) -> String {
        format!("gridlink/{}/command/ack", device_id)
    }

    /// Telemetry topic for one device
    pub fn telemetry(device_id: &str) -> String {
        format!("gridlink/{}/telemetry", device_id)
    }

    /// Topic for a router address
    pub fn for_address(address: &Address) -> String {
        match address.kind {
            TopicKind::Update => Self::ota_update(&address.device_id),
            TopicKind::Status => Self::ota_status(&address.device_id),
            TopicKind::Command => Self::command(&address.device_id),
            TopicKind::CommandAck => Self::command_ack(&address.device_id),
            TopicKind::Telemetry => Self::telemetry(&address.device_id),
        }
    }

    /// Fleet-wide subscription filter for one kind (coordinator side)
    pub fn fleet_filter(kind: TopicKind) -> &'static str {
        match kind {
            TopicKind::Update => "gridlink/+/ota/update",
            TopicKind::Status => "gridlink/+/ota/status",
            TopicKind::Command => "gridlink/+/command",
            TopicKind::CommandAck => "gridlink/+/command/ack",
            TopicKind::Telemetry => "gridlink/+/telemetry",
        }
    }

    /// Parse a concrete topic back into a router address
    pub fn parse(topic: &str) -> Option<Address> {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() < 3 || parts[0] != "gridlink" || parts[1].is_empty() || parts[1] == "+" {
            return None;
        }

        let device_id = parts[1].to_string();
        let kind = match &parts[2..] {
            ["ota", "update"] => TopicKind::Update,
            ["ota", "status"] => TopicKind::Status,
            ["command"] => TopicKind::Command,
            ["command", "ack"] => TopicKind::CommandAck,
            ["telemetry"] => TopicKind::Telemetry,
            _ => return None,
        };

        Some(Address { device_id, kind })
    }

    /// Parse a topic to extract the device ID
    pub fn parse_device_id(topic: &str) -> Option<String> {
        Self::parse(topic).map(|address| address.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_generation() {
        assert_eq!(Topics::ota_update("bat-123"), "gridlink/bat-123/ota/update");
        assert_eq!(Topics::command_ack("bat-123"), "gridlink/bat-123/command/ack");
        assert_eq!(
            Topics::for_address(&Address::new("bat-123", TopicKind::Status)),
            "gridlink/bat-123/ota/status"
        );
    }

    #[test]
    fn test_topic_parsing() {
        let address = Topics::parse("gridlink/bat-123/ota/status").unwrap();
        assert_eq!(address.device_id, "bat-123");
        assert_eq!(address.kind, TopicKind::Status);

        let address = Topics::parse("gridlink/bat-9/command/ack").unwrap();
        assert_eq!(address.kind, TopicKind::CommandAck);

        assert!(Topics::parse("gridlink/bat-123/bogus").is_none());
        assert!(Topics::parse("otherprefix/bat-123/ota/status").is_none());
        assert!(Topics::parse("gridlink/+/ota/status").is_none());
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        for kind in [
            TopicKind::Update,
            TopicKind::Status,
            TopicKind::Command,
            TopicKind::CommandAck,
            TopicKind::Telemetry,
        ] {
            let address = Address::new("bat-7", kind);
            let parsed = Topics::parse(&Topics::for_address(&address)).unwrap();
            assert_eq!(parsed, address);
        }
    }
}
