use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Threshold comparison applied to the match count of the alarm query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmCondition {
    #[serde(rename = "count >")]
    CountGt,
    #[serde(rename = "count >=")]
    CountGte,
    #[serde(rename = "count <")]
    CountLt,
    #[serde(rename = "count <=")]
    CountLte,
}

impl AlarmCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmCondition::CountGt => "count >",
            AlarmCondition::CountGte => "count >=",
            AlarmCondition::CountLt => "count <",
            AlarmCondition::CountLte => "count <=",
        }
    }

    pub fn parse(s: &str) -> Option<AlarmCondition> {
        match s {
            "count >" => Some(AlarmCondition::CountGt),
            "count >=" => Some(AlarmCondition::CountGte),
            "count <" => Some(AlarmCondition::CountLt),
            "count <=" => Some(AlarmCondition::CountLte),
            _ => None,
        }
    }

    pub fn holds(&self, count: u64, threshold: u64) -> bool {
        match self {
            AlarmCondition::CountGt => count > threshold,
            AlarmCondition::CountGte => count >= threshold,
            AlarmCondition::CountLt => count < threshold,
            AlarmCondition::CountLte => count <= threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyslogProtocol {
    Udp,
    Tcp,
}

/// Where notifications go. One dispatch path per variant in `notify.rs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum NotificationChannel {
    Email {
        addr: String,
    },
    Webhook {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    Syslog {
        host: String,
        port: u16,
        protocol: SyslogProtocol,
        #[serde(default = "default_facility")]
        facility: u8,
    },
    Pagerduty {
        integration_key: String,
        #[serde(default = "default_severity")]
        severity: String,
    },
}

fn default_facility() -> u8 {
    1 // user-level
}

fn default_severity() -> String {
    "error".to_string()
}

/// A saved query with a count threshold, evaluated periodically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alarm {
    pub id: String,
    pub name: String,
    pub query: String,
    #[serde(default)]
    pub is_regex: bool,
    pub condition: AlarmCondition,
    pub threshold: u64,
    pub time_window_minutes: u32,
    pub enabled: bool,
    #[serde(default)]
    pub notification_channels: Vec<NotificationChannel>,
    #[serde(default = "default_throttle")]
    pub throttle_window_minutes: u32,
}

pub fn default_throttle() -> u32 {
    10
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAlarmRequest {
    pub name: String,
    pub query: String,
    #[serde(default)]
    pub is_regex: bool,
    pub condition: AlarmCondition,
    pub threshold: u64,
    #[serde(default = "default_window")]
    pub time_window_minutes: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub notification_channels: Vec<NotificationChannel>,
    #[serde(default = "default_throttle")]
    pub throttle_window_minutes: u32,
}

fn default_window() -> u32 {
    5
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmStatus {
    Triggered,
    Acknowledged,
    Resolved,
}

impl AlarmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmStatus::Triggered => "TRIGGERED",
            AlarmStatus::Acknowledged => "ACKNOWLEDGED",
            AlarmStatus::Resolved => "RESOLVED",
        }
    }

    pub fn parse(s: &str) -> Option<AlarmStatus> {
        match s {
            "TRIGGERED" => Some(AlarmStatus::Triggered),
            "ACKNOWLEDGED" => Some(AlarmStatus::Acknowledged),
            "RESOLVED" => Some(AlarmStatus::Resolved),
            _ => None,
        }
    }
}

/// One firing of an alarm. RESOLVED is terminal; a later firing creates a
/// new event unless it lands inside the alarm's throttle window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmEvent {
    pub id: String,
    pub alarm_id: String,
    pub alarm_name: String,
    pub status: AlarmStatus,
    /// Epoch milliseconds.
    pub triggered_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<i64>,
    pub match_count: u64,
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmStatistics {
    pub total: u64,
    pub enabled: u64,
    pub disabled: u64,
    pub recently_triggered_last_hour: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckRequest {
    #[serde(default = "default_user")]
    pub user: String,
}

fn default_user() -> String {
    "anonymous".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_comparisons() {
        assert!(AlarmCondition::CountGt.holds(1, 0));
        assert!(!AlarmCondition::CountGt.holds(0, 0));
        assert!(AlarmCondition::CountGte.holds(0, 0));
        assert!(AlarmCondition::CountLt.holds(2, 3));
        assert!(AlarmCondition::CountLte.holds(3, 3));
    }

    #[test]
    fn channel_round_trips_tagged_json() {
        let ch = NotificationChannel::Syslog {
            host: "loghost".into(),
            port: 514,
            protocol: SyslogProtocol::Udp,
            facility: 1,
        };
        let json = serde_json::to_string(&ch).unwrap();
        assert!(json.contains(r#""type":"SYSLOG""#));
        let back: NotificationChannel = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, NotificationChannel::Syslog { port: 514, .. }));
    }

    #[test]
    fn condition_wire_form() {
        let c: AlarmCondition = serde_json::from_str(r#""count >=""#).unwrap();
        assert_eq!(c, AlarmCondition::CountGte);
    }
}
