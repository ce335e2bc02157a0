//! Data models for Vigil.
//!
//! Monitors own channels, channels own readings, rules attach to channels and
//! name their contacts, and alerts tie a channel, rule and triggering reading
//! together. Every enumerated attribute is a closed enum with a fixed text
//! mapping used by both the database and the JSON API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rules::{Condition, Selector};
use crate::units::Conversion;

/// Database identifier for every entity.
pub type Id = i64;

/// Implements `as_str`, `Display` and `FromStr` from a fixed variant/text table.
macro_rules! text_enum {
    ($ty:ident, $field:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl ::std::fmt::Display for $ty {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $ty {
            type Err = $crate::error::Error;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err($crate::error::Error::invalid_value($field, other)),
                }
            }
        }
    };
}

pub(crate) use text_enum;

/// Whether a monitor is in service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    #[default]
    Active,
    Inactive,
}

text_enum!(MonitorStatus, "monitor status" {
    Active => "active",
    Inactive => "inactive",
});

/// Whether readings on a channel are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    #[default]
    Enabled,
    Disabled,
    Paused,
}

text_enum!(ChannelStatus, "channel status" {
    Enabled => "enabled",
    Disabled => "disabled",
    Paused => "paused",
});

/// Measurement system for sensor values and user display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementSystem {
    Imperial,
    #[default]
    Metric,
}

text_enum!(MeasurementSystem, "measurement system" {
    Imperial => "imperial",
    Metric => "metric",
});

/// What happens when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Notify contacts by email and/or text.
    EmailText,
    /// Only flag the alert for dashboards.
    Gui,
    /// Both of the above.
    Both,
}

text_enum!(RuleAction, "rule action" {
    EmailText => "email_text",
    Gui => "gui",
    Both => "both",
});

impl RuleAction {
    /// True if contacts should be messaged for this action.
    pub fn notifies_contacts(&self) -> bool {
        matches!(self, RuleAction::EmailText | RuleAction::Both)
    }
}

/// Lifecycle state of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleState {
    #[default]
    Active,
    Inactive,
    Paused,
}

text_enum!(RuleState, "rule state" {
    Active => "active",
    Inactive => "inactive",
    Paused => "paused",
});

/// Kind of incident an alert records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// A rule matched on a channel.
    Channel,
    /// A monitor-wide condition.
    Monitor,
    /// A monitor stopped reporting.
    MonitorOverdue,
}

text_enum!(AlertType, "alert type" {
    Channel => "channel",
    Monitor => "monitor",
    MonitorOverdue => "monitor_overdue",
});

/// How a contact wants to be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactMethod {
    #[default]
    Email,
    Text,
    Both,
}

text_enum!(ContactMethod, "contact method" {
    Email => "email",
    Text => "text",
    Both => "both",
});

/// A physical monitoring device.
#[derive(Debug, Clone, Serialize)]
pub struct Monitor {
    pub id: Id,
    pub name: String,
    pub location: String,
    pub status: MonitorStatus,
    /// When the monitor last delivered a reading.
    pub last_update: Option<DateTime<Utc>>,
}

/// Request body for creating a monitor.
#[derive(Debug, Clone, Deserialize)]
pub struct NewMonitor {
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub status: MonitorStatus,
}

/// Units and conversions for a kind of sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorType {
    #[serde(default)]
    pub id: Id,
    pub name: String,
    /// System the sensor reports in.
    #[serde(default)]
    pub system: MeasurementSystem,
    pub metric_unit: String,
    pub imperial_unit: String,
    #[serde(default)]
    pub to_imperial: Conversion,
    #[serde(default)]
    pub to_metric: Conversion,
}

impl SensorType {
    /// Convert a native value for display in `target`.
    pub fn convert(&self, value: f64, target: MeasurementSystem) -> f64 {
        match (self.system, target) {
            (MeasurementSystem::Metric, MeasurementSystem::Imperial) => {
                self.to_imperial.apply(value)
            }
            (MeasurementSystem::Imperial, MeasurementSystem::Metric) => self.to_metric.apply(value),
            _ => value,
        }
    }

    /// Unit label for values shown in `system`.
    pub fn unit(&self, system: MeasurementSystem) -> &str {
        match system {
            MeasurementSystem::Metric => &self.metric_unit,
            MeasurementSystem::Imperial => &self.imperial_unit,
        }
    }
}

/// One measured quantity on a monitor.
#[derive(Debug, Clone, Serialize)]
pub struct Channel {
    pub id: Id,
    pub monitor_id: Id,
    pub channel_num: i64,
    pub sensor_type_id: Id,
    pub name: String,
    pub status: ChannelStatus,
    /// Added to every raw value before storage.
    pub calibration_offset: f64,
    /// Most recent valid reading (cached).
    pub last_reading_id: Option<Id>,
    /// Most recently opened alert (cached).
    pub last_alert_id: Option<Id>,
}

/// Request body for creating a channel.
#[derive(Debug, Clone, Deserialize)]
pub struct NewChannel {
    pub monitor_id: Id,
    pub channel_num: i64,
    pub sensor_type_id: Id,
    pub name: String,
    #[serde(default)]
    pub status: ChannelStatus,
    #[serde(default)]
    pub calibration_offset: f64,
}

/// A single timestamped sample.
#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    pub id: Id,
    pub channel_id: Id,
    /// Time reported by the device.
    pub monitor_time: DateTime<Utc>,
    /// Time the server stored the reading.
    pub transaction_time: DateTime<Utc>,
    pub raw_value: f64,
    pub offset: f64,
    /// `raw_value + offset`.
    pub value: f64,
    /// False when the reading was rejected as a spike.
    pub is_valid: bool,
}

/// A reading ready to be stored.
#[derive(Debug, Clone)]
pub struct NewReading {
    pub channel_id: Id,
    pub monitor_time: DateTime<Utc>,
    pub transaction_time: DateTime<Utc>,
    pub raw_value: f64,
    pub offset: f64,
    pub value: f64,
    pub is_valid: bool,
}

/// Request body for POST /readings.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadingSubmission {
    pub channel_id: Id,
    pub monitor_time: DateTime<Utc>,
    pub raw_value: f64,
}

/// A threshold rule attached to channels.
#[derive(Debug, Clone, Serialize)]
pub struct Rule {
    pub id: Id,
    pub name: String,
    pub condition: Condition,
    pub action: RuleAction,
    pub state: RuleState,
    /// When a paused rule is due to resume, if scheduled.
    pub paused_until: Option<DateTime<Utc>>,
    /// Contact ids in notification order.
    pub contacts: Vec<Id>,
}

impl Rule {
    /// Human-readable summary used in notifications.
    pub fn description(&self) -> String {
        format!("{}: {}", self.name, self.condition)
    }
}

/// Request body for creating a rule.
#[derive(Debug, Clone, Deserialize)]
pub struct NewRule {
    pub name: String,
    pub selector: Selector,
    pub lower_threshold: Option<f64>,
    pub upper_threshold: Option<f64>,
    pub action: RuleAction,
    #[serde(default)]
    pub state: RuleState,
    /// Channels the rule applies to.
    #[serde(default)]
    pub channels: Vec<Id>,
    /// Contacts in notification order.
    #[serde(default)]
    pub contacts: Vec<Id>,
}

/// An open or closed incident.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Id,
    pub alert_type: AlertType,
    pub monitor_id: Id,
    pub channel_id: Option<Id>,
    pub reading_id: Option<Id>,
    pub rule_id: Option<Id>,
    pub created_at: DateTime<Utc>,
    pub active: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<Id>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// External token for acknowledgement links. Never serialized.
    #[serde(skip_serializing)]
    pub token: Uuid,
}

impl Alert {
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_by.is_some()
    }
}

/// Per-user notification and display preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Preference {
    #[serde(default)]
    pub contact_method: ContactMethod,
    #[serde(default)]
    pub measurement_system: MeasurementSystem,
}

/// A user who can receive notifications and acknowledge alerts.
#[derive(Debug, Clone, Serialize)]
pub struct Contact {
    pub id: Id,
    pub full_name: String,
    pub email: String,
    pub sms_number: Option<String>,
    /// Email-to-SMS domain of the contact's carrier.
    pub sms_gateway: Option<String>,
    pub is_active: bool,
    pub preference: Preference,
}

/// Request body for creating a contact.
#[derive(Debug, Clone, Deserialize)]
pub struct NewContact {
    pub full_name: String,
    pub email: String,
    pub sms_number: Option<String>,
    pub sms_gateway: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub preference: Preference,
}

fn default_active() -> bool {
    true
}
