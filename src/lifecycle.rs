//! Alert lifecycle management.
//!
//! Turns one rule verdict for one reading into alert state changes and the
//! notification events they produce. Per (channel, rule) pair:
//!
//! | verdict  | active alert          | result                         |
//! |----------|-----------------------|--------------------------------|
//! | match    | none                  | open alert, `Opened` event     |
//! | match    | open, unacknowledged  | `Nagged` event                 |
//! | match    | open, acknowledged    | nothing                        |
//! | no match | open                  | resolve alert, `Resolved` event|
//! | no match | none                  | nothing                        |
//! | skipped  | any                   | nothing                        |
//!
//! Callers must serialize calls for the same channel; the evaluation worker
//! does this by running one lane per channel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::model::{Channel, Id, Reading, Rule};
use crate::rules::Verdict;
use crate::storage::Storage;

/// What happened to an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertEventKind {
    Opened,
    Nagged,
    Resolved,
}

/// A notification-worthy alert transition.
///
/// Carries ids only; the dispatcher loads current state when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AlertEvent {
    pub alert_id: Id,
    pub kind: AlertEventKind,
    /// Reading whose value is reported in the notification.
    pub reading_id: Id,
}

/// Apply a rule verdict for a reading to the channel's alert state.
pub async fn apply_verdict(
    storage: &Storage,
    channel: &Channel,
    reading: &Reading,
    rule: &Rule,
    verdict: Verdict,
    now: DateTime<Utc>,
) -> Result<Vec<AlertEvent>> {
    let matched = match verdict {
        Verdict::Match => true,
        Verdict::NoMatch => false,
        Verdict::Skipped(reason) => {
            debug!(channel_id = channel.id, rule_id = rule.id, ?reason, "Rule skipped");
            return Ok(Vec::new());
        }
    };

    let active = storage.active_alerts_for(channel.id, rule.id).await?;

    if active.len() > 1 {
        error!(
            channel_id = channel.id,
            rule_id = rule.id,
            count = active.len(),
            "Multiple active alerts for one channel and rule"
        );
    }

    if active.is_empty() {
        if !matched {
            return Ok(Vec::new());
        }

        return match storage
            .open_channel_alert(channel, rule.id, reading.id, now)
            .await?
        {
            Some(alert) => {
                info!(
                    alert_id = alert.id,
                    channel_id = channel.id,
                    rule_id = rule.id,
                    value = reading.value,
                    "Alert opened"
                );
                Ok(vec![AlertEvent {
                    alert_id: alert.id,
                    kind: AlertEventKind::Opened,
                    reading_id: reading.id,
                }])
            }
            None => {
                warn!(
                    channel_id = channel.id,
                    rule_id = rule.id,
                    "Active alert already exists, not opening another"
                );
                Ok(Vec::new())
            }
        };
    }

    let mut events = Vec::new();
    for alert in active {
        if matched {
            if alert.is_acknowledged() {
                debug!(alert_id = alert.id, "Alert acknowledged, not nagging");
                continue;
            }
            debug!(alert_id = alert.id, value = reading.value, "Alert still matching, nagging");
            events.push(AlertEvent {
                alert_id: alert.id,
                kind: AlertEventKind::Nagged,
                reading_id: reading.id,
            });
        } else if storage.resolve_alert(alert.id, now).await? {
            info!(
                alert_id = alert.id,
                channel_id = channel.id,
                rule_id = rule.id,
                value = reading.value,
                "Alert resolved"
            );
            events.push(AlertEvent {
                alert_id: alert.id,
                kind: AlertEventKind::Resolved,
                reading_id: reading.id,
            });
        }
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ChannelStatus, MeasurementSystem, NewChannel, NewMonitor, NewReading, NewRule, RuleAction,
        RuleState, SensorType,
    };
    use crate::rules::{SkipReason, Selector, evaluate};

    struct Fixture {
        storage: Storage,
        channel: Channel,
        rule: Rule,
    }

    async fn fixture() -> Fixture {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let monitor = storage
            .create_monitor(&NewMonitor {
                name: "Freezer".to_string(),
                location: "Lab 2".to_string(),
                status: Default::default(),
            })
            .await
            .unwrap();
        let sensor = storage
            .create_sensor_type(&SensorType {
                id: 0,
                name: "temperature".to_string(),
                system: MeasurementSystem::Metric,
                metric_unit: "°C".to_string(),
                imperial_unit: "°F".to_string(),
                to_imperial: Default::default(),
                to_metric: Default::default(),
            })
            .await
            .unwrap();
        let channel = storage
            .create_channel(&NewChannel {
                monitor_id: monitor.id,
                channel_num: 1,
                sensor_type_id: sensor.id,
                name: "Cabinet".to_string(),
                status: ChannelStatus::Enabled,
                calibration_offset: 0.0,
            })
            .await
            .unwrap();
        let rule = storage
            .create_rule(&NewRule {
                name: "too warm".to_string(),
                selector: Selector::GreaterThan,
                lower_threshold: None,
                upper_threshold: Some(-15.0),
                action: RuleAction::EmailText,
                state: RuleState::Active,
                channels: vec![channel.id],
                contacts: vec![],
            })
            .await
            .unwrap();

        Fixture {
            storage,
            channel,
            rule,
        }
    }

    impl Fixture {
        async fn feed(&self, value: f64) -> Vec<AlertEvent> {
            let now = Utc::now();
            let reading = self
                .storage
                .insert_reading(&NewReading {
                    channel_id: self.channel.id,
                    monitor_time: now,
                    transaction_time: now,
                    raw_value: value,
                    offset: 0.0,
                    value,
                    is_valid: true,
                })
                .await
                .unwrap();
            let rule = self.storage.get_rule(self.rule.id).await.unwrap();
            let verdict = evaluate(&rule, reading.value);
            apply_verdict(&self.storage, &self.channel, &reading, &rule, verdict, now)
                .await
                .unwrap()
        }

        async fn active_count(&self) -> usize {
            self.storage
                .active_alerts_for(self.channel.id, self.rule.id)
                .await
                .unwrap()
                .len()
        }
    }

    fn kinds(events: &[AlertEvent]) -> Vec<AlertEventKind> {
        events.iter().map(|e| e.kind).collect()
    }

    #[tokio::test]
    async fn test_open_nag_resolve_sequence() {
        let f = fixture().await;

        let opened = f.feed(-10.0).await;
        assert_eq!(kinds(&opened), vec![AlertEventKind::Opened]);
        assert_eq!(f.active_count().await, 1);

        let nagged = f.feed(-9.0).await;
        assert_eq!(kinds(&nagged), vec![AlertEventKind::Nagged]);
        assert_eq!(nagged[0].alert_id, opened[0].alert_id);
        assert_eq!(f.active_count().await, 1);

        let resolved = f.feed(-18.0).await;
        assert_eq!(kinds(&resolved), vec![AlertEventKind::Resolved]);
        assert_eq!(f.active_count().await, 0);

        let alert = f.storage.get_alert(opened[0].alert_id).await.unwrap();
        assert!(!alert.active);
        assert!(alert.resolved_at.is_some());

        // Nothing open, nothing matching
        assert!(f.feed(-18.5).await.is_empty());
    }

    #[tokio::test]
    async fn test_opened_alert_updates_channel_pointer() {
        let f = fixture().await;

        let opened = f.feed(-10.0).await;

        let channel = f.storage.get_channel(f.channel.id).await.unwrap();
        assert_eq!(channel.last_alert_id, Some(opened[0].alert_id));
    }

    #[tokio::test]
    async fn test_acknowledged_alert_is_not_nagged() {
        let f = fixture().await;
        let opened = f.feed(-10.0).await;
        let alert = f.storage.get_alert(opened[0].alert_id).await.unwrap();

        let contact = f
            .storage
            .create_contact(&crate::model::NewContact {
                full_name: "Sam Okafor".to_string(),
                email: "sam@example.com".to_string(),
                sms_number: None,
                sms_gateway: None,
                is_active: true,
                preference: Default::default(),
            })
            .await
            .unwrap();
        f.storage
            .acknowledge_alert(alert.token, contact.id, Utc::now())
            .await
            .unwrap();

        assert!(f.feed(-9.0).await.is_empty());
        assert_eq!(f.active_count().await, 1);

        // Acknowledged alerts still resolve
        assert_eq!(kinds(&f.feed(-20.0).await), vec![AlertEventKind::Resolved]);
    }

    #[tokio::test]
    async fn test_paused_rule_neither_opens_nor_resolves() {
        let f = fixture().await;
        f.feed(-10.0).await;

        f.storage
            .set_rule_state(f.rule.id, RuleState::Paused, None)
            .await
            .unwrap();

        assert!(f.feed(-20.0).await.is_empty());
        assert_eq!(f.active_count().await, 1);

        f.storage
            .set_rule_state(f.rule.id, RuleState::Active, None)
            .await
            .unwrap();

        assert_eq!(kinds(&f.feed(-20.0).await), vec![AlertEventKind::Resolved]);
        assert_eq!(f.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_skipped_verdict_is_noop_even_when_matching() {
        let f = fixture().await;
        let now = Utc::now();
        let reading = f
            .storage
            .insert_reading(&NewReading {
                channel_id: f.channel.id,
                monitor_time: now,
                transaction_time: now,
                raw_value: 5.0,
                offset: 0.0,
                value: 5.0,
                is_valid: true,
            })
            .await
            .unwrap();

        let events = apply_verdict(
            &f.storage,
            &f.channel,
            &reading,
            &f.rule,
            Verdict::Skipped(SkipReason::Inactive),
            now,
        )
        .await
        .unwrap();

        assert!(events.is_empty());
        assert_eq!(f.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_repeated_matches_never_exceed_one_active_alert() {
        let f = fixture().await;

        for value in [-10.0, -9.5, -9.0, -8.7, -8.5] {
            f.feed(value).await;
            assert!(f.active_count().await <= 1);
        }
        assert_eq!(f.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_active_alerts_are_each_processed() {
        let f = fixture().await;
        let opened = f.feed(-10.0).await;
        let first = opened[0].alert_id;
        let reading_id = opened[0].reading_id;
        let second = f
            .storage
            .insert_duplicate_active_alert(&f.channel, f.rule.id, reading_id, Utc::now())
            .await
            .unwrap()
            .id;
        assert_eq!(f.active_count().await, 2);

        let nagged = f.feed(-9.0).await;
        assert_eq!(
            kinds(&nagged),
            vec![AlertEventKind::Nagged, AlertEventKind::Nagged]
        );
        let mut ids: Vec<Id> = nagged.iter().map(|e| e.alert_id).collect();
        ids.sort();
        assert_eq!(ids, vec![first, second]);

        let resolved = f.feed(-18.0).await;
        assert_eq!(
            kinds(&resolved),
            vec![AlertEventKind::Resolved, AlertEventKind::Resolved]
        );
        assert_eq!(f.active_count().await, 0);
        for id in [first, second] {
            let alert = f.storage.get_alert(id).await.unwrap();
            assert!(!alert.active);
            assert!(alert.resolved_at.is_some());
        }
    }
}
