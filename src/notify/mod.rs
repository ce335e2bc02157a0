//! Notification dispatch.
//!
//! The [`Dispatcher`] turns an [`AlertEvent`] into one message per contact
//! and delivery channel and hands them to a [`Gateway`]. Sends for one event
//! run concurrently; a failed send is logged and counted but never retried
//! and never affects the other messages or the alert itself.

pub mod sms;
pub mod smtp;
pub mod templates;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::lifecycle::{AlertEvent, AlertEventKind};
use crate::model::{ContactMethod, Id};
use crate::storage::Storage;

pub use templates::{AlertContext, ack_link};

/// Medium a single message is delivered over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryChannel {
    Email,
    Text,
}

impl DeliveryChannel {
    /// Channels selected by a contact's preferred method.
    pub fn for_method(method: ContactMethod) -> &'static [DeliveryChannel] {
        match method {
            ContactMethod::Email => &[DeliveryChannel::Email],
            ContactMethod::Text => &[DeliveryChannel::Text],
            ContactMethod::Both => &[DeliveryChannel::Email, DeliveryChannel::Text],
        }
    }
}

impl fmt::Display for DeliveryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryChannel::Email => f.write_str("email"),
            DeliveryChannel::Text => f.write_str("text"),
        }
    }
}

/// A rendered message addressed to one contact.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub channel: DeliveryChannel,
    pub contact_id: Id,
    pub to_name: String,
    /// Email address for email, phone number for text.
    pub to: String,
    /// Carrier email-to-SMS domain, used when text goes out over SMTP.
    pub sms_gateway: Option<String>,
    pub subject: String,
    pub body: String,
    /// HTML alternative for email.
    pub html: Option<String>,
}

/// Error type for a single message delivery.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("SMTP transport error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("Email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("Email build error: {0}")]
    Build(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SMS API returned HTTP {0}")]
    HttpStatus(u16),

    #[error("Contact has no {0}")]
    MissingAddress(&'static str),

    #[error("No gateway configured for {0} delivery")]
    NotConfigured(DeliveryChannel),
}

/// Delivers a rendered message.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> std::result::Result<(), DeliveryError>;
}

/// Sends each message through the gateway configured for its channel.
#[derive(Clone, Default)]
pub struct RoutingGateway {
    pub email: Option<Arc<dyn Gateway>>,
    pub text: Option<Arc<dyn Gateway>>,
}

#[async_trait]
impl Gateway for RoutingGateway {
    async fn send(&self, message: &OutboundMessage) -> std::result::Result<(), DeliveryError> {
        let gateway = match message.channel {
            DeliveryChannel::Email => self.email.as_ref(),
            DeliveryChannel::Text => self.text.as_ref(),
        };
        match gateway {
            Some(gateway) => gateway.send(message).await,
            None => Err(DeliveryError::NotConfigured(message.channel)),
        }
    }
}

/// Outcome counts for one dispatched event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Builds and sends notifications for alert events.
#[derive(Clone)]
pub struct Dispatcher {
    storage: Storage,
    gateway: Arc<dyn Gateway>,
    public_url: String,
}

impl Dispatcher {
    pub fn new(storage: Storage, gateway: Arc<dyn Gateway>, public_url: impl Into<String>) -> Self {
        Self {
            storage,
            gateway,
            public_url: public_url.into(),
        }
    }

    /// Start a task that dispatches events one at a time, in the order they
    /// are sent. The task ends once the returned sender is dropped and the
    /// backlog is drained.
    pub fn spawn_lane(&self) -> UnboundedSender<AlertEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel::<AlertEvent>();
        let dispatcher = self.clone();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatcher.deliver(event).await;
            }
        });

        tx
    }

    async fn deliver(&self, event: AlertEvent) {
        match self.dispatch(event).await {
            Ok(report) => info!(
                alert_id = event.alert_id,
                kind = ?event.kind,
                sent = report.sent,
                failed = report.failed,
                skipped = report.skipped,
                "Notifications dispatched"
            ),
            Err(e) => warn!(
                alert_id = event.alert_id,
                kind = ?event.kind,
                error = %e,
                "Failed to dispatch notifications"
            ),
        }
    }

    /// Render and send every message for an event, waiting for all sends.
    ///
    /// State is reloaded here, so a nag for an alert acknowledged or resolved
    /// since the event was raised is dropped.
    pub async fn dispatch(&self, event: AlertEvent) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();

        let alert = self.storage.get_alert(event.alert_id).await?;
        if event.kind == AlertEventKind::Nagged && (alert.is_acknowledged() || !alert.active) {
            debug!(alert_id = alert.id, "Alert acknowledged or resolved, dropping nag");
            return Ok(report);
        }

        let (Some(channel_id), Some(rule_id)) = (alert.channel_id, alert.rule_id) else {
            debug!(alert_id = alert.id, "Alert has no channel rule, nothing to send");
            return Ok(report);
        };

        let rule = self.storage.get_rule(rule_id).await?;
        if !rule.action.notifies_contacts() {
            debug!(rule_id, action = %rule.action, "Rule does not notify contacts");
            return Ok(report);
        }

        let channel = self.storage.get_channel(channel_id).await?;
        let monitor = self.storage.get_monitor(channel.monitor_id).await?;
        let sensor = self.storage.get_sensor_type(channel.sensor_type_id).await?;
        let reading = self.storage.get_reading(event.reading_id).await?;
        let contacts = self.storage.contacts_for_rule(rule.id).await?;

        let ctx = AlertContext {
            kind: event.kind,
            monitor: &monitor,
            channel: &channel,
            rule: &rule,
            sensor: &sensor,
            value: reading.value,
            token: alert.token,
            public_url: &self.public_url,
        };

        let mut sends = JoinSet::new();
        for contact in &contacts {
            if !contact.is_active {
                report.skipped += 1;
                continue;
            }

            for &delivery in DeliveryChannel::for_method(contact.preference.contact_method) {
                match templates::render(&ctx, contact, delivery) {
                    Ok(message) => {
                        let gateway = Arc::clone(&self.gateway);
                        sends.spawn(async move {
                            let result = gateway.send(&message).await;
                            (message, result)
                        });
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!(
                            alert_id = alert.id,
                            contact_id = contact.id,
                            channel = %delivery,
                            error = %e,
                            "Failed to build notification"
                        );
                    }
                }
            }
        }

        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((message, Ok(()))) => {
                    report.sent += 1;
                    debug!(
                        alert_id = alert.id,
                        contact_id = message.contact_id,
                        channel = %message.channel,
                        "Notification sent"
                    );
                }
                Ok((message, Err(e))) => {
                    report.failed += 1;
                    warn!(
                        alert_id = alert.id,
                        contact_id = message.contact_id,
                        channel = %message.channel,
                        error = %e,
                        "Notification delivery failed"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(alert_id = alert.id, error = %e, "Notification task failed");
                }
            }
        }

        Ok(report)
    }
}
