//! Alert acknowledgement.
//!
//! Contacts acknowledge an alert through the link in its notification, which
//! carries the alert's token and the contact's id. The first acknowledgement
//! wins; later or concurrent attempts get the recorded acknowledger back
//! without changing anything.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Alert, Id};
use crate::storage::Storage;

/// Read-only view of an alert's acknowledgement state.
#[derive(Debug, Clone, Serialize)]
pub struct AckStatus {
    pub alert_id: Id,
    pub active: bool,
    pub acknowledged_by: Option<Id>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl From<&Alert> for AckStatus {
    fn from(alert: &Alert) -> Self {
        Self {
            alert_id: alert.id,
            active: alert.active,
            acknowledged_by: alert.acknowledged_by,
            acknowledged_at: alert.acknowledged_at,
        }
    }
}

/// Result of an acknowledgement attempt.
#[derive(Debug, Clone, Serialize)]
pub struct Acknowledgement {
    pub alert_id: Id,
    pub acknowledged_by: Id,
    pub acknowledged_at: DateTime<Utc>,
    /// False if the alert had already been acknowledged.
    pub newly_acknowledged: bool,
}

/// Look up the acknowledgement state for a token.
pub async fn status(storage: &Storage, token: Uuid) -> Result<AckStatus> {
    let alert = storage.get_alert_by_token(token).await?;
    Ok(AckStatus::from(&alert))
}

/// Acknowledge the alert identified by `token` on behalf of `contact_id`.
///
/// Unknown tokens and unknown contacts are not-found errors. Resolved alerts
/// can still be acknowledged.
pub async fn acknowledge(
    storage: &Storage,
    token: Uuid,
    contact_id: Id,
    now: DateTime<Utc>,
) -> Result<Acknowledgement> {
    let alert = storage.get_alert_by_token(token).await?;
    storage.get_contact(contact_id).await?;

    let newly_acknowledged = if alert.is_acknowledged() {
        false
    } else {
        storage.acknowledge_alert(token, contact_id, now).await?
    };

    // Re-read so a losing racer reports the winner
    let alert = storage.get_alert_by_token(token).await?;
    let (Some(acknowledged_by), Some(acknowledged_at)) =
        (alert.acknowledged_by, alert.acknowledged_at)
    else {
        return Err(Error::invalid_value(
            "acknowledgement",
            format!("alert {} has no acknowledger after update", alert.id),
        ));
    };

    if newly_acknowledged {
        info!(alert_id = alert.id, contact_id, "Alert acknowledged");
    } else {
        info!(
            alert_id = alert.id,
            contact_id,
            acknowledged_by,
            "Alert already acknowledged"
        );
    }

    Ok(Acknowledgement {
        alert_id: alert.id,
        acknowledged_by,
        acknowledged_at,
        newly_acknowledged,
    })
}
