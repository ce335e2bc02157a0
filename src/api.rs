//! HTTP API handlers for Vigil.
//!
//! Handlers translate between JSON and the core modules and map [`Error`]
//! variants to status codes: missing entities are `404`, rejected input is
//! `422`, uniqueness conflicts are `409` and everything else is `500`.
//!
//! Reading submission returns `202 Accepted` as soon as the reading is
//! stored; rule evaluation happens in the background.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::ack::{self, AckStatus, Acknowledgement};
use crate::error::Error;
use crate::ingest::Ingestor;
use crate::model::{
    Alert, Channel, Contact, Id, MeasurementSystem, Monitor, NewChannel, NewContact, NewMonitor,
    NewRule, Reading, ReadingSubmission, Rule, RuleState, SensorType,
};
use crate::storage::Storage;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub ingestor: Ingestor,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/readings", post(post_reading).get(get_readings))
        .route("/monitors", get(list_monitors).post(create_monitor))
        .route("/channels", get(list_channels).post(create_channel))
        .route("/sensor-types", post(create_sensor_type))
        .route("/contacts", post(create_contact))
        .route("/rules", post(create_rule))
        .route("/rules/:id/pause", post(pause_rule))
        .route("/rules/:id/resume", post(resume_rule))
        .route("/alerts/active", get(list_active_alerts))
        .route("/ack", get(get_ack).post(post_ack))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Status code reported for a core error.
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::InvalidRule(_) | Error::InvalidValue { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Database(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            StatusCode::CONFLICT
        }
        Error::QueueClosed | Error::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

// ============================================================================
// Readings
// ============================================================================

/// POST /readings - Submit a raw reading for a channel.
///
/// # Request Body
///
/// ```json
/// {
///     "channel_id": 1,
///     "monitor_time": "2024-06-01T12:00:00Z",
///     "raw_value": 4.2
/// }
/// ```
///
/// # Response
///
/// Returns `202 Accepted` with the stored reading. Spikes are stored with
/// `is_valid: false` and are never evaluated.
#[instrument(skip(state, submission), fields(channel_id = submission.channel_id))]
pub async fn post_reading(
    State(state): State<AppState>,
    Json(submission): Json<ReadingSubmission>,
) -> Result<(StatusCode, Json<Reading>), StatusCode> {
    match state.ingestor.ingest(&submission).await {
        Ok(reading) => {
            info!(
                reading_id = reading.id,
                value = reading.value,
                is_valid = reading.is_valid,
                "Reading accepted"
            );
            Ok((StatusCode::ACCEPTED, Json(reading)))
        }
        Err(e) => {
            warn!(error = %e, "Failed to ingest reading");
            Err(status_for(&e))
        }
    }
}

/// Query parameters for the readings endpoint.
#[derive(Debug, Deserialize)]
pub struct ReadingsQuery {
    pub channel_id: Id,
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Display system; defaults to the sensor's native system.
    pub system: Option<MeasurementSystem>,
    #[serde(default)]
    pub include_invalid: bool,
}

/// A reading converted for display.
#[derive(Debug, Serialize)]
pub struct ReadingView {
    pub id: Id,
    pub monitor_time: DateTime<Utc>,
    pub transaction_time: DateTime<Utc>,
    pub value: f64,
    pub is_valid: bool,
}

/// Response for GET /readings.
#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    pub channel_id: Id,
    pub system: MeasurementSystem,
    pub unit: String,
    pub readings: Vec<ReadingView>,
}

/// GET /readings - Readings for a channel, converted to the requested system.
///
/// # Query Parameters
///
/// - `channel_id` (required)
/// - `from`, `until` (optional): inclusive bounds on device time
/// - `system` (optional): `metric` or `imperial`
/// - `include_invalid` (optional): also return spike-rejected readings
#[instrument(skip(state))]
pub async fn get_readings(
    State(state): State<AppState>,
    Query(query): Query<ReadingsQuery>,
) -> Result<Json<ReadingsResponse>, StatusCode> {
    let load = async {
        let channel = state.storage.get_channel(query.channel_id).await?;
        let sensor = state.storage.get_sensor_type(channel.sensor_type_id).await?;
        let readings = state
            .storage
            .readings_for_channel(channel.id, query.from, query.until, query.include_invalid)
            .await?;
        Ok::<_, Error>((sensor, readings))
    };

    match load.await {
        Ok((sensor, readings)) => {
            let system = query.system.unwrap_or(sensor.system);
            let readings: Vec<ReadingView> = readings
                .into_iter()
                .map(|r| ReadingView {
                    id: r.id,
                    monitor_time: r.monitor_time,
                    transaction_time: r.transaction_time,
                    value: sensor.convert(r.value, system),
                    is_valid: r.is_valid,
                })
                .collect();
            info!(count = readings.len(), %system, "Readings queried");
            Ok(Json(ReadingsResponse {
                channel_id: query.channel_id,
                system,
                unit: sensor.unit(system).to_string(),
                readings,
            }))
        }
        Err(e) => {
            warn!(error = %e, "Failed to query readings");
            Err(status_for(&e))
        }
    }
}

// ============================================================================
// Configuration entities
// ============================================================================

/// GET /monitors - List all monitors.
#[instrument(skip(state))]
pub async fn list_monitors(
    State(state): State<AppState>,
) -> Result<Json<Vec<Monitor>>, StatusCode> {
    state.storage.list_monitors().await.map(Json).map_err(|e| {
        warn!(error = %e, "Failed to list monitors");
        status_for(&e)
    })
}

/// POST /monitors - Create a monitor.
#[instrument(skip(state, monitor))]
pub async fn create_monitor(
    State(state): State<AppState>,
    Json(monitor): Json<NewMonitor>,
) -> Result<(StatusCode, Json<Monitor>), StatusCode> {
    match state.storage.create_monitor(&monitor).await {
        Ok(monitor) => {
            info!(monitor_id = monitor.id, name = %monitor.name, "Monitor created");
            Ok((StatusCode::CREATED, Json(monitor)))
        }
        Err(e) => {
            warn!(error = %e, "Failed to create monitor");
            Err(status_for(&e))
        }
    }
}

/// Query parameters for the channels endpoint.
#[derive(Debug, Deserialize)]
pub struct ChannelsQuery {
    pub monitor_id: Option<Id>,
}

/// GET /channels - List channels, optionally for one monitor.
#[instrument(skip(state))]
pub async fn list_channels(
    State(state): State<AppState>,
    Query(query): Query<ChannelsQuery>,
) -> Result<Json<Vec<Channel>>, StatusCode> {
    state
        .storage
        .list_channels(query.monitor_id)
        .await
        .map(Json)
        .map_err(|e| {
            warn!(error = %e, "Failed to list channels");
            status_for(&e)
        })
}

/// POST /channels - Create a channel on a monitor.
#[instrument(skip(state, channel))]
pub async fn create_channel(
    State(state): State<AppState>,
    Json(channel): Json<NewChannel>,
) -> Result<(StatusCode, Json<Channel>), StatusCode> {
    match state.storage.create_channel(&channel).await {
        Ok(channel) => {
            info!(
                channel_id = channel.id,
                monitor_id = channel.monitor_id,
                channel_num = channel.channel_num,
                "Channel created"
            );
            Ok((StatusCode::CREATED, Json(channel)))
        }
        Err(e) => {
            warn!(monitor_id = channel.monitor_id, error = %e, "Failed to create channel");
            Err(status_for(&e))
        }
    }
}

/// POST /sensor-types - Create a sensor type.
#[instrument(skip(state, sensor_type))]
pub async fn create_sensor_type(
    State(state): State<AppState>,
    Json(sensor_type): Json<SensorType>,
) -> Result<(StatusCode, Json<SensorType>), StatusCode> {
    match state.storage.create_sensor_type(&sensor_type).await {
        Ok(sensor_type) => {
            info!(sensor_type_id = sensor_type.id, name = %sensor_type.name, "Sensor type created");
            Ok((StatusCode::CREATED, Json(sensor_type)))
        }
        Err(e) => {
            warn!(error = %e, "Failed to create sensor type");
            Err(status_for(&e))
        }
    }
}

/// POST /contacts - Create a contact with notification preferences.
#[instrument(skip(state, contact))]
pub async fn create_contact(
    State(state): State<AppState>,
    Json(contact): Json<NewContact>,
) -> Result<(StatusCode, Json<Contact>), StatusCode> {
    match state.storage.create_contact(&contact).await {
        Ok(contact) => {
            info!(contact_id = contact.id, "Contact created");
            Ok((StatusCode::CREATED, Json(contact)))
        }
        Err(e) => {
            warn!(error = %e, "Failed to create contact");
            Err(status_for(&e))
        }
    }
}

/// POST /rules - Create a rule attached to channels and contacts.
///
/// # Request Body
///
/// ```json
/// {
///     "name": "freezer too warm",
///     "selector": "greater_than",
///     "upper_threshold": -15.0,
///     "action": "email_text",
///     "channels": [1],
///     "contacts": [2, 3]
/// }
/// ```
///
/// Malformed thresholds are rejected with `422`.
#[instrument(skip(state, rule), fields(name = %rule.name))]
pub async fn create_rule(
    State(state): State<AppState>,
    Json(rule): Json<NewRule>,
) -> Result<(StatusCode, Json<Rule>), StatusCode> {
    match state.storage.create_rule(&rule).await {
        Ok(rule) => {
            info!(rule_id = rule.id, condition = %rule.condition, "Rule created");
            Ok((StatusCode::CREATED, Json(rule)))
        }
        Err(e) => {
            warn!(error = %e, "Failed to create rule");
            Err(status_for(&e))
        }
    }
}

/// Query parameters for pausing a rule.
#[derive(Debug, Deserialize)]
pub struct PauseQuery {
    /// When the rule should resume; paused indefinitely if absent.
    pub until: Option<DateTime<Utc>>,
}

/// POST /rules/:id/pause - Pause a rule, optionally until a given time.
#[instrument(skip(state))]
pub async fn pause_rule(
    State(state): State<AppState>,
    Path(id): Path<Id>,
    Query(query): Query<PauseQuery>,
) -> Result<Json<Rule>, StatusCode> {
    match state
        .storage
        .set_rule_state(id, RuleState::Paused, query.until)
        .await
    {
        Ok(rule) => {
            info!(rule_id = id, until = ?query.until, "Rule paused");
            Ok(Json(rule))
        }
        Err(e) => {
            warn!(rule_id = id, error = %e, "Failed to pause rule");
            Err(status_for(&e))
        }
    }
}

/// POST /rules/:id/resume - Reactivate a rule.
#[instrument(skip(state))]
pub async fn resume_rule(
    State(state): State<AppState>,
    Path(id): Path<Id>,
) -> Result<Json<Rule>, StatusCode> {
    match state.storage.set_rule_state(id, RuleState::Active, None).await {
        Ok(rule) => {
            info!(rule_id = id, "Rule resumed");
            Ok(Json(rule))
        }
        Err(e) => {
            warn!(rule_id = id, error = %e, "Failed to resume rule");
            Err(status_for(&e))
        }
    }
}

// ============================================================================
// Alerts and acknowledgement
// ============================================================================

/// GET /alerts/active - All currently active alerts, newest first.
#[instrument(skip(state))]
pub async fn list_active_alerts(
    State(state): State<AppState>,
) -> Result<Json<Vec<Alert>>, StatusCode> {
    match state.storage.list_active_alerts().await {
        Ok(alerts) => {
            info!(alert_count = alerts.len(), "Active alerts queried");
            Ok(Json(alerts))
        }
        Err(e) => {
            warn!(error = %e, "Failed to list active alerts");
            Err(status_for(&e))
        }
    }
}

/// Query parameters carried by acknowledgement links.
#[derive(Debug, Deserialize)]
pub struct AckQuery {
    /// Alert token.
    pub aid: String,
    /// Acknowledging contact id.
    pub bid: Id,
}

impl AckQuery {
    /// Tokens that do not parse cannot match any alert.
    fn token(&self) -> Result<Uuid, StatusCode> {
        Uuid::parse_str(&self.aid).map_err(|_| {
            warn!("Malformed acknowledgement token");
            StatusCode::NOT_FOUND
        })
    }
}

/// GET /ack - Show whether an alert has been acknowledged. Never mutates.
#[instrument(skip(state, query), fields(bid = query.bid))]
pub async fn get_ack(
    State(state): State<AppState>,
    Query(query): Query<AckQuery>,
) -> Result<Json<AckStatus>, StatusCode> {
    let token = query.token()?;

    ack::status(&state.storage, token).await.map(Json).map_err(|e| {
        warn!(error = %e, "Failed to look up acknowledgement");
        status_for(&e)
    })
}

/// POST /ack - Acknowledge an alert.
///
/// Returns the acknowledger and time. If the alert was already acknowledged
/// the existing acknowledgement is returned with `newly_acknowledged: false`.
#[instrument(skip(state, query), fields(bid = query.bid))]
pub async fn post_ack(
    State(state): State<AppState>,
    Query(query): Query<AckQuery>,
) -> Result<Json<Acknowledgement>, StatusCode> {
    let token = query.token()?;

    match ack::acknowledge(&state.storage, token, query.bid, Utc::now()).await {
        Ok(ack) => Ok(Json(ack)),
        Err(e) => {
            warn!(error = %e, "Failed to acknowledge alert");
            Err(status_for(&e))
        }
    }
}
