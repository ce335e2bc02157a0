//! Reading ingestion.
//!
//! Normalizes a submitted raw value with the channel's calibration offset,
//! rejects spikes against the previous valid reading, stores the reading and
//! hands a job to the evaluation queue. Ingestion never waits on evaluation.
//!
//! Writes happen in a fixed order: reading, channel pointer, monitor
//! timestamp, evaluation job. Only the first is fatal; once the reading is
//! stored, later failures are logged and the reading is kept.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{ChannelStatus, NewReading, Reading, ReadingSubmission};
use crate::storage::Storage;
use crate::worker::{EvaluationJob, EvaluationQueue, KeyedLocks};

/// Maximum relative change from the previous valid reading before a new
/// reading is rejected as a spike.
pub const SPIKE_THRESHOLD: f64 = 0.35;

/// True if `value` deviates from `previous` by more than [`SPIKE_THRESHOLD`].
///
/// A previous value of zero gives no relative baseline, so nothing counts
/// as a spike against it.
pub fn is_spike(previous: f64, value: f64) -> bool {
    if previous == 0.0 {
        return false;
    }
    ((value - previous) / previous).abs() > SPIKE_THRESHOLD
}

/// Accepts readings and queues them for evaluation.
#[derive(Clone)]
pub struct Ingestor {
    storage: Storage,
    queue: EvaluationQueue,
    locks: KeyedLocks,
}

impl Ingestor {
    pub fn new(storage: Storage, queue: EvaluationQueue) -> Self {
        Self {
            storage,
            queue,
            locks: KeyedLocks::default(),
        }
    }

    /// Store a submitted reading and enqueue it for rule evaluation.
    ///
    /// Readings on the same channel are serialized so that spike detection
    /// always compares against the reading stored just before, and jobs
    /// reach the queue in arrival order.
    pub async fn ingest(&self, submission: &ReadingSubmission) -> Result<Reading> {
        if !submission.raw_value.is_finite() {
            return Err(Error::invalid_value("raw_value", submission.raw_value));
        }

        let channel = self.storage.get_channel(submission.channel_id).await?;
        let _guard = self.locks.lock(channel.id).await;

        let value = submission.raw_value + channel.calibration_offset;
        let previous = self.storage.last_valid_reading(channel.id).await?;
        let is_valid = previous
            .as_ref()
            .is_none_or(|prev| !is_spike(prev.value, value));

        let now = Utc::now();
        let reading = self
            .storage
            .insert_reading(&NewReading {
                channel_id: channel.id,
                monitor_time: submission.monitor_time,
                transaction_time: now,
                raw_value: submission.raw_value,
                offset: channel.calibration_offset,
                value,
                is_valid,
            })
            .await?;

        if let Err(e) = self.storage.update_last_reading(channel.id, reading.id).await {
            warn!(
                channel_id = channel.id,
                reading_id = reading.id,
                error = %e,
                "Failed to update channel last reading"
            );
        }
        if !is_valid {
            info!(
                channel_id = channel.id,
                reading_id = reading.id,
                value,
                previous = previous.as_ref().map(|p| p.value),
                "Reading rejected as spike"
            );
        }

        if let Err(e) = self.storage.touch_monitor(channel.monitor_id, now).await {
            warn!(
                monitor_id = channel.monitor_id,
                error = %e,
                "Failed to update monitor last update time"
            );
        }

        if !is_valid {
            return Ok(reading);
        }
        if channel.status != ChannelStatus::Enabled {
            debug!(
                channel_id = channel.id,
                status = %channel.status,
                "Channel not enabled, skipping evaluation"
            );
            return Ok(reading);
        }

        let job = EvaluationJob {
            channel_id: channel.id,
            reading_id: reading.id,
        };
        if let Err(e) = self.queue.enqueue(job) {
            warn!(
                channel_id = channel.id,
                reading_id = reading.id,
                error = %e,
                "Failed to enqueue reading for evaluation"
            );
        }

        Ok(reading)
    }
}
