//! Background evaluation.
//!
//! Ingestion pushes an [`EvaluationJob`] per stored reading onto an unbounded
//! queue. The [`Evaluator`] drains it and routes each job into a lane, one
//! spawned task per channel, so readings of a channel are evaluated one at a
//! time in arrival order while different channels proceed in parallel. Each
//! lane feeds its own notification lane, so an alert's messages go out in the
//! order its transitions happened.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::lifecycle::{self, AlertEvent};
use crate::model::{ChannelStatus, Id};
use crate::notify::Dispatcher;
use crate::rules::evaluate_all;
use crate::storage::Storage;

/// A stored reading waiting for rule evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluationJob {
    pub channel_id: Id,
    pub reading_id: Id,
}

/// Sending half of the evaluation queue.
#[derive(Clone)]
pub struct EvaluationQueue {
    tx: UnboundedSender<EvaluationJob>,
}

impl EvaluationQueue {
    /// Create a queue and the receiver the evaluator drains.
    pub fn new() -> (Self, UnboundedReceiver<EvaluationJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueue a job without waiting. Fails only if the receiver is gone.
    pub fn enqueue(&self, job: EvaluationJob) -> Result<()> {
        self.tx.send(job).map_err(|_| Error::QueueClosed)
    }
}

/// One async mutex per key, created on first use.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<Mutex<HashMap<Id, Arc<AsyncMutex<()>>>>>,
}

impl KeyedLocks {
    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: Id) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key).or_default())
        };
        lock.lock_owned().await
    }
}

/// Evaluates queued readings and dispatches the resulting notifications.
pub struct Evaluator {
    storage: Storage,
    dispatcher: Dispatcher,
}

impl Evaluator {
    pub fn new(storage: Storage, dispatcher: Dispatcher) -> Self {
        Self {
            storage,
            dispatcher,
        }
    }

    /// Evaluate every rule on the job's channel and apply the verdicts.
    ///
    /// A failure on one rule is logged and does not stop the others.
    pub async fn process(&self, job: EvaluationJob) -> Result<Vec<AlertEvent>> {
        let channel = self.storage.get_channel(job.channel_id).await?;
        let reading = self.storage.get_reading(job.reading_id).await?;

        if reading.channel_id != channel.id {
            return Err(Error::invalid_value(
                "evaluation job",
                format!("reading {} is not on channel {}", reading.id, channel.id),
            ));
        }
        if !reading.is_valid {
            debug!(reading_id = reading.id, "Skipping invalid reading");
            return Ok(Vec::new());
        }
        if channel.status != ChannelStatus::Enabled {
            debug!(channel_id = channel.id, status = %channel.status, "Skipping channel");
            return Ok(Vec::new());
        }

        let rules = self.storage.rules_for_channel(channel.id).await?;
        let now = Utc::now();
        let mut events = Vec::new();

        for (rule, verdict) in evaluate_all(&rules, reading.value) {
            match lifecycle::apply_verdict(&self.storage, &channel, &reading, rule, verdict, now)
                .await
            {
                Ok(mut applied) => events.append(&mut applied),
                Err(e) => warn!(
                    channel_id = channel.id,
                    rule_id = rule.id,
                    reading_id = reading.id,
                    error = %e,
                    "Failed to apply rule verdict"
                ),
            }
        }

        Ok(events)
    }

    /// Process a job and hand its events to the channel's notification lane.
    async fn handle(&self, job: EvaluationJob, notices: &UnboundedSender<AlertEvent>) {
        match self.process(job).await {
            Ok(events) => {
                for event in events {
                    if notices.send(event).is_err() {
                        warn!(alert_id = event.alert_id, "Notification lane closed, dropping event");
                    }
                }
            }
            Err(e) => warn!(
                channel_id = job.channel_id,
                reading_id = job.reading_id,
                error = %e,
                "Dropping evaluation job"
            ),
        }
    }

    /// Drain the queue until every sender is dropped.
    pub async fn run(self: Arc<Self>, mut rx: UnboundedReceiver<EvaluationJob>) {
        let mut lanes: HashMap<Id, UnboundedSender<EvaluationJob>> = HashMap::new();

        while let Some(job) = rx.recv().await {
            let lane = lanes
                .entry(job.channel_id)
                .or_insert_with(|| self.spawn_lane(job.channel_id));

            if let Err(mpsc::error::SendError(job)) = lane.send(job) {
                warn!(channel_id = job.channel_id, "Evaluation lane stopped, restarting");
                let lane = self.spawn_lane(job.channel_id);
                if lane.send(job).is_err() {
                    warn!(channel_id = job.channel_id, "Dropping evaluation job");
                }
                lanes.insert(job.channel_id, lane);
            }
        }

        info!("Evaluation queue closed");
    }

    fn spawn_lane(self: &Arc<Self>, channel_id: Id) -> UnboundedSender<EvaluationJob> {
        let (tx, mut rx) = mpsc::unbounded_channel::<EvaluationJob>();
        let evaluator = Arc::clone(self);

        // Events of one channel are delivered in the order they were raised
        let notices = self.dispatcher.spawn_lane();

        tokio::spawn(async move {
            debug!(channel_id, "Evaluation lane started");
            while let Some(job) = rx.recv().await {
                evaluator.handle(job, &notices).await;
            }
        });

        tx
    }
}

/// Periodically reactivate paused rules whose pause has expired.
pub fn spawn_rule_resumer(storage: Storage, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match storage.resume_due_rules(Utc::now()).await {
                Ok(resumed) => {
                    for rule_id in resumed {
                        info!(rule_id, "Paused rule resumed");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to resume paused rules"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::AlertEventKind;
    use crate::model::{
        MeasurementSystem, NewChannel, NewMonitor, NewReading, NewRule, RuleAction, RuleState,
        SensorType,
    };
    use crate::notify::RoutingGateway;
    use crate::rules::Selector;

    async fn setup(status: ChannelStatus) -> (Storage, Evaluator, Id, Id) {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let monitor = storage
            .create_monitor(&NewMonitor {
                name: "Pump house".to_string(),
                location: String::new(),
                status: Default::default(),
            })
            .await
            .unwrap();
        let sensor = storage
            .create_sensor_type(&SensorType {
                id: 0,
                name: "pressure".to_string(),
                system: MeasurementSystem::Metric,
                metric_unit: "kPa".to_string(),
                imperial_unit: "psi".to_string(),
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
                name: "Line pressure".to_string(),
                status,
                calibration_offset: 0.0,
            })
            .await
            .unwrap();
        let rule = storage
            .create_rule(&NewRule {
                name: "low pressure".to_string(),
                selector: Selector::LessThan,
                lower_threshold: Some(10.0),
                upper_threshold: None,
                action: RuleAction::Gui,
                state: RuleState::Active,
                channels: vec![channel.id],
                contacts: vec![],
            })
            .await
            .unwrap();

        let dispatcher = Dispatcher::new(
            storage.clone(),
            Arc::new(RoutingGateway::default()),
            "http://localhost:3000",
        );
        let evaluator = Evaluator::new(storage.clone(), dispatcher);
        (storage, evaluator, channel.id, rule.id)
    }

    async fn store(storage: &Storage, channel_id: Id, value: f64, is_valid: bool) -> EvaluationJob {
        let now = Utc::now();
        let reading = storage
            .insert_reading(&NewReading {
                channel_id,
                monitor_time: now,
                transaction_time: now,
                raw_value: value,
                offset: 0.0,
                value,
                is_valid,
            })
            .await
            .unwrap();
        EvaluationJob {
            channel_id,
            reading_id: reading.id,
        }
    }

    #[test]
    fn test_enqueue_after_receiver_dropped() {
        let (queue, rx) = EvaluationQueue::new();
        drop(rx);

        let err = queue
            .enqueue(EvaluationJob {
                channel_id: 1,
                reading_id: 1,
            })
            .unwrap_err();
        assert!(matches!(err, Error::QueueClosed));
    }

    #[tokio::test]
    async fn test_keyed_locks_serialize_same_key() {
        let locks = KeyedLocks::default();

        let guard = locks.lock(7).await;
        let other_key = tokio::time::timeout(Duration::from_millis(50), locks.lock(8)).await;
        assert!(other_key.is_ok());

        let same_key = tokio::time::timeout(Duration::from_millis(50), locks.lock(7)).await;
        assert!(same_key.is_err());

        drop(guard);
        let same_key = tokio::time::timeout(Duration::from_millis(50), locks.lock(7)).await;
        assert!(same_key.is_ok());
    }

    #[tokio::test]
    async fn test_process_opens_then_resolves() {
        let (storage, evaluator, channel_id, rule_id) = setup(ChannelStatus::Enabled).await;

        let job = store(&storage, channel_id, 4.0, true).await;
        let events = evaluator.process(job).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AlertEventKind::Opened);

        let job = store(&storage, channel_id, 12.0, true).await;
        let events = evaluator.process(job).await.unwrap();
        assert_eq!(events[0].kind, AlertEventKind::Resolved);
        assert!(
            storage
                .active_alerts_for(channel_id, rule_id)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_process_skips_invalid_reading_and_paused_channel() {
        let (storage, evaluator, channel_id, _) = setup(ChannelStatus::Enabled).await;
        let job = store(&storage, channel_id, 1.0, false).await;
        assert!(evaluator.process(job).await.unwrap().is_empty());

        let (storage, evaluator, channel_id, _) = setup(ChannelStatus::Paused).await;
        let job = store(&storage, channel_id, 1.0, true).await;
        assert!(evaluator.process(job).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_process_rejects_mismatched_job() {
        let (storage, evaluator, channel_id, _) = setup(ChannelStatus::Enabled).await;
        let job = store(&storage, channel_id, 4.0, true).await;

        let err = evaluator
            .process(EvaluationJob {
                channel_id: 999,
                reading_id: job.reading_id,
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_run_processes_jobs_in_order() {
        let (storage, evaluator, channel_id, rule_id) = setup(ChannelStatus::Enabled).await;
        let (queue, rx) = EvaluationQueue::new();
        let worker = tokio::spawn(Arc::new(evaluator).run(rx));

        // Open, nag, resolve, then open again
        for value in [4.0, 3.0, 15.0, 5.0] {
            let job = store(&storage, channel_id, value, true).await;
            queue.enqueue(job).unwrap();
        }
        drop(queue);
        worker.await.unwrap();

        let mut alerts = Vec::new();
        for _ in 0..50 {
            alerts = storage.list_active_alerts().await.unwrap();
            if !alerts.is_empty() && storage.get_alert(1).await.is_ok_and(|a| !a.active) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_id, Some(rule_id));
        assert!(!storage.get_alert(1).await.unwrap().active);
    }

    /// Holds back alert messages so a later recovery notice could overtake them.
    #[derive(Default)]
    struct SlowAlertGateway {
        subjects: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl crate::notify::Gateway for SlowAlertGateway {
        async fn send(
            &self,
            message: &crate::notify::OutboundMessage,
        ) -> std::result::Result<(), crate::notify::DeliveryError> {
            if message.subject.starts_with("Alert") {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            self.subjects.lock().unwrap().push(message.subject.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_notifications_follow_alert_order() {
        let (storage, _, channel_id, _) = setup(ChannelStatus::Enabled).await;
        let contact = storage
            .create_contact(&crate::model::NewContact {
                full_name: "Dana".to_string(),
                email: "dana@example.com".to_string(),
                sms_number: None,
                sms_gateway: None,
                is_active: true,
                preference: Default::default(),
            })
            .await
            .unwrap();
        storage
            .create_rule(&NewRule {
                name: "low pressure mail".to_string(),
                selector: Selector::LessThan,
                lower_threshold: Some(10.0),
                upper_threshold: None,
                action: RuleAction::EmailText,
                state: RuleState::Active,
                channels: vec![channel_id],
                contacts: vec![contact.id],
            })
            .await
            .unwrap();

        let gateway = Arc::new(SlowAlertGateway::default());
        let dispatcher = Dispatcher::new(storage.clone(), gateway.clone(), "http://localhost:3000");
        let (queue, rx) = EvaluationQueue::new();
        tokio::spawn(Arc::new(Evaluator::new(storage.clone(), dispatcher)).run(rx));

        // Opened then immediately resolved
        for value in [4.0, 12.0] {
            let job = store(&storage, channel_id, value, true).await;
            queue.enqueue(job).unwrap();
        }

        let mut subjects = Vec::new();
        for _ in 0..50 {
            subjects = gateway.subjects.lock().unwrap().clone();
            if subjects.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(
            subjects,
            vec![
                "Alert from Pump house Monitor".to_string(),
                "Recovery Notice from Pump house Monitor".to_string(),
            ]
        );
    }
}
