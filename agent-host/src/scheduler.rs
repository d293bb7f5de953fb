//! Durable task scheduler driven by a single alarm per agent
//!
//! Tasks live in the agent's `schedules` table. After every mutation the
//! scheduler re-arms the agent's alarm to the earliest pending fire time, so
//! at most one alarm is ever armed. When the alarm fires, every due task is
//! run; one-off tasks are deleted afterwards and cron tasks move to their next
//! fire time.

use crate::agent::MethodRegistry;
use crate::cron::{self, CronError};
use crate::storage::{AgentStorage, ScheduleFilter, StorageError};
use async_trait::async_trait;
use serde_json::Value;
use shared_types::{ScheduleKind, ScheduledTask};
use std::sync::Arc;

/// When a task should fire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Absolute unix timestamp (seconds)
    At(i64),
    /// Seconds from now
    Delay(i64),
    /// Cron expression, 5 or 6 fields
    Cron(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScheduleError {
    #[error("Callback '{0}' is not a method of this agent")]
    InvalidCallback(String),

    #[error("Invalid delay: {0} seconds")]
    InvalidDelay(i64),

    #[error(transparent)]
    Cron(#[from] CronError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The host-side timer that wakes an agent. `None` disarms it.
#[async_trait]
pub trait Alarm: Send + Sync {
    async fn set(&self, at: Option<i64>) -> Result<(), StorageError>;
}

/// Runs a due task's callback
#[async_trait]
pub trait TaskRunner: Send {
    async fn run(&mut self, task: &ScheduledTask) -> Result<(), String>;
}

pub struct Scheduler {
    storage: AgentStorage,
    alarm: Arc<dyn Alarm>,
    methods: Arc<MethodRegistry>,
}

impl Scheduler {
    pub fn new(storage: AgentStorage, alarm: Arc<dyn Alarm>, methods: Arc<MethodRegistry>) -> Self {
        Self {
            storage,
            alarm,
            methods,
        }
    }

    pub async fn schedule(
        &self,
        when: Schedule,
        callback: &str,
        payload: Value,
    ) -> Result<ScheduledTask, ScheduleError> {
        self.schedule_from(chrono::Utc::now().timestamp(), when, callback, payload)
            .await
    }

    /// Schedule relative to an explicit `now` (unix seconds).
    pub async fn schedule_from(
        &self,
        now: i64,
        when: Schedule,
        callback: &str,
        payload: Value,
    ) -> Result<ScheduledTask, ScheduleError> {
        if !self.methods.contains(callback) {
            return Err(ScheduleError::InvalidCallback(callback.to_string()));
        }

        let (kind, time, delay_in_seconds, cron_expr) = match when {
            Schedule::At(at) => (ScheduleKind::Scheduled, at, None, None),
            Schedule::Delay(secs) if secs < 0 => return Err(ScheduleError::InvalidDelay(secs)),
            Schedule::Delay(secs) => {
                let time = now
                    .checked_add(secs)
                    .ok_or(ScheduleError::InvalidDelay(secs))?;
                (ScheduleKind::Delayed, time, Some(secs), None)
            }
            Schedule::Cron(expr) => {
                let next = cron::next_fire_time(&expr, now)?;
                (ScheduleKind::Cron, next, None, Some(expr))
            }
        };

        let task = ScheduledTask {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            callback: callback.to_string(),
            payload,
            kind,
            time,
            delay_in_seconds,
            cron: cron_expr,
            created_at: now,
        };
        self.storage.upsert_schedule(&task).await?;
        self.rearm().await?;

        tracing::debug!(
            task_id = %task.id,
            callback = %task.callback,
            kind = task.kind.as_str(),
            time = task.time,
            "Task scheduled"
        );
        Ok(task)
    }

    pub async fn cancel(&self, id: &str) -> Result<bool, ScheduleError> {
        let deleted = self.storage.delete_schedule(id).await?;
        self.rearm().await?;
        Ok(deleted)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ScheduledTask>, ScheduleError> {
        Ok(self.storage.get_schedule(id).await?)
    }

    pub async fn list(&self, filter: &ScheduleFilter) -> Result<Vec<ScheduledTask>, ScheduleError> {
        Ok(self.storage.list_schedules(filter).await?)
    }

    /// Arm the alarm at the earliest pending fire time, or disarm it.
    pub async fn rearm(&self) -> Result<Option<i64>, ScheduleError> {
        let next = self.storage.next_schedule_time().await?;
        self.alarm.set(next).await?;
        Ok(next)
    }

    /// Run every task due at `now`. Task failures are logged, never returned.
    /// Returns the number of tasks run.
    pub async fn on_alarm(
        &self,
        now: i64,
        runner: &mut dyn TaskRunner,
    ) -> Result<usize, ScheduleError> {
        let due = self.storage.due_schedules(now).await?;
        let count = due.len();

        for task in due {
            if let Err(error) = runner.run(&task).await {
                tracing::error!(
                    task_id = %task.id,
                    callback = %task.callback,
                    error = %error,
                    "Scheduled task failed"
                );
            }

            match (&task.kind, &task.cron) {
                (ScheduleKind::Cron, Some(expr)) => {
                    match cron::next_fire_time(expr, task.time.max(now)) {
                        Ok(next) => self.storage.update_schedule_time(&task.id, next).await?,
                        Err(error) => {
                            tracing::error!(
                                task_id = %task.id,
                                cron = %expr,
                                error = %error,
                                "Cron task has no next fire time; removing"
                            );
                            self.storage.delete_schedule(&task.id).await?;
                        }
                    }
                }
                _ => {
                    self.storage.delete_schedule(&task.id).await?;
                }
            }
        }

        self.rearm().await?;
        Ok(count)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Mutex;

    /// Alarm that records every arm/disarm
    #[derive(Default)]
    pub(crate) struct RecordingAlarm {
        pub calls: Mutex<Vec<Option<i64>>>,
    }

    impl RecordingAlarm {
        pub fn last(&self) -> Option<Option<i64>> {
            self.calls.lock().unwrap().last().copied()
        }
    }

    #[async_trait]
    impl Alarm for RecordingAlarm {
        async fn set(&self, at: Option<i64>) -> Result<(), StorageError> {
            self.calls.lock().unwrap().push(at);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Runner {
        ran: Vec<(String, Value)>,
    }

    #[async_trait]
    impl TaskRunner for Runner {
        async fn run(&mut self, task: &ScheduledTask) -> Result<(), String> {
            self.ran.push((task.callback.clone(), task.payload.clone()));
            if task.callback == "explode" {
                return Err("boom".to_string());
            }
            Ok(())
        }
    }

    async fn scheduler() -> (Scheduler, Arc<RecordingAlarm>) {
        let storage = AgentStorage::in_memory().await.unwrap();
        let alarm = Arc::new(RecordingAlarm::default());
        let methods = Arc::new(MethodRegistry::new().method("tick").method("explode"));
        (Scheduler::new(storage, alarm.clone(), methods), alarm)
    }

    fn ts(h: u32, m: u32, s: u32) -> i64 {
        chrono::Utc
            .with_ymd_and_hms(2025, 1, 1, h, m, s)
            .unwrap()
            .timestamp()
    }

    #[tokio::test]
    async fn test_rejects_unknown_callback() {
        let (scheduler, alarm) = scheduler().await;
        let err = scheduler
            .schedule(Schedule::Delay(5), "nope", json!(null))
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidCallback(ref c) if c == "nope"));
        assert!(alarm.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_alarm_tracks_minimum_fire_time() {
        let (scheduler, alarm) = scheduler().await;
        let now = ts(0, 0, 0);

        let late = scheduler
            .schedule_from(now, Schedule::At(now + 100), "tick", json!(1))
            .await
            .unwrap();
        assert_eq!(alarm.last(), Some(Some(now + 100)));

        let early = scheduler
            .schedule_from(now, Schedule::Delay(10), "tick", json!(2))
            .await
            .unwrap();
        assert_eq!(early.kind, ScheduleKind::Delayed);
        assert_eq!(early.delay_in_seconds, Some(10));
        assert_eq!(alarm.last(), Some(Some(now + 10)));

        assert!(scheduler.cancel(&early.id).await.unwrap());
        assert_eq!(alarm.last(), Some(Some(now + 100)));
        assert!(!scheduler.cancel(&early.id).await.unwrap());

        assert!(scheduler.cancel(&late.id).await.unwrap());
        assert_eq!(alarm.last(), Some(None));
    }

    #[tokio::test]
    async fn test_cron_task_advances_and_keeps_payload() {
        let (scheduler, _alarm) = scheduler().await;
        let t0 = ts(0, 0, 0);

        let task = scheduler
            .schedule_from(
                t0,
                Schedule::Cron("*/5 * * * *".into()),
                "tick",
                json!({"n": 1}),
            )
            .await
            .unwrap();
        assert_eq!(task.time, ts(0, 5, 0));

        let mut runner = Runner::default();
        let ran = scheduler.on_alarm(ts(0, 5, 0), &mut runner).await.unwrap();
        assert_eq!(ran, 1);
        assert_eq!(runner.ran, vec![("tick".to_string(), json!({"n": 1}))]);

        let stored = scheduler.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.time, ts(0, 10, 0));
        assert_eq!(stored.payload, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_one_off_tasks_are_removed_and_failures_isolated() {
        let (scheduler, alarm) = scheduler().await;
        let now = ts(1, 0, 0);

        scheduler
            .schedule_from(now, Schedule::At(now - 5), "explode", json!(null))
            .await
            .unwrap();
        scheduler
            .schedule_from(now, Schedule::Delay(0), "tick", json!("ok"))
            .await
            .unwrap();
        let future = scheduler
            .schedule_from(now, Schedule::Delay(60), "tick", json!("later"))
            .await
            .unwrap();

        let mut runner = Runner::default();
        let ran = scheduler.on_alarm(now, &mut runner).await.unwrap();
        assert_eq!(ran, 2);
        assert_eq!(runner.ran.len(), 2);

        let remaining = scheduler.list(&ScheduleFilter::default()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, future.id);
        assert_eq!(alarm.last(), Some(Some(now + 60)));
    }

    #[tokio::test]
    async fn test_rejects_negative_and_overflowing_delay() {
        let (scheduler, alarm) = scheduler().await;

        for delay in [-1, i64::MAX] {
            let err = scheduler
                .schedule(Schedule::Delay(delay), "tick", json!(null))
                .await
                .unwrap_err();
            assert!(matches!(err, ScheduleError::InvalidDelay(d) if d == delay));
        }
        assert!(alarm.calls.lock().unwrap().is_empty());
        assert!(scheduler
            .list(&ScheduleFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_extreme_absolute_times_are_stored() {
        let (scheduler, alarm) = scheduler().await;
        let now = ts(0, 0, 0);

        scheduler
            .schedule_from(now, Schedule::At(i64::MIN), "tick", json!(null))
            .await
            .unwrap();
        assert_eq!(alarm.last(), Some(Some(i64::MIN)));

        let mut runner = Runner::default();
        assert_eq!(scheduler.on_alarm(now, &mut runner).await.unwrap(), 1);
        assert_eq!(alarm.last(), Some(None));
    }

    #[tokio::test]
    async fn test_invalid_cron_is_rejected() {
        let (scheduler, _alarm) = scheduler().await;
        let err = scheduler
            .schedule(Schedule::Cron("not a cron".into()), "tick", json!(null))
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Cron(_)));
    }
}
