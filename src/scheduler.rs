//! Delayed, cancellable tasks.
//!
//! Each scheduled record gets its own sleeper on the tokio runtime. When the
//! sleeper wakes it claims the record from the pending table and hands it to
//! the dispatch channel; cancelling removes the record first, so a cancelled
//! task is never delivered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::models::{MuteId, ScopeKey};
use crate::verification::ChallengeId;

/// Handle for a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

/// What to do when a task fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPayload {
    /// Expel the member if this exact challenge is still open.
    VerificationTimeout {
        scope: ScopeKey,
        challenge_id: ChallengeId,
    },
    /// Drop this exact mute from memory once it has run out.
    MuteExpiry { scope: ScopeKey, mute_id: MuteId },
    /// Remove a bot notice from the chat.
    DeleteMessage { chat_id: i64, message_id: i64 },
}

/// A task record as delivered to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTask {
    pub id: TaskId,
    pub fire_at: DateTime<Utc>,
    pub payload: TaskPayload,
}

struct PendingEntry {
    task: ScheduledTask,
    sleeper: Option<JoinHandle<()>>,
}

/// Scheduler for delayed callbacks.
///
/// Must be used from within a tokio runtime.
pub struct TimerScheduler {
    next_id: AtomicU64,
    pending: Arc<DashMap<TaskId, PendingEntry>>,
    fired: mpsc::UnboundedSender<ScheduledTask>,
}

impl TimerScheduler {
    /// Create a scheduler and the receiver that fired tasks are delivered on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScheduledTask>) {
        let (fired, receiver) = mpsc::unbounded_channel();
        let scheduler = Self {
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            fired,
        };
        (scheduler, receiver)
    }

    /// Schedule `payload` to fire at `fire_at`. A time in the past fires at once.
    pub fn schedule(&self, fire_at: DateTime<Utc>, payload: TaskPayload) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let task = ScheduledTask {
            id,
            fire_at,
            payload,
        };

        // The record must exist before the sleeper can look for it
        self.pending.insert(
            id,
            PendingEntry {
                task,
                sleeper: None,
            },
        );

        let delay = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let pending = self.pending.clone();
        let fired = self.fired.clone();
        let sleeper = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some((_, entry)) = pending.remove(&id) {
                if fired.send(entry.task).is_err() {
                    tracing::debug!(task_id = ?id, "Task fired with no dispatcher listening");
                }
            }
        });

        match self.pending.get_mut(&id) {
            Some(mut entry) => entry.sleeper = Some(sleeper),
            // Already fired; the handle is no longer needed
            None => drop(sleeper),
        }

        tracing::debug!(task_id = ?id, fire_at = %fire_at, "Task scheduled");
        id
    }

    /// Schedule relative to now.
    pub fn schedule_after(&self, delay: Duration, payload: TaskPayload) -> TaskId {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let fire_at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.schedule(fire_at, payload)
    }

    /// Cancel a task. Returns false if it already fired or was cancelled.
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.pending.remove(&id) {
            Some((_, entry)) => {
                if let Some(sleeper) = entry.sleeper {
                    sleeper.abort();
                }
                tracing::debug!(task_id = ?id, "Task cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, id: TaskId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Snapshot of a pending task.
    pub fn get(&self, id: TaskId) -> Option<ScheduledTask> {
        self.pending.get(&id).map(|entry| entry.task.clone())
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        for entry in self.pending.iter() {
            if let Some(sleeper) = &entry.sleeper {
                sleeper.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use crate::models::ScopeKey;
    use crate::scheduler::{TaskPayload, TimerScheduler};

    fn delete_payload(message_id: i64) -> TaskPayload {
        TaskPayload::DeleteMessage {
            chat_id: -100,
            message_id,
        }
    }

    #[tokio::test]
    async fn task_fires_after_delay() {
        let (scheduler, mut fired) = TimerScheduler::new();
        let id = scheduler.schedule_after(Duration::from_millis(20), delete_payload(1));
        assert!(scheduler.is_pending(id));

        let task = tokio::time::timeout(Duration::from_secs(2), fired.recv())
            .await
            .expect("should fire")
            .expect("channel open");

        assert_eq!(task.id, id);
        assert_eq!(task.payload, delete_payload(1));
        assert!(!scheduler.is_pending(id));
    }

    #[tokio::test]
    async fn past_fire_time_fires_immediately() {
        let (scheduler, mut fired) = TimerScheduler::new();
        let past = Utc::now() - chrono::Duration::seconds(5);
        let id = scheduler.schedule(past, delete_payload(2));

        let task = tokio::time::timeout(Duration::from_secs(2), fired.recv())
            .await
            .expect("should fire")
            .expect("channel open");
        assert_eq!(task.id, id);
    }

    #[tokio::test]
    async fn cancelled_task_never_fires() {
        let (scheduler, mut fired) = TimerScheduler::new();
        let cancelled = scheduler.schedule_after(Duration::from_millis(30), delete_payload(3));
        let kept = scheduler.schedule_after(Duration::from_millis(60), delete_payload(4));

        assert!(scheduler.cancel(cancelled));
        assert!(!scheduler.cancel(cancelled));

        let task = tokio::time::timeout(Duration::from_secs(2), fired.recv())
            .await
            .expect("should fire")
            .expect("channel open");
        assert_eq!(task.id, kept);

        let nothing = tokio::time::timeout(Duration::from_millis(100), fired.recv()).await;
        assert!(nothing.is_err());
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_after_fire_reports_false() {
        let (scheduler, mut fired) = TimerScheduler::new();
        let id = scheduler.schedule_after(Duration::ZERO, delete_payload(5));
        let _ = fired.recv().await;
        assert!(!scheduler.cancel(id));
    }

    #[tokio::test]
    async fn get_returns_pending_record() {
        let (scheduler, _fired) = TimerScheduler::new();
        let payload = TaskPayload::MuteExpiry {
            scope: ScopeKey::new(1, 2),
            mute_id: crate::models::MuteId(9),
        };
        let id = scheduler.schedule_after(Duration::from_secs(60), payload.clone());

        let task = scheduler.get(id).expect("pending");
        assert_eq!(task.payload, payload);
        assert!(task.fire_at > Utc::now());
    }
}
