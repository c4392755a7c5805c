//! Stage progress events.
//!
//! Long-running jobs announce a stage with a total step count and then
//! advance it one labelled step at a time. [`EventLog`] broadcasts these
//! events to subscribers and mirrors them into `tracing`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Receives stage progress from a running job.
pub trait ProgressReporter: Send + Sync {
    /// Start a new stage with a known number of steps.
    fn begin_stage(&self, stage: &str, total: usize);

    /// Mark the next step of the current stage as done.
    fn advance(&self, label: Option<&str>);
}

/// Reporter that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn begin_stage(&self, _stage: &str, _total: usize) {}

    fn advance(&self, _label: Option<&str>) {}
}

/// Kind of stage event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageEventKind {
    Started,
    Advanced { index: usize, label: Option<String> },
}

/// Stage event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    pub stage: String,
    pub total: usize,
    #[serde(flatten)]
    pub kind: StageEventKind,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Default)]
struct CurrentStage {
    name: String,
    total: usize,
    done: usize,
}

/// Broadcasting progress reporter
#[derive(Clone)]
pub struct EventLog {
    sender: Arc<broadcast::Sender<StageEvent>>,
    current: Arc<Mutex<CurrentStage>>,
}

impl EventLog {
    /// Create a new event log
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
            current: Arc::new(Mutex::new(CurrentStage::default())),
        }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.sender.subscribe()
    }

    fn emit(&self, event: StageEvent) {
        let _ = self.sender.send(event);
    }
}

impl ProgressReporter for EventLog {
    fn begin_stage(&self, stage: &str, total: usize) {
        {
            let mut current = self.current.lock();
            *current = CurrentStage {
                name: stage.to_string(),
                total,
                done: 0,
            };
        }
        tracing::info!(stage, total, "Stage started");
        self.emit(StageEvent {
            stage: stage.to_string(),
            total,
            kind: StageEventKind::Started,
            timestamp: chrono::Utc::now(),
        });
    }

    fn advance(&self, label: Option<&str>) {
        let (stage, total, index) = {
            let mut current = self.current.lock();
            current.done += 1;
            (current.name.clone(), current.total, current.done)
        };
        if index > total {
            tracing::warn!(stage = %stage, index, total, "Stage advanced past its step count");
        }
        tracing::info!(
            stage = %stage,
            step = index,
            total,
            label = label.unwrap_or(""),
            "Stage progress"
        );
        self.emit(StageEvent {
            stage,
            total,
            kind: StageEventKind::Advanced {
                index,
                label: label.map(str::to_string),
            },
            timestamp: chrono::Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_log_broadcasts_stage() {
        let log = EventLog::new(16);
        let mut rx = log.subscribe();

        log.begin_stage("Update stemcell", 2);
        log.advance(Some("Extracting stemcell archive"));
        log.advance(None);

        let started = rx.recv().await.unwrap();
        assert_eq!(started.stage, "Update stemcell");
        assert_eq!(started.total, 2);
        assert_eq!(started.kind, StageEventKind::Started);

        let first = rx.recv().await.unwrap();
        assert_eq!(
            first.kind,
            StageEventKind::Advanced {
                index: 1,
                label: Some("Extracting stemcell archive".to_string())
            }
        );

        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, StageEventKind::Advanced { index: 2, label: None });
    }

    #[test]
    fn test_emit_without_subscribers() {
        let log = EventLog::new(4);
        log.begin_stage("Update stemcell", 1);
        log.advance(Some("step"));
    }

    #[test]
    fn test_begin_stage_resets_counter() {
        let log = EventLog::new(4);
        let mut rx = log.subscribe();
        log.begin_stage("first", 1);
        log.advance(None);
        log.begin_stage("second", 1);
        log.advance(None);

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[3].kind,
            StageEventKind::Advanced { index: 1, label: None }
        );
        assert_eq!(events[3].stage, "second");
    }

    #[test]
    fn test_stage_event_serialization() {
        let event = StageEvent {
            stage: "Update stemcell".to_string(),
            total: 5,
            kind: StageEventKind::Advanced {
                index: 1,
                label: Some("Extracting stemcell archive".to_string()),
            },
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "advanced");
        assert_eq!(json["index"], 1);
        assert_eq!(json["label"], "Extracting stemcell archive");
    }
}
