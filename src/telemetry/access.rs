use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::metrics::{AccessLabels, Metrics};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEvent {
    pub user: String,
    pub path: String,
}

/// Producer side of the access queue, cloned into request handlers.
#[derive(Clone)]
pub struct AccessRecorder {
    tx: mpsc::Sender<AccessEvent>,
}

impl AccessRecorder {
    /// Create the queue without starting a consumer.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AccessEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Create the queue and spawn the task that feeds the access counter.
    pub fn spawn(metrics: Arc<Metrics>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (recorder, rx) = Self::channel(capacity);
        let handle = tokio::spawn(run_recorder(rx, metrics));
        (recorder, handle)
    }

    /// Submit an access.  Never blocks; a full or closed queue drops the
    /// event.
    pub fn record(&self, user: &str, path: &str) {
        let event = AccessEvent {
            user: user.to_string(),
            path: path.to_string(),
        };
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!(user = %event.user, path = %event.path, "access queue full, dropping event");
            }
            Err(TrySendError::Closed(event)) => {
                debug!(user = %event.user, path = %event.path, "access recorder stopped, dropping event");
            }
        }
    }
}

/// Drain the queue into the access counter until every sender is dropped.
pub async fn run_recorder(mut rx: mpsc::Receiver<AccessEvent>, metrics: Arc<Metrics>) {
    while let Some(event) = rx.recv().await {
        metrics
            .user_access
            .get_or_create(&AccessLabels {
                user: event.user,
                path: event.path,
            })
            .inc();
    }
    debug!("access recorder finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;

    fn count(metrics: &Metrics, user: &str, path: &str) -> u64 {
        metrics
            .user_access
            .get_or_create(&AccessLabels {
                user: user.into(),
                path: path.into(),
            })
            .get()
    }

    #[tokio::test]
    async fn test_recorded_events_reach_counter() {
        let registry = MetricsRegistry::new();
        let (recorder, handle) = AccessRecorder::spawn(registry.metrics.clone(), 16);

        recorder.record("alice", "/g/a.jar");
        recorder.record("alice", "/g/a.jar");
        recorder.record("bob", "/g/a.jar");
        drop(recorder);
        handle.await.unwrap();

        assert_eq!(count(&registry.metrics, "alice", "/g/a.jar"), 2);
        assert_eq!(count(&registry.metrics, "bob", "/g/a.jar"), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_events() {
        let registry = MetricsRegistry::new();
        let (recorder, rx) = AccessRecorder::channel(1);

        recorder.record("alice", "/g/a.jar");
        recorder.record("alice", "/g/a.jar");
        recorder.record("alice", "/g/a.jar");
        drop(recorder);
        run_recorder(rx, registry.metrics.clone()).await;

        assert_eq!(count(&registry.metrics, "alice", "/g/a.jar"), 1);
    }

    #[tokio::test]
    async fn test_closed_queue_does_not_panic() {
        let (recorder, rx) = AccessRecorder::channel(4);
        drop(rx);
        recorder.record("alice", "/g/a.jar");
    }
}
