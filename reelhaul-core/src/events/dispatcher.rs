use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{EventEnvelope, EventKind, Lane, PipelineEvent};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("lane {lane} is closed")]
    Closed { lane: Lane },
}

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Error)]
#[error("{handler}: {message}")]
pub struct HandlerError {
    pub handler: &'static str,
    pub message: String,
}

impl HandlerError {
    pub fn new(handler: &'static str, err: impl std::fmt::Display) -> Self {
        Self {
            handler,
            message: err.to_string(),
        }
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// A consumer of pipeline events. Runs on the lane that owns the event kind.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn accepts(&self, kind: EventKind) -> bool;

    async fn handle(&self, event: &PipelineEvent, emitter: &EventEmitter) -> HandlerResult;
}

enum LaneMessage {
    Event(EventEnvelope),
    Shutdown,
}

#[derive(Default)]
struct PendingTracker {
    pending: AtomicUsize,
    idle: Notify,
}

impl PendingTracker {
    fn begin(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Cheap handle used by producers and handlers to publish events.
#[derive(Clone)]
pub struct EventEmitter {
    senders: Arc<HashMap<Lane, mpsc::UnboundedSender<LaneMessage>>>,
    tracker: Arc<PendingTracker>,
}

impl EventEmitter {
    /// Enqueues the event on its lane and returns without waiting for delivery.
    pub fn emit(&self, event: PipelineEvent) -> DispatchResult<Uuid> {
        let kind = event.kind();
        let lane = kind.lane();
        let sender = self
            .senders
            .get(&lane)
            .ok_or(DispatchError::Closed { lane })?;
        let envelope = EventEnvelope::new(event);
        let id = envelope.id;
        self.tracker.begin();
        if sender.send(LaneMessage::Event(envelope)).is_err() {
            self.tracker.finish();
            return Err(DispatchError::Closed { lane });
        }
        debug!(event_id = %id, kind = kind.as_str(), lane = lane.as_str(), "event emitted");
        Ok(id)
    }

    /// Resolves once every emitted event, including the ones emitted by
    /// handlers along the way, has been delivered.
    pub async fn wait_idle(&self) {
        self.tracker.wait_idle().await;
    }

    pub fn pending(&self) -> usize {
        self.tracker.pending.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct EventDispatcherBuilder {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn shared_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Spawns one worker per lane. Must be called inside a tokio runtime.
    pub fn start(self) -> EventDispatcher {
        let tracker = Arc::new(PendingTracker::default());
        let mut senders = HashMap::new();
        let mut receivers = Vec::new();
        for lane in Lane::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(lane, tx);
            receivers.push((lane, rx));
        }
        let emitter = EventEmitter {
            senders: Arc::new(senders),
            tracker,
        };

        let workers = receivers
            .into_iter()
            .map(|(lane, rx)| {
                let handlers = self
                    .handlers
                    .iter()
                    .filter(|handler| {
                        EventKind::ALL
                            .iter()
                            .any(|kind| kind.lane() == lane && handler.accepts(*kind))
                    })
                    .cloned()
                    .collect::<Vec<_>>();
                info!(
                    lane = lane.as_str(),
                    handlers = handlers.len(),
                    "event lane started"
                );
                let worker = tokio::spawn(run_lane(lane, rx, handlers, emitter.clone()));
                (lane, worker)
            })
            .collect();

        EventDispatcher { emitter, workers }
    }
}

pub struct EventDispatcher {
    emitter: EventEmitter,
    workers: Vec<(Lane, JoinHandle<()>)>,
}

impl EventDispatcher {
    pub fn builder() -> EventDispatcherBuilder {
        EventDispatcherBuilder::new()
    }

    pub fn emitter(&self) -> EventEmitter {
        self.emitter.clone()
    }

    pub fn emit(&self, event: PipelineEvent) -> DispatchResult<Uuid> {
        self.emitter.emit(event)
    }

    pub async fn wait_idle(&self) {
        self.emitter.wait_idle().await;
    }

    /// Lets every lane finish what was queued before this call, then stops it.
    /// Events emitted afterwards are rejected or dropped with a warning.
    pub async fn shutdown(self) {
        for (lane, sender) in self.emitter.senders.iter() {
            if sender.send(LaneMessage::Shutdown).is_err() {
                debug!(lane = lane.as_str(), "lane already stopped");
            }
        }
        for (lane, worker) in self.workers {
            if let Err(err) = worker.await {
                error!(lane = lane.as_str(), error = %err, "event lane worker aborted");
            }
        }
    }
}

async fn run_lane(
    lane: Lane,
    mut rx: mpsc::UnboundedReceiver<LaneMessage>,
    handlers: Vec<Arc<dyn EventHandler>>,
    emitter: EventEmitter,
) {
    while let Some(message) = rx.recv().await {
        match message {
            LaneMessage::Event(envelope) => {
                deliver(lane, &handlers, &envelope, &emitter).await;
                drop(envelope);
                emitter.tracker.finish();
            }
            LaneMessage::Shutdown => {
                rx.close();
                while let Ok(message) = rx.try_recv() {
                    if let LaneMessage::Event(envelope) = message {
                        warn!(
                            lane = lane.as_str(),
                            event_id = %envelope.id,
                            kind = envelope.event.kind().as_str(),
                            "event dropped during shutdown"
                        );
                        drop(envelope);
                        emitter.tracker.finish();
                    }
                }
                break;
            }
        }
    }
    info!(lane = lane.as_str(), "event lane stopped");
}

async fn deliver(
    lane: Lane,
    handlers: &[Arc<dyn EventHandler>],
    envelope: &EventEnvelope,
    emitter: &EventEmitter,
) {
    let kind = envelope.event.kind();
    for handler in handlers.iter().filter(|handler| handler.accepts(kind)) {
        let outcome = AssertUnwindSafe(handler.handle(&envelope.event, emitter))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {
                debug!(
                    lane = lane.as_str(),
                    handler = handler.name(),
                    event_id = %envelope.id,
                    kind = kind.as_str(),
                    "event handled"
                );
            }
            Ok(Err(err)) => {
                error!(
                    lane = lane.as_str(),
                    handler = handler.name(),
                    event_id = %envelope.id,
                    kind = kind.as_str(),
                    error = %err,
                    "event handler failed"
                );
            }
            Err(_) => {
                error!(
                    lane = lane.as_str(),
                    handler = handler.name(),
                    event_id = %envelope.id,
                    kind = kind.as_str(),
                    "event handler panicked"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use tokio::sync::Mutex;

    use super::*;
    use crate::catalog::{ErrorCategory, ErrorRecord, ErrorSubject, SourceType, VideoRecord};

    fn error_event(message: &str) -> PipelineEvent {
        PipelineEvent::Error(ErrorRecord::new(
            ErrorCategory::Discovery,
            message,
            ErrorSubject::Source {
                source_type: SourceType::JsonFeed,
            },
        ))
    }

    fn record(id: i64) -> VideoRecord {
        let now = Utc::now();
        VideoRecord {
            id,
            external_id: format!("ext-{id}"),
            source_type: SourceType::JsonFeed,
            title: format!("video {id}"),
            source_url: format!("https://example.test/{id}"),
            real_url: None,
            stored_path: None,
            published_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[derive(Clone, Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn accepts(&self, kind: EventKind) -> bool {
            kind == EventKind::Error
        }

        async fn handle(&self, event: &PipelineEvent, _emitter: &EventEmitter) -> HandlerResult {
            if let PipelineEvent::Error(record) = event {
                self.seen.lock().await.push(record.message.clone());
            }
            Ok(())
        }
    }

    struct Exploding;

    #[async_trait]
    impl EventHandler for Exploding {
        fn name(&self) -> &'static str {
            "exploding"
        }

        fn accepts(&self, kind: EventKind) -> bool {
            kind == EventKind::Error
        }

        async fn handle(&self, event: &PipelineEvent, _emitter: &EventEmitter) -> HandlerResult {
            if let PipelineEvent::Error(record) = event {
                if record.message == "boom" {
                    panic!("handler blew up");
                }
                if record.message == "fail" {
                    return Err(HandlerError::new("exploding", "refused"));
                }
            }
            Ok(())
        }
    }

    struct Gate {
        release: Arc<Notify>,
        finished: Arc<Mutex<Vec<i64>>>,
    }

    #[async_trait]
    impl EventHandler for Gate {
        fn name(&self) -> &'static str {
            "gate"
        }

        fn accepts(&self, kind: EventKind) -> bool {
            kind == EventKind::Download
        }

        async fn handle(&self, event: &PipelineEvent, _emitter: &EventEmitter) -> HandlerResult {
            if let PipelineEvent::Download { video } = event {
                self.release.notified().await;
                self.finished.lock().await.push(video.id);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn lane_preserves_emission_order() {
        let recorder = Recorder::default();
        let dispatcher = EventDispatcher::builder()
            .handler(recorder.clone())
            .start();
        for idx in 0..20 {
            dispatcher.emit(error_event(&format!("e{idx}"))).unwrap();
        }
        dispatcher.wait_idle().await;
        let seen = recorder.seen.lock().await.clone();
        let expected = (0..20).map(|idx| format!("e{idx}")).collect::<Vec<_>>();
        assert_eq!(seen, expected);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn failing_or_panicking_handler_does_not_stop_the_lane() {
        let recorder = Recorder::default();
        let dispatcher = EventDispatcher::builder()
            .handler(Exploding)
            .handler(recorder.clone())
            .start();
        dispatcher.emit(error_event("boom")).unwrap();
        dispatcher.emit(error_event("fail")).unwrap();
        dispatcher.emit(error_event("after")).unwrap();
        dispatcher.wait_idle().await;
        let seen = recorder.seen.lock().await.clone();
        assert_eq!(seen, vec!["boom", "fail", "after"]);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn slow_download_lane_does_not_block_persistence_lane() {
        let release = Arc::new(Notify::new());
        let finished = Arc::new(Mutex::new(Vec::new()));
        let recorder = Recorder::default();
        let dispatcher = EventDispatcher::builder()
            .handler(Gate {
                release: release.clone(),
                finished: finished.clone(),
            })
            .handler(recorder.clone())
            .start();

        dispatcher
            .emit(PipelineEvent::Download { video: record(1) })
            .unwrap();
        dispatcher.emit(error_event("while-blocked")).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if recorder.seen.lock().await.len() == 1 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("persistence lane stalled");
        assert!(finished.lock().await.is_empty());

        release.notify_one();
        dispatcher.wait_idle().await;
        assert_eq!(finished.lock().await.clone(), vec![1]);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn emit_after_shutdown_is_rejected() {
        let dispatcher = EventDispatcher::builder().start();
        let emitter = dispatcher.emitter();
        dispatcher.shutdown().await;
        let err = emitter.emit(error_event("late")).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Closed {
                lane: Lane::Persistence
            }
        ));
        assert_eq!(emitter.pending(), 0);
    }
}
