mod dispatcher;

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::catalog::{ErrorRecord, SourceType, VideoDescriptor, VideoRecord};
use crate::processor::EncodedMedia;

pub use dispatcher::{
    DispatchError, DispatchResult, EventDispatcher, EventDispatcherBuilder, EventEmitter,
    EventHandler, HandlerError, HandlerResult,
};

/// Independent execution contexts. Each lane drains its own FIFO queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Persistence,
    Download,
}

impl Lane {
    pub const ALL: [Lane; 2] = [Lane::Persistence, Lane::Download];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Persistence => "persistence",
            Lane::Download => "download",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SaveBatch,
    Download,
    Upload,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::SaveBatch,
        EventKind::Download,
        EventKind::Upload,
        EventKind::Error,
    ];

    pub fn lane(&self) -> Lane {
        match self {
            EventKind::SaveBatch | EventKind::Error => Lane::Persistence,
            EventKind::Download | EventKind::Upload => Lane::Download,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SaveBatch => "save_batch",
            EventKind::Download => "download",
            EventKind::Upload => "upload",
            EventKind::Error => "error",
        }
    }
}

/// Single-owner handoff of an encoded file between stages.
///
/// The first consumer to `claim` takes ownership; if nobody claims it the file
/// is released when the event is dropped.
#[derive(Debug)]
pub struct MediaHandle {
    inner: Mutex<Option<EncodedMedia>>,
}

impl MediaHandle {
    pub fn new(media: EncodedMedia) -> Self {
        Self {
            inner: Mutex::new(Some(media)),
        }
    }

    pub fn claim(&self) -> Option<EncodedMedia> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[derive(Debug)]
pub enum PipelineEvent {
    SaveBatch {
        source_type: SourceType,
        videos: Vec<VideoDescriptor>,
    },
    Download {
        video: VideoRecord,
    },
    Upload {
        video: VideoRecord,
        media: MediaHandle,
    },
    Error(ErrorRecord),
}

impl PipelineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PipelineEvent::SaveBatch { .. } => EventKind::SaveBatch,
            PipelineEvent::Download { .. } => EventKind::Download,
            PipelineEvent::Upload { .. } => EventKind::Upload,
            PipelineEvent::Error(_) => EventKind::Error,
        }
    }

    pub fn upload(video: VideoRecord, media: EncodedMedia) -> Self {
        PipelineEvent::Upload {
            video,
            media: MediaHandle::new(media),
        }
    }
}

#[derive(Debug)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub emitted_at: DateTime<Utc>,
    pub event: PipelineEvent,
}

impl EventEnvelope {
    fn new(event: PipelineEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            emitted_at: Utc::now(),
            event,
        }
    }
}
