use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::catalog::ErrorLog;
use crate::events::{EventEmitter, EventHandler, EventKind, HandlerError, HandlerResult, PipelineEvent};

/// Persists error events so per-item failures stay observable after the fact.
pub struct ErrorSinkHandler {
    log: Arc<dyn ErrorLog>,
}

impl ErrorSinkHandler {
    pub const NAME: &'static str = "error_sink";

    pub fn new(log: Arc<dyn ErrorLog>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl EventHandler for ErrorSinkHandler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn accepts(&self, kind: EventKind) -> bool {
        kind == EventKind::Error
    }

    async fn handle(&self, event: &PipelineEvent, _emitter: &EventEmitter) -> HandlerResult {
        let PipelineEvent::Error(record) = event else {
            return Ok(());
        };
        match self.log.record_error(record.clone()).await {
            Ok(id) => {
                info!(
                    error_id = id,
                    category = record.category.as_str(),
                    message = %record.message,
                    "pipeline error recorded"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    category = record.category.as_str(),
                    message = %record.message,
                    error = %err,
                    "failed to record pipeline error"
                );
                Err(HandlerError::new(Self::NAME, err))
            }
        }
    }
}
