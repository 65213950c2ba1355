use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use tally::{Result, UsageError, UsagePublisher, UsageUpdate};

/// Publisher that records every update it is asked to send.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    sent: Arc<Mutex<Vec<(String, UsageUpdate)>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, as (subject, update) pairs.
    pub fn sent(&self) -> Vec<(String, UsageUpdate)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl UsagePublisher for RecordingPublisher {
    async fn publish(&self, subject: &str, update: &UsageUpdate) -> Result<()> {
        self.sent.lock().push((subject.to_string(), update.clone()));
        Ok(())
    }
}

/// Publisher whose sends always fail, for exercising the best-effort path.
#[derive(Clone, Copy, Debug, Default)]
pub struct FailingPublisher;

#[async_trait]
impl UsagePublisher for FailingPublisher {
    async fn publish(&self, _subject: &str, _update: &UsageUpdate) -> Result<()> {
        Err(UsageError::Publish("broker unavailable".into()))
    }
}
