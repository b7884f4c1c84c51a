//! Live batch progress stream.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::queue::JobProgress;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchProgress {
    pub campaign_id: String,
    pub job_id: String,
    pub batch_number: u32,
    pub total_batches: u32,
    #[serde(flatten)]
    pub counts: JobProgress,
    pub finished: bool,
}

/// Fan-out of [`BatchProgress`] updates. Publishing never blocks and is a
/// no-op without subscribers; slow subscribers miss old updates.
#[derive(Clone)]
pub struct ProgressHub {
    tx: broadcast::Sender<BatchProgress>,
}

impl ProgressHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchProgress> {
        self.tx.subscribe()
    }

    pub fn publish(&self, update: BatchProgress) {
        let _ = self.tx.send(update);
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(256)
    }
}
