//! Background worker that marks conversations read.
//!
//! Conversation queries enqueue a job and return immediately. The worker
//! runs each job on the blocking pool, logs the result and publishes it on
//! a broadcast channel so callers can observe completion or failure.

use playzy_messages::MessageStore;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkReadJob {
    pub owner: String,
    pub counterpart: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadReceiptOutcome {
    Marked {
        owner: String,
        counterpart: String,
        updated: usize,
    },
    Failed {
        owner: String,
        counterpart: String,
        error: String,
    },
}

/// Handle for scheduling mark-read jobs and watching their outcomes.
#[derive(Clone)]
pub struct ReadReceipts {
    jobs: mpsc::Sender<MarkReadJob>,
    outcomes: broadcast::Sender<ReadReceiptOutcome>,
}

impl ReadReceipts {
    /// Spawns the worker with a job queue of `capacity`.
    pub fn spawn(store: Arc<dyn MessageStore>, capacity: usize) -> Self {
        let (jobs, rx) = mpsc::channel(capacity);
        let (outcomes, _) = broadcast::channel(capacity);
        tokio::spawn(run_worker(store, rx, outcomes.clone()));
        Self { jobs, outcomes }
    }

    /// Enqueues a job without waiting. Returns `false` if it was dropped.
    pub fn schedule(&self, owner: &str, counterpart: &str) -> bool {
        let job = MarkReadJob {
            owner: owner.to_string(),
            counterpart: counterpart.to_string(),
        };
        match self.jobs.try_send(job) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(owner, counterpart, "mark-read job dropped: {}", e);
                false
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReadReceiptOutcome> {
        self.outcomes.subscribe()
    }
}

async fn run_worker(
    store: Arc<dyn MessageStore>,
    mut jobs: mpsc::Receiver<MarkReadJob>,
    outcomes: broadcast::Sender<ReadReceiptOutcome>,
) {
    tracing::debug!("read receipt worker started");

    while let Some(MarkReadJob { owner, counterpart }) = jobs.recv().await {
        let job_store = store.clone();
        let (o, c) = (owner.clone(), counterpart.clone());
        let result = tokio::task::spawn_blocking(move || job_store.mark_read(&o, &c)).await;

        let outcome = match result {
            Ok(Ok(updated)) => {
                if updated > 0 {
                    tracing::debug!(owner = %owner, counterpart = %counterpart, updated, "marked messages read");
                }
                ReadReceiptOutcome::Marked {
                    owner,
                    counterpart,
                    updated,
                }
            }
            Ok(Err(e)) => {
                tracing::error!(owner = %owner, counterpart = %counterpart, "failed to mark messages read: {}", e);
                ReadReceiptOutcome::Failed {
                    owner,
                    counterpart,
                    error: e.to_string(),
                }
            }
            Err(e) => {
                tracing::error!(owner = %owner, "mark-read task join error: {}", e);
                ReadReceiptOutcome::Failed {
                    owner,
                    counterpart,
                    error: e.to_string(),
                }
            }
        };

        // No subscribers is the normal case outside tests.
        let _ = outcomes.send(outcome);
    }

    tracing::debug!("read receipt worker stopped");
}
