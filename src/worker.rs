use anyhow::{anyhow, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::pipeline::{Pipeline, Trigger};

/// Handle for queueing discovery runs. Cloneable; the worker stops once
/// every clone is dropped.
#[derive(Clone)]
pub struct TriggerSender {
    tx: mpsc::UnboundedSender<Trigger>,
    queued: Arc<Mutex<HashSet<String>>>,
}

impl TriggerSender {
    /// Queues a run. Returns `false` when a run for the same user is already
    /// waiting, in which case the trigger is folded into it.
    pub fn send(&self, trigger: Trigger) -> Result<bool> {
        {
            let mut queued = self
                .queued
                .lock()
                .map_err(|_| anyhow!("trigger queue lock poisoned"))?;
            if !queued.insert(trigger.user_id.clone()) {
                debug!(user_id = %trigger.user_id, "Run already queued, coalescing");
                return Ok(false);
            }
        }
        self.tx
            .send(trigger)
            .map_err(|_| anyhow!("discovery worker has stopped"))?;
        Ok(true)
    }
}

/// Runs queued triggers one at a time. The handle resolves to the number of
/// runs performed.
pub fn spawn_worker(pipeline: Arc<Pipeline>) -> (TriggerSender, JoinHandle<usize>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Trigger>();
    let queued: Arc<Mutex<HashSet<String>>> = Arc::default();
    let sender = TriggerSender {
        tx,
        queued: queued.clone(),
    };

    let handle = tokio::spawn(async move {
        let mut runs = 0;
        while let Some(trigger) = rx.recv().await {
            // Dequeue first so a trigger arriving mid-run schedules a fresh run
            if let Ok(mut queued) = queued.lock() {
                queued.remove(&trigger.user_id);
            }

            match pipeline.run(&trigger).await {
                Ok(report) => info!(%report, "Run complete"),
                Err(e) => error!(user_id = %trigger.user_id, error = %e, "Run failed"),
            }
            runs += 1;
        }
        info!(runs, "Discovery worker stopped");
        runs
    });

    (sender, handle)
}
