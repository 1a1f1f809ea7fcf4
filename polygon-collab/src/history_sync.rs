//! Background flush of a history engine's sync outbox.
//!
//! Every `HistoryOptions::sync_interval` the outbox is drained into the
//! sink. A failed flush leaves the entries queued for the next tick.
//! Stopping the task performs one last flush.

use std::sync::Arc;

use log::{debug, warn};
use polygon_core::{HistoryEngine, HistorySink};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle to a running flush task.
pub struct HistorySyncHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl HistorySyncHandle {
    /// Stop the task after a final flush.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("History sync task ended abnormally: {e}");
        }
    }
}

/// Spawn the periodic outbox flush for one engine, at the engine's
/// configured sync interval.
pub fn spawn_history_sync(
    engine: Arc<Mutex<HistoryEngine>>,
    sink: Arc<dyn HistorySink>,
) -> HistorySyncHandle {
    let (stop_tx, mut stop_rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        let interval = engine.lock().await.options().sync_interval;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => flush(&engine, sink.as_ref()).await,
                _ = &mut stop_rx => {
                    flush(&engine, sink.as_ref()).await;
                    break;
                }
            }
        }
    });

    HistorySyncHandle {
        stop: Some(stop_tx),
        task,
    }
}

async fn flush(engine: &Mutex<HistoryEngine>, sink: &dyn HistorySink) {
    let mut engine = engine.lock().await;
    match engine.sync_pending(sink) {
        Ok(0) => {}
        Ok(count) => debug!(
            "Flushed {} history entries for document {}",
            count,
            engine.document_id()
        ),
        Err(e) => warn!(
            "History sync for document {} failed, {} entries queued: {}",
            engine.document_id(),
            engine.pending_sync(),
            e
        ),
    }
}
