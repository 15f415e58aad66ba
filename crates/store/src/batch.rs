use std::sync::Arc;
use std::time::Duration;

use quarry_core::Record;
use quarry_query::RecordSink;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::Coalescer;

/// Spawns the upstream batcher: records pushed through the returned sink are
/// coalesced by id and handed to `out` once per `window`, or early when the
/// coalescer reaches `cap` distinct ids. The sink feeds a queue of `feed_cap`
/// records; records arriving while it is full are dropped and counted in
/// `store_feed_dropped_total`. The loop exits on shutdown (after a final
/// flush) or when `out` is closed.
pub fn spawn_batcher(
    window: Duration,
    cap: usize,
    feed_cap: usize,
    out: mpsc::Sender<Vec<Record>>,
    mut shutdown: watch::Receiver<bool>,
) -> (RecordSink, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Record>(feed_cap.max(1));
    let sink: RecordSink = Arc::new(move |r: Record| match tx.try_send(r) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(r)) => {
            warn!(id = %r.id(), "batcher: feed full; record dropped");
            metrics::counter!("store_feed_dropped_total", 1u64);
        }
        Err(mpsc::error::TrySendError::Closed(r)) => {
            debug!(id = %r.id(), "batcher: stopped; record ignored");
            metrics::counter!("store_feed_closed_total", 1u64);
        }
    });
    let handle = tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut ticker = tokio::time::interval(window.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(r) => {
                            if coalescer.push(r) && !flush(&mut coalescer, &out).await { break; }
                        }
                        None => {
                            debug!("batcher: record channel closed; draining");
                            flush(&mut coalescer, &out).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !flush(&mut coalescer, &out).await { break; }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        while let Ok(r) = rx.try_recv() { coalescer.push(r); }
                        flush(&mut coalescer, &out).await;
                        break;
                    }
                }
            }
        }
        info!("batcher: stopped");
    });
    (sink, handle)
}

/// `false` once the consumer is gone.
async fn flush(c: &mut Coalescer, out: &mpsc::Sender<Vec<Record>>) -> bool {
    let batch = c.drain_ready();
    if batch.is_empty() {
        return !out.is_closed();
    }
    metrics::histogram!("store_batch_size", batch.len() as f64);
    out.send(batch).await.is_ok()
}
