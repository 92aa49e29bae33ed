//! Deferred Deletion
//!
//! `delete` does not remove an item right away. The item is flagged deleted,
//! which hides it from lookups and makes `add`/`replace` on its key fail,
//! and it is queued here with a pin. Once its grace period has passed, the
//! background sweeper clears the flag and drops the pin; from then on the
//! item behaves like any other expired item and is reclaimed by the next
//! lookup or by eviction.
//!
//! ```text
//!   delete ──> [deleted, pinned, queued] ──grace──> sweeper ──> [expired]
//! ```

use crate::storage::items::ItemId;
use crate::storage::StorageEngine;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Initial capacity of the deletion queue; it grows as needed.
const INITIAL_QUEUE_CAPACITY: usize = 200;

/// Items waiting for their grace period to pass.
#[derive(Debug)]
pub struct DeleteQueue {
    entries: Vec<ItemId>,
}

impl Default for DeleteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeleteQueue {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(INITIAL_QUEUE_CAPACITY),
        }
    }

    pub fn push(&mut self, id: ItemId) {
        self.entries.push(id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes and returns every entry for which `is_due` holds, keeping the
    /// rest in their original order.
    pub fn take_due(&mut self, mut is_due: impl FnMut(ItemId) -> bool) -> Vec<ItemId> {
        let mut due = Vec::new();
        self.entries.retain(|&id| {
            if is_due(id) {
                due.push(id);
                false
            } else {
                true
            }
        });
        due
    }
}

/// Timing of deferred deletion.
#[derive(Debug, Clone)]
pub struct DeletionConfig {
    /// Time between sweeps (default: 5s)
    pub interval: Duration,

    /// How long a deleted key stays blocked for `add`/`replace` (default: 4s)
    pub grace: Duration,
}

impl Default for DeletionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            grace: Duration::from_secs(4),
        }
    }
}

/// A handle to the running deletion sweeper.
///
/// When this handle is dropped, the sweeper task will be stopped.
#[derive(Debug)]
pub struct DeleteSweeper {
    shutdown_tx: watch::Sender<bool>,
}

impl DeleteSweeper {
    /// Starts the sweeper on the current `LocalSet`.
    ///
    /// # Arguments
    ///
    /// * `engine` - The item store whose deletion queue is swept
    /// * `config` - Sweep interval (the grace period is applied by `delete`)
    ///
    /// # Panics
    ///
    /// Panics if called outside of a `tokio::task::LocalSet`.
    pub fn start(engine: Rc<RefCell<StorageEngine>>, config: DeletionConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::task::spawn_local(sweeper_loop(engine, config.interval, shutdown_rx));

        info!(interval_secs = config.interval.as_secs(), "Deletion sweeper started");

        Self { shutdown_tx }
    }

    /// Stops the sweeper. Called automatically on drop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        debug!("Deletion sweeper stopped");
    }
}

impl Drop for DeleteSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweeper_loop(
    engine: Rc<RefCell<StorageEngine>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Deletion sweeper received shutdown signal");
                    return;
                }
            }
        }

        let (finalized, pending) = {
            let mut engine = engine.borrow_mut();
            let finalized = engine.sweep_deleted(Instant::now());
            (finalized, engine.pending_deletes())
        };

        if finalized > 0 {
            debug!(finalized, pending, "Deleted items finalized");
        } else {
            trace!(pending, "Deletion sweep found nothing due");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SlabConfig;
    use tokio::task::LocalSet;

    fn store(engine: &mut StorageEngine, key: &str) -> ItemId {
        let id = engine.allocate(key.as_bytes(), 0, None, 7).unwrap();
        engine.item_mut(id).value_mut().copy_from_slice(b"value\r\n");
        engine.link(id);
        id
    }

    #[test]
    fn test_take_due_keeps_order_of_rest() {
        let mut engine = StorageEngine::new(SlabConfig::default());
        let ids: Vec<ItemId> = (0..5).map(|i| store(&mut engine, &format!("k{i}"))).collect();

        let mut queue = DeleteQueue::new();
        for &id in &ids {
            queue.push(id);
        }

        let due = queue.take_due(|id| id == ids[1] || id == ids[3]);
        assert_eq!(due, vec![ids[1], ids[3]]);
        assert_eq!(queue.len(), 3);

        let rest = queue.take_due(|_| true);
        assert_eq!(rest, vec![ids[0], ids[2], ids[4]]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_finalizes_due_deletions() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let engine = Rc::new(RefCell::new(StorageEngine::new(SlabConfig::default())));
                let (due, waiting) = {
                    let mut engine = engine.borrow_mut();
                    let due = store(&mut engine, "due");
                    let waiting = store(&mut engine, "waiting");
                    let now = Instant::now();
                    engine.mark_deleted(due, now);
                    engine.mark_deleted(waiting, now + Duration::from_secs(3600));
                    (due, waiting)
                };

                let config = DeletionConfig {
                    interval: Duration::from_millis(10),
                    ..Default::default()
                };
                let _sweeper = DeleteSweeper::start(Rc::clone(&engine), config);

                tokio::time::sleep(Duration::from_millis(100)).await;

                let engine = engine.borrow();
                assert_eq!(engine.pending_deletes(), 1);
                assert!(!engine.item(due).is_deleted());
                assert_eq!(engine.item(due).refcount(), 0);
                assert!(engine.item(waiting).is_deleted());
                assert_eq!(engine.item(waiting).refcount(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_drop() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let engine = Rc::new(RefCell::new(StorageEngine::new(SlabConfig::default())));
                let config = DeletionConfig {
                    interval: Duration::from_millis(10),
                    ..Default::default()
                };

                {
                    let _sweeper = DeleteSweeper::start(Rc::clone(&engine), config);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                }

                let id = {
                    let mut engine = engine.borrow_mut();
                    let id = store(&mut engine, "key");
                    engine.mark_deleted(id, Instant::now());
                    id
                };

                tokio::time::sleep(Duration::from_millis(60)).await;

                // Nobody swept the queue
                let engine = engine.borrow();
                assert_eq!(engine.pending_deletes(), 1);
                assert!(engine.item(id).is_deleted());
            })
            .await;
    }
}
