//! Debounced single-writer persistence task.
//!
//! Every mutation sends `Dirty`; the writer waits until no message has arrived
//! for the debounce window and then stores the snapshot that is current at
//! write time. A burst of mutations therefore produces one write.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::store::SnapshotStore;
use super::types::WorkspaceSnapshot;
use crate::bus::{Event, EventBus};

pub(crate) type SharedSnapshot = Arc<Mutex<Option<WorkspaceSnapshot>>>;

pub(crate) enum PersistMsg {
    Dirty,
    /// Write now if anything is pending, then acknowledge.
    Flush(oneshot::Sender<Result<(), String>>),
}

pub(crate) struct PersistWriter {
    current: SharedSnapshot,
    store: Arc<dyn SnapshotStore>,
    bus: EventBus,
    debounce: Duration,
}

impl PersistWriter {
    pub(crate) fn spawn(
        current: SharedSnapshot,
        store: Arc<dyn SnapshotStore>,
        bus: EventBus,
        debounce: Duration,
    ) -> mpsc::UnboundedSender<PersistMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = Self {
            current,
            store,
            bus,
            debounce,
        };
        tokio::spawn(writer.run(rx));
        tx
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<PersistMsg>) {
        while let Some(msg) = rx.recv().await {
            let mut waiters = Vec::new();
            match msg {
                PersistMsg::Dirty => {}
                PersistMsg::Flush(ack) => {
                    // Nothing pending.
                    let _ = ack.send(Ok(()));
                    continue;
                }
            }

            let mut closed = false;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.debounce) => break,
                    next = rx.recv() => match next {
                        Some(PersistMsg::Dirty) => continue,
                        Some(PersistMsg::Flush(ack)) => {
                            waiters.push(ack);
                            break;
                        }
                        None => {
                            closed = true;
                            break;
                        }
                    },
                }
            }

            let result = self.write_current().await;
            for ack in waiters {
                let _ = ack.send(result.clone());
            }
            if closed {
                break;
            }
        }
        tracing::debug!("workspace writer stopped");
    }

    async fn write_current(&self) -> Result<(), String> {
        let snapshot = {
            let guard = self.current.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        let Some(snapshot) = snapshot else {
            return Ok(());
        };

        match self.store.set(&snapshot).await {
            Ok(()) => {
                tracing::debug!(workspace_id = %snapshot.id, files = snapshot.files.len(), "workspace saved");
                self.bus.publish(Event::WorkspaceSaved {
                    workspace_id: snapshot.id,
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!(workspace_id = %snapshot.id, error = %format!("{:#}", e), "workspace save failed");
                Err(format!("{:#}", e))
            }
        }
    }
}
