use super::SyncManager;
use crate::engine::MutationSink;
use crate::models::SessionMutation;
use crate::Database;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

enum WriterCommand {
    Apply(SessionMutation),
    Flush(oneshot::Sender<()>),
}

/// Hands state-machine mutations to a worker task that talks to the ledger, so a
/// transition never waits on the network. Mutations are applied in submit order.
pub struct LedgerWriter {
    tx: mpsc::UnboundedSender<WriterCommand>,
    /// Fallback when the worker is gone
    db: Arc<Database>,
}

impl LedgerWriter {
    /// Must be called inside a tokio runtime.
    pub fn spawn(sync: Arc<SyncManager>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriterCommand>();
        let db = sync.db.clone();
        let handle = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    WriterCommand::Apply(mutation) => {
                        if let Err(e) = sync.apply_mutation(&mutation).await {
                            error!(
                                "[SYNC] Could not apply or queue mutation for session {}: {}",
                                mutation.session_id(),
                                e
                            );
                        }
                    }
                    WriterCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("[SYNC] Ledger writer stopped");
        });
        (Self { tx, db }, handle)
    }
}

#[async_trait]
impl MutationSink for LedgerWriter {
    fn submit(&self, mutation: SessionMutation) {
        if let Err(mpsc::error::SendError(command)) = self.tx.send(WriterCommand::Apply(mutation))
        {
            if let WriterCommand::Apply(mutation) = command {
                warn!(
                    "[SYNC] Ledger writer stopped, queueing session {} for replay",
                    mutation.session_id()
                );
                if let Err(e) = self.db.enqueue_mutation(&mutation) {
                    error!("[DB] Failed to queue mutation: {}", e);
                }
            }
        }
    }

    async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriterCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}
