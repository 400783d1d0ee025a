//! Fire-and-forget remote writes.
//!
//! The optimistic-UI contract: the local mutation has already committed by
//! the time a write lands here, and nothing ever rolls it back. Each write
//! runs on a blocking task and reports a `WriteOutcome` on a channel, which
//! is the seam for adding retry-with-backoff later without touching the
//! mutation call sites. Failures are also logged.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::SyncResult;
use crate::gateway::{RemoteGateway, Table};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Update,
    Upsert,
    Delete,
}

#[derive(Debug)]
pub enum WriteOp {
    Insert { table: Table, id: String, row: Value },
    Update { table: Table, id: String, patch: Value },
    Upsert { table: Table, id: String, row: Value },
    Delete { table: Table, id: String },
}

impl WriteOp {
    pub fn table(&self) -> Table {
        match self {
            WriteOp::Insert { table, .. }
            | WriteOp::Update { table, .. }
            | WriteOp::Upsert { table, .. }
            | WriteOp::Delete { table, .. } => *table,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            WriteOp::Insert { id, .. }
            | WriteOp::Update { id, .. }
            | WriteOp::Upsert { id, .. }
            | WriteOp::Delete { id, .. } => id,
        }
    }

    pub fn kind(&self) -> WriteKind {
        match self {
            WriteOp::Insert { .. } => WriteKind::Insert,
            WriteOp::Update { .. } => WriteKind::Update,
            WriteOp::Upsert { .. } => WriteKind::Upsert,
            WriteOp::Delete { .. } => WriteKind::Delete,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WriteOutcome {
    pub table: Table,
    pub kind: WriteKind,
    pub id: String,
    pub error: Option<String>,
}

impl WriteOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

pub struct WriteQueue {
    gateway: Arc<dyn RemoteGateway>,
    outcome_tx: mpsc::UnboundedSender<WriteOutcome>,
    outcome_rx: Mutex<Option<mpsc::UnboundedReceiver<WriteOutcome>>>,
    pending: Arc<AtomicUsize>,
}

impl WriteQueue {
    pub fn new(gateway: Arc<dyn RemoteGateway>) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            gateway,
            outcome_tx,
            outcome_rx: Mutex::new(Some(outcome_rx)),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Hand out the outcome receiver. First caller wins; the queue keeps
    /// working (and logging) if nobody ever takes it.
    pub fn take_outcomes(&self) -> Option<mpsc::UnboundedReceiver<WriteOutcome>> {
        self.outcome_rx.lock().unwrap().take()
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Issue the write in the background. The caller returns immediately;
    /// the outcome is observable on the channel.
    pub fn enqueue(&self, op: WriteOp) {
        let table = op.table();
        let kind = op.kind();
        let id = op.id().to_string();
        let gateway = Arc::clone(&self.gateway);
        let tx = self.outcome_tx.clone();
        let pending = Arc::clone(&self.pending);
        pending.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || execute(gateway.as_ref(), op)).await;
            let error = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(format!("write task failed: {e}")),
            };
            if let Some(msg) = &error {
                tracing::warn!(table = %table, id = %id, "remote write failed: {msg}");
            }
            pending.fetch_sub(1, Ordering::SeqCst);
            let _ = tx.send(WriteOutcome {
                table,
                kind,
                id,
                error,
            });
        });
    }
}

fn execute(gateway: &dyn RemoteGateway, op: WriteOp) -> SyncResult<()> {
    match op {
        WriteOp::Insert { table, row, .. } => gateway.insert(table, row),
        WriteOp::Update { table, id, patch } => gateway.update(table, &id, patch),
        WriteOp::Upsert { table, row, .. } => gateway.upsert(table, table.conflict_target(), row),
        WriteOp::Delete { table, id } => gateway.delete(table, &id),
    }
}
