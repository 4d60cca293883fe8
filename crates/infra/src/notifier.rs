//! Status polling loop behind the server-push stream.
//!
//! One task per watcher. Each tick reads the status record and forwards it only when it
//! moved forward since the last frame. The loop ends after a terminal status, after a
//! store error (one `Error` frame), or as soon as the receiving side goes away, even in the
//! middle of an inter-poll wait.
//!
//! The submitter already knows the job is pending, so `pending` is never sent.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use postline_core::{UploadId, UploadStatus};

use crate::status_store::UploadStatusStore;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusFrame {
    Status(UploadStatus),
    /// The store could not be read; the stream ends after this frame.
    Error(String),
}

/// Start watching `id`. Must be called from within a tokio runtime.
pub fn watch(
    store: UploadStatusStore,
    id: UploadId,
    interval: Duration,
) -> (mpsc::Receiver<StatusFrame>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(4);
    let task = tokio::spawn(poll_loop(store, id, interval, tx));
    (rx, task)
}

async fn poll_loop(
    store: UploadStatusStore,
    id: UploadId,
    interval: Duration,
    tx: mpsc::Sender<StatusFrame>,
) {
    let mut last_sent = UploadStatus::Pending;

    loop {
        let read = {
            let store = store.clone();
            let id = id.clone();
            tokio::task::spawn_blocking(move || store.get(&id)).await
        };

        let status = match read {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!(upload_id = %id, error = %e, "status read failed, closing stream");
                let _ = tx.send(StatusFrame::Error(e.to_string())).await;
                return;
            }
            Err(e) => {
                warn!(upload_id = %id, error = %e, "status read task failed, closing stream");
                let _ = tx.send(StatusFrame::Error("status lookup aborted".to_string())).await;
                return;
            }
        };

        // An expired record reads as pending again; never move backwards.
        if last_sent.can_transition_to(status) {
            if tx.send(StatusFrame::Status(status)).await.is_err() {
                debug!(upload_id = %id, "watcher gone");
                return;
            }
            last_sent = status;
        }

        if last_sent.is_terminal() {
            debug!(upload_id = %id, status = %last_sent, "terminal status sent, closing stream");
            return;
        }

        tokio::select! {
            _ = tx.closed() => {
                debug!(upload_id = %id, "watcher gone");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
