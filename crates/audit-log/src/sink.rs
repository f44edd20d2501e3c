use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::entry::AuditEntry;
use crate::writer::{AuditWriteError, AuditWriter};

const CHANNEL_BUFFER: usize = 1024;

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Cloneable handle feeding the background audit writer.
///
/// A sink built with [`AuditSink::disabled`] accepts entries and drops them,
/// so callers never need to branch on whether auditing is configured.
#[derive(Clone, Default)]
pub struct AuditSink {
    tx: Option<mpsc::Sender<AuditEntry>>,
}

impl AuditSink {
    /// Open the log at `path` and spawn the writer task.
    ///
    /// The task exits after a final flush once every clone of the sink has
    /// been dropped. Write errors are reported through `tracing` and the
    /// affected entry is skipped.
    pub async fn start(
        path: impl AsRef<Path>,
    ) -> Result<(Self, JoinHandle<()>), AuditWriteError> {
        let writer = AuditWriter::open(path).await?;
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        let handle = tokio::spawn(drain(writer, rx));
        Ok((Self { tx: Some(tx) }, handle))
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue an entry, waiting for channel capacity if the writer lags.
    pub async fn log(&self, entry: AuditEntry) {
        let Some(tx) = &self.tx else { return };
        if let Err(err) = tx.send(entry).await {
            tracing::warn!(event = ?err.0.event, "audit writer gone, entry dropped");
        }
    }

    /// Queue an entry without waiting; drops it if the channel is full.
    pub fn record(&self, entry: AuditEntry) {
        let Some(tx) = &self.tx else { return };
        if let Err(err) = tx.try_send(entry) {
            tracing::warn!(%err, "audit entry dropped");
        }
    }
}

async fn drain(mut writer: AuditWriter, mut rx: mpsc::Receiver<AuditEntry>) {
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut dirty = false;

    loop {
        tokio::select! {
            next = rx.recv() => match next {
                Some(entry) => match writer.append(&entry).await {
                    Ok(()) => dirty = true,
                    Err(err) => tracing::error!(%err, "failed to append audit entry"),
                },
                None => break,
            },
            _ = ticker.tick(), if dirty => {
                match writer.flush().await {
                    Ok(()) => dirty = false,
                    Err(err) => tracing::error!(%err, "periodic audit flush failed"),
                }
            }
        }
    }

    if dirty {
        if let Err(err) = writer.flush().await {
            tracing::error!(%err, "final audit flush failed");
        }
    }
    tracing::debug!("audit writer stopped");
}
