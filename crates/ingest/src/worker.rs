//! Store Writer Task
//!
//! The one task allowed to append. It consumes the bounded queue in order,
//! so appends are serialized no matter how the broker delivers messages.

use crate::stats::IngestStats;
use crate::{InboundMessage, IngestFault};
use std::sync::Arc;
use storage::StoreWriter;
use telemetry::Decoder;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub(crate) struct Worker {
    pub writer: StoreWriter,
    pub decoder: Decoder,
    pub stats: Arc<IngestStats>,
    pub faults: mpsc::Sender<IngestFault>,
}

impl Worker {
    /// Run until shutdown is signalled (then drain what is queued), the
    /// queue closes, or the store fails fatally.
    pub(crate) async fn run(
        mut self,
        mut queue: mpsc::Receiver<InboundMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Ingest worker started");
        let mut draining = false;

        loop {
            let next = if draining {
                queue.recv().await
            } else {
                tokio::select! {
                    message = queue.recv() => message,
                    _ = shutdown.changed() => {
                        debug!("Ingest worker draining {} queued messages", queue.len());
                        queue.close();
                        draining = true;
                        continue;
                    }
                }
            };

            let Some(message) = next else { break };

            if let Err(fault) = self.handle(message).await {
                error!("Ingest worker stopping: {}", fault);
                if self.faults.try_send(fault).is_err() {
                    warn!("Fault channel full or closed; fault not delivered");
                }
                break;
            }
        }

        info!("Ingest worker stopped");
    }

    /// Decode and append one message. Only fatal store errors escape.
    async fn handle(&mut self, message: InboundMessage) -> Result<(), IngestFault> {
        self.stats.record_received();

        let reading = match self
            .decoder
            .decode_at(&message.payload, &message.topic, message.received_at)
        {
            Ok(reading) => reading,
            Err(e) => {
                self.stats.record_discarded(e.reason_code());
                warn!(
                    topic = %message.topic,
                    reason = e.reason_code(),
                    "Discarding message: {}",
                    e
                );
                return Ok(());
            }
        };

        match self.writer.append(&reading).await {
            Ok(result) => {
                self.stats.record_accepted();
                debug!(
                    sensor_id = %reading.sensor_id,
                    seq = result.seq,
                    "Stored reading"
                );
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                self.stats.record_append_failure();
                Err(IngestFault::Store(e))
            }
            Err(e) => {
                self.stats.record_append_failure();
                warn!(sensor_id = %reading.sensor_id, "Reading dropped: {}", e);
                Ok(())
            }
        }
    }
}

/// Wait for the worker task to end and escalate a panic as a fault.
/// Cancellation is not a fault; stop aborts the task on purpose.
pub(crate) async fn supervise(task: JoinHandle<()>, faults: mpsc::Sender<IngestFault>) {
    let Err(e) = task.await else { return };
    if !e.is_panic() {
        return;
    }
    error!("Ingest worker panicked: {}", e);
    if faults.try_send(IngestFault::WorkerPanicked(e.to_string())).is_err() {
        warn!("Fault channel full or closed; fault not delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_panicked_worker_becomes_fault() {
        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn(async {
            tokio::task::yield_now().await;
            panic!("writer state corrupted");
        });

        supervise(task, tx).await;
        let fault = rx.try_recv().unwrap();
        assert!(matches!(fault, IngestFault::WorkerPanicked(_)));
    }

    #[tokio::test]
    async fn test_aborted_or_finished_worker_is_not_a_fault() {
        let (tx, mut rx) = mpsc::channel(4);

        let idle = tokio::spawn(tokio::time::sleep(Duration::from_secs(60)));
        let abort = idle.abort_handle();
        let supervisor = tokio::spawn(supervise(idle, tx.clone()));
        abort.abort();
        supervisor.await.unwrap();

        supervise(tokio::spawn(async {}), tx).await;
        assert!(rx.try_recv().is_err());
    }
}
