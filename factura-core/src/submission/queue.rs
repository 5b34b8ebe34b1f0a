//! Background worker that runs submissions off the request path.
use super::{SubmissionOutcome, SubmissionRunner};
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("submission worker is not running; invoice {0} was not queued")]
pub struct QueueClosed(pub String);

/// Sending side of the submission channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SubmissionQueue {
    tx: mpsc::UnboundedSender<String>,
}

impl SubmissionQueue {
    /// Queue an invoice id. Only fails once the worker has stopped.
    pub fn enqueue(&self, invoice_id: impl Into<String>) -> Result<(), QueueClosed> {
        self.tx
            .send(invoice_id.into())
            .map_err(|mpsc::error::SendError(id)| QueueClosed(id))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Handle to the running worker task.
///
/// Dropping it without calling [`SubmissionWorker::shutdown`] also stops
/// intake; jobs already started keep running detached.
#[derive(Debug)]
pub struct SubmissionWorker {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<usize>,
}

impl SubmissionWorker {
    /// Start a worker on the current runtime.
    pub fn spawn(runner: Arc<dyn SubmissionRunner>) -> (SubmissionQueue, SubmissionWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(worker_loop(runner, rx, shutdown_rx));
        (
            SubmissionQueue { tx },
            SubmissionWorker {
                shutdown: Some(shutdown_tx),
                handle,
            },
        )
    }

    /// Stop accepting jobs, run everything already queued and wait for all
    /// jobs to finish. Returns how many jobs the worker ran in total.
    pub async fn shutdown(mut self) -> usize {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match (&mut self.handle).await {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, "submission worker panicked");
                0
            }
        }
    }
}

async fn worker_loop(
    runner: Arc<dyn SubmissionRunner>,
    mut rx: mpsc::UnboundedReceiver<String>,
    mut shutdown: oneshot::Receiver<()>,
) -> usize {
    let mut tasks = JoinSet::new();
    let mut started = 0usize;
    loop {
        tokio::select! {
            job = rx.recv() => match job {
                Some(invoice_id) => {
                    started += 1;
                    spawn_job(&mut tasks, runner.clone(), invoice_id);
                }
                None => break,
            },
            _ = &mut shutdown => {
                rx.close();
                while let Some(invoice_id) = rx.recv().await {
                    started += 1;
                    spawn_job(&mut tasks, runner.clone(), invoice_id);
                }
                break;
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join(joined),
        }
    }
    info!(pending = tasks.len(), "submission worker draining");
    while let Some(joined) = tasks.join_next().await {
        log_join(joined);
    }
    started
}

fn spawn_job(
    tasks: &mut JoinSet<SubmissionOutcome>,
    runner: Arc<dyn SubmissionRunner>,
    invoice_id: String,
) {
    tasks.spawn(async move {
        let outcome = runner.run(&invoice_id).await;
        debug!(invoice_id = %invoice_id, ?outcome, "submission finished");
        outcome
    });
}

fn log_join(joined: Result<SubmissionOutcome, tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "submission task panicked");
    }
}
