//! Queued writes that the caller does not have to wait for.
//!
//! Jobs run one at a time on a single worker task, in submission order. Every
//! submission hands back a [`WriteTicket`]; dropping it is allowed, the
//! outcome is still logged.

use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info};

use crate::store::StoreError;

type WriteJob = Pin<Box<dyn Future<Output = Result<Value, StoreError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("background writer is closed")]
    Closed,
    #[error("background write was abandoned before completing")]
    Abandoned,
    #[error(transparent)]
    Store(#[from] StoreError),
}

enum Message {
    Write {
        label: String,
        job: WriteJob,
        done: oneshot::Sender<Result<Value, WriterError>>,
    },
    Flush(oneshot::Sender<()>),
}

/// Completion channel of one queued write.
#[derive(Debug)]
pub struct WriteTicket {
    receiver: oneshot::Receiver<Result<Value, WriterError>>,
}

impl WriteTicket {
    /// Waits for the write to finish and returns its outcome.
    pub async fn wait(self) -> Result<Value, WriterError> {
        self.receiver.await.unwrap_or(Err(WriterError::Abandoned))
    }
}

/// Handle to the write queue. Clones feed the same worker.
///
/// The worker exits once every handle is dropped and the queue is drained.
#[derive(Clone, Debug)]
pub struct BackgroundWriter {
    sender: mpsc::Sender<Message>,
}

impl BackgroundWriter {
    /// Spawns the worker task with a queue of `capacity` pending messages.
    pub fn spawn(capacity: usize) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_worker(receiver));
        (Self { sender }, handle)
    }

    /// Queues a write. Waits only for queue space, never for the write itself.
    pub async fn submit<F>(&self, label: impl Into<String>, job: F) -> Result<WriteTicket, WriterError>
    where
        F: Future<Output = Result<Value, StoreError>> + Send + 'static,
    {
        let (done, receiver) = oneshot::channel();
        let label = label.into();
        debug!(%label, "Queueing background write");
        self.sender
            .send(Message::Write {
                label,
                job: Box::pin(job),
                done,
            })
            .await
            .map_err(|_| WriterError::Closed)?;
        Ok(WriteTicket { receiver })
    }

    /// Resolves once every write submitted before this call has completed.
    pub async fn flush(&self) -> Result<(), WriterError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Message::Flush(tx))
            .await
            .map_err(|_| WriterError::Closed)?;
        rx.await.map_err(|_| WriterError::Closed)
    }
}

async fn run_worker(mut receiver: mpsc::Receiver<Message>) {
    info!("Background writer started");
    while let Some(message) = receiver.recv().await {
        match message {
            Message::Write { label, job, done } => {
                let outcome = job.await.map_err(WriterError::from);
                match &outcome {
                    Ok(_) => debug!(%label, "Background write completed"),
                    Err(e) => error!(%label, error = %e, "Background write failed"),
                }
                // The submitter may have dropped its ticket.
                let _ = done.send(outcome);
            }
            Message::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    info!("Background writer stopped");
}
