use crate::{DeviceId, QueueError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Per-device FIFO of asynchronous tasks.
///
/// Tasks for one device run strictly one at a time in submission order; tasks
/// for different devices run concurrently. A failing or panicking task settles
/// its own future and the queue moves on to the next one.
#[derive(Default)]
pub struct DeviceQueue {
    workers: Mutex<HashMap<DeviceId, mpsc::UnboundedSender<Job>>>,
}

impl DeviceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `task` to the device's queue.
    ///
    /// The task is queued when this is called, not when the returned future is
    /// first polled, so call order fixes execution order. The worker for a
    /// device is spawned on first use; a tokio runtime must be running.
    pub fn enqueue<T, F>(
        &self,
        device: &DeviceId,
        task: F,
    ) -> impl Future<Output = Result<T, QueueError>> + Send + 'static
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = tx.send(task.await);
        });

        let sent = {
            let mut workers = self.workers.lock();
            let sender = workers
                .entry(device.clone())
                .or_insert_with(|| spawn_worker(device.clone()));
            match sender.send(job) {
                Ok(()) => true,
                Err(mpsc::error::SendError(job)) => {
                    // Worker gone; replace it and retry once.
                    let fresh = spawn_worker(device.clone());
                    let ok = fresh.send(job).is_ok();
                    *sender = fresh;
                    ok
                }
            }
        };

        let device = device.clone();
        async move {
            if !sent {
                return Err(QueueError::Closed(device));
            }
            rx.await.map_err(|_| QueueError::TaskFailed(device))
        }
    }

    /// Stop accepting work for `device`. Tasks already queued still run.
    pub fn close(&self, device: &DeviceId) {
        if self.workers.lock().remove(device).is_some() {
            tracing::debug!(device = %device, "queue closed");
        }
    }

    pub fn is_open(&self, device: &DeviceId) -> bool {
        self.workers.lock().contains_key(device)
    }
}

fn spawn_worker(device: DeviceId) -> mpsc::UnboundedSender<Job> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            // A panic stays inside the spawned task; its oneshot drops unsent.
            if let Err(e) = tokio::spawn(job).await {
                tracing::warn!(device = %device, error = %e, "queued task aborted");
            }
        }
        tracing::trace!(device = %device, "queue worker exiting");
    });
    tx
}
