//! Connection managers: timeout and retry policy around a [`Transport`].
//!
//! Two flavours exist per client:
//!
//! - [`SubscribeManager`] owns a background worker that runs one request at
//!   a time and reports back over a channel. [`SubscribeManager::reset_and_abort`]
//!   cancels the in-flight request and anything queued behind it.
//! - [`NonSubscribeManager`] runs each request on the caller's task with
//!   its own retry budget; requests never share state.
//!
//! ```text
//!  engine ──queue(req)──► job_tx ──► worker ──transport.get()──► service
//!     ▲                                │
//!     └──────── ManagerEvent ◄─────────┘   (TimedOut / Finished)
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::request::Request;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub request_timeout: Duration,
    /// Attempts after the first. Zero means a single attempt.
    pub max_retries: u32,
    pub retry_interval: Duration,
}

impl RetryPolicy {
    pub fn subscribe(config: &crate::config::ClientConfig) -> Self {
        Self {
            request_timeout: config.subscribe_timeout,
            max_retries: config.max_retries,
            retry_interval: config.retry_interval,
        }
    }

    pub fn non_subscribe(config: &crate::config::ClientConfig) -> Self {
        Self {
            request_timeout: config.non_subscribe_timeout,
            max_retries: 0,
            retry_interval: config.retry_interval,
        }
    }
}

/// Run `url` under `policy`. `on_timeout` is told about every attempt that
/// timed out, including the last one. Returns [`Error::Timeout`] when the
/// final attempt timed out, otherwise the last transport error.
async fn execute<T, F>(transport: &T, url: &str, policy: RetryPolicy, mut on_timeout: F) -> Result<String>
where
    T: Transport,
    F: FnMut(u32),
{
    let mut attempt = 0u32;
    loop {
        let err = match tokio::time::timeout(policy.request_timeout, transport.get(url)).await {
            Ok(Ok(body)) => return Ok(body),
            Ok(Err(err)) => {
                tracing::warn!(attempt, error = %err, "request failed");
                err
            }
            Err(_) => {
                tracing::debug!(attempt, timeout = ?policy.request_timeout, "request timed out");
                on_timeout(attempt);
                Error::Timeout
            }
        };

        if attempt >= policy.max_retries {
            return Err(err);
        }
        attempt += 1;
        tokio::time::sleep(policy.retry_interval).await;
    }
}

/// Reports from the subscribe worker.
#[derive(Debug)]
pub enum ManagerEvent {
    /// One attempt timed out; the worker may still retry.
    TimedOut { request: Request, attempt: u32 },
    /// The request is done, successfully or after exhausting its retries.
    Finished { request: Request, result: Result<String> },
}

struct Job {
    request: Request,
    epoch: u64,
    /// Wait before the first attempt.
    delay: Duration,
}

/// Single-flight manager for the long-poll stream.
pub struct SubscribeManager {
    policy: Arc<RwLock<RetryPolicy>>,
    epoch: watch::Sender<u64>,
    job_tx: mpsc::UnboundedSender<Job>,
    worker: JoinHandle<()>,
}

impl SubscribeManager {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn spawn<T: Transport>(
        transport: Arc<T>,
        policy: RetryPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<ManagerEvent>) {
        let policy = Arc::new(RwLock::new(policy));
        let (epoch, epoch_rx) = watch::channel(0u64);
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(run_worker(
            transport,
            Arc::clone(&policy),
            job_rx,
            epoch_rx,
            event_tx,
        ));

        (
            Self {
                policy,
                epoch,
                job_tx,
                worker,
            },
            event_rx,
        )
    }

    pub fn queue(&self, request: Request) {
        self.queue_after(request, Duration::ZERO);
    }

    /// Like [`queue`](Self::queue), but the worker sits out `delay` first.
    /// An abort during the wait cancels the job.
    pub fn queue_after(&self, request: Request, delay: Duration) {
        let epoch = *self.epoch.borrow();
        if self.job_tx.send(Job { request, epoch, delay }).is_err() {
            tracing::warn!("subscribe worker is gone, request dropped");
        }
    }

    /// Cancel whatever is in flight or queued. Once this returns, no
    /// [`ManagerEvent`] is emitted for those requests.
    pub fn reset_and_abort(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    pub fn policy(&self) -> RetryPolicy {
        *self.policy.read()
    }

    pub fn set_request_timeout(&self, timeout: Duration) {
        self.policy.write().request_timeout = timeout;
    }

    pub fn set_max_retries(&self, max_retries: u32) {
        self.policy.write().max_retries = max_retries;
    }

    pub fn set_retry_interval(&self, interval: Duration) {
        self.policy.write().retry_interval = interval;
    }
}

impl Drop for SubscribeManager {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_worker<T: Transport>(
    transport: Arc<T>,
    policy: Arc<RwLock<RetryPolicy>>,
    mut job_rx: mpsc::UnboundedReceiver<Job>,
    epoch_rx: watch::Receiver<u64>,
    event_tx: mpsc::UnboundedSender<ManagerEvent>,
) {
    while let Some(Job {
        request,
        epoch,
        delay,
    }) = job_rx.recv().await
    {
        let mut abort_rx = epoch_rx.clone();
        if *abort_rx.borrow_and_update() != epoch {
            tracing::debug!("skipping request aborted before it started");
            continue;
        }

        let url = request.url();
        tracing::debug!(%url, ?delay, "subscribe request started");

        let live = epoch_rx.clone();
        let still_current = || *live.borrow() == epoch;
        let on_timeout = |attempt| {
            if still_current() {
                let _ = event_tx.send(ManagerEvent::TimedOut {
                    request: request.clone(),
                    attempt,
                });
            }
        };

        tokio::select! {
            biased;
            _ = abort_rx.changed() => {
                tracing::debug!(%url, "in-flight request aborted");
            }
            result = async {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let current_policy = *policy.read();
                execute(transport.as_ref(), &url, current_policy, on_timeout).await
            } => {
                if still_current() {
                    let _ = event_tx.send(ManagerEvent::Finished {
                        request: request.clone(),
                        result,
                    });
                } else {
                    tracing::debug!(%url, "discarding result of aborted request");
                }
            }
        }
    }
}

/// Independent per-request executor for one-shot calls.
pub struct NonSubscribeManager<T> {
    transport: Arc<T>,
    policy: RwLock<RetryPolicy>,
}

impl<T: Transport> NonSubscribeManager<T> {
    pub fn new(transport: Arc<T>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy: RwLock::new(policy),
        }
    }

    pub async fn request(&self, request: &Request) -> Result<String> {
        let url = request.url();
        let policy = *self.policy.read();
        tracing::debug!(%url, kind = ?request.kind, "request started");
        execute(self.transport.as_ref(), &url, policy, |_| {}).await
    }

    pub fn set_request_timeout(&self, timeout: Duration) {
        self.policy.write().request_timeout = timeout;
    }
}
