//! Bounded-concurrency fan-out for network-backed providers.
//!
//! Results land in a table indexed by submission position, so the output lines up
//! with the input no matter which call finishes first. Failures stay values at
//! their own position; nothing here retries.

use crate::cancel::CancelToken;
use crate::errors::ItemError;
use crate::model::ItemResult;
use crate::progress::{ProgressEvent, ProgressSink};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, warn};

pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct DispatchOptions {
    /// Maximum simultaneous in-flight `send` calls (values below 1 count as 1).
    pub concurrency_limit: usize,
    /// Per-call timeout; an expired call becomes a `transport`/`timeout` item error.
    pub call_timeout: Option<Duration>,
    /// How long in-flight calls may keep running after cancellation is observed.
    pub drain_timeout: Duration,
    pub cancel: CancelToken,
    pub progress: Option<ProgressSink>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY,
            call_timeout: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            cancel: CancelToken::new(),
            progress: None,
        }
    }
}

impl fmt::Debug for DispatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchOptions")
            .field("concurrency_limit", &self.concurrency_limit)
            .field("call_timeout", &self.call_timeout)
            .field("drain_timeout", &self.drain_timeout)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl DispatchOptions {
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn with_call_timeout(mut self, limit: Duration) -> Self {
        self.call_timeout = Some(limit);
        self
    }

    pub fn with_drain_timeout(mut self, limit: Duration) -> Self {
        self.drain_timeout = limit;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }
}

/// Fixed-size table of results indexed by submission position.
struct ResultTable<R> {
    slots: Vec<Option<ItemResult<R>>>,
    done: usize,
    failed: usize,
    lost: usize,
}

impl<R> ResultTable<R> {
    fn new(total: usize) -> Self {
        Self {
            slots: (0..total).map(|_| None).collect(),
            done: 0,
            failed: 0,
            lost: 0,
        }
    }

    fn collect(
        &mut self,
        joined: Result<(usize, ItemResult<R>), JoinError>,
        progress: Option<&ProgressSink>,
    ) {
        match joined {
            Ok((index, result)) => {
                if result.is_err() {
                    self.failed += 1;
                }
                self.slots[index] = Some(result);
            }
            Err(e) => {
                // Index unknown for aborted or panicked workers; filled in `finish`.
                if e.is_panic() {
                    warn!(error = %e, "dispatch worker panicked");
                }
                self.lost += 1;
            }
        }
        self.done += 1;
        if let Some(sink) = progress {
            sink(ProgressEvent {
                done: self.done,
                total: self.slots.len(),
            });
        }
    }

    fn finish(self, cancelled: bool) -> Vec<ItemResult<R>> {
        self.slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    if cancelled {
                        Err(ItemError::cancelled())
                    } else {
                        Err(ItemError::internal("dispatch worker terminated abnormally"))
                    }
                })
            })
            .collect()
    }
}

/// Send every payload through `send` with at most `concurrency_limit` calls in
/// flight. Returns exactly one result per payload, in input order.
pub async fn dispatch<P, R, F, Fut>(
    payloads: Vec<P>,
    send: F,
    options: &DispatchOptions,
) -> Vec<ItemResult<R>>
where
    P: Send + 'static,
    R: Send + 'static,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ItemResult<R>> + Send + 'static,
{
    let total = payloads.len();
    let mut table = ResultTable::new(total);
    if total == 0 {
        return Vec::new();
    }

    let limit = options.concurrency_limit.max(1);
    let sem = Arc::new(Semaphore::new(limit));
    let send = Arc::new(send);
    let progress = options.progress.as_ref();
    let mut join_set: JoinSet<(usize, ItemResult<R>)> = JoinSet::new();
    let mut cancelled = false;
    let mut submitted = 0usize;

    for (index, payload) in payloads.into_iter().enumerate() {
        let permit = loop {
            tokio::select! {
                biased;
                _ = options.cancel.cancelled() => break None,
                Some(joined) = join_set.join_next(), if !join_set.is_empty() => {
                    table.collect(joined, progress);
                }
                permit = sem.clone().acquire_owned() => break permit.ok(),
            }
        };
        let Some(permit) = permit else {
            cancelled = true;
            break;
        };

        let send = Arc::clone(&send);
        let cancel = options.cancel.clone();
        let call_timeout = options.call_timeout;
        join_set.spawn(async move {
            let _permit = permit;
            if cancel.is_cancelled() {
                return (index, Err(ItemError::cancelled()));
            }
            let call = send(payload);
            let result = match call_timeout {
                Some(limit) => match timeout(limit, call).await {
                    Ok(r) => r,
                    Err(_) => Err(ItemError::timeout(limit)),
                },
                None => call.await,
            };
            (index, result)
        });
        submitted += 1;
    }

    if cancelled {
        debug!(
            submitted,
            not_started = total - submitted,
            "dispatch cancelled; pending items will not start"
        );
    }

    let mut deadline = cancelled.then(|| Instant::now() + options.drain_timeout);
    let mut aborted = false;
    while !join_set.is_empty() {
        tokio::select! {
            biased;
            joined = join_set.join_next() => {
                if let Some(joined) = joined {
                    table.collect(joined, progress);
                }
            }
            _ = options.cancel.cancelled(), if deadline.is_none() => {
                cancelled = true;
                deadline = Some(Instant::now() + options.drain_timeout);
                debug!(in_flight = join_set.len(), "dispatch cancelled; draining in-flight calls");
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() && !aborted => {
                warn!(
                    abandoned = join_set.len(),
                    drain_timeout = ?options.drain_timeout,
                    "drain timeout elapsed; abandoning in-flight calls"
                );
                join_set.abort_all();
                aborted = true;
            }
        }
    }

    let failed = table.failed + table.lost + (total - submitted);
    debug!(total, succeeded = total - failed, failed, "dispatch finished");
    table.finish(cancelled)
}
