//! Priority request queue with single-flight execution.
//!
//! Tasks run one at a time on a spawned drain loop. Entries are ordered by
//! tier, then by arrival. A task that reports `RateLimited` delays the next
//! task by an exponential backoff.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use futures::future::{AbortHandle, Abortable};
use tracing::{debug, warn};

use crate::config::ConnectConfig;
use crate::error::{Nip46Error, Nip46Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    fn tier(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

type Task<T> = Pin<Box<dyn Future<Output = Nip46Result<T>> + Send>>;
type Responder<T> = oneshot::Sender<Nip46Result<T>>;

struct QueueEntry<T> {
    task: Task<T>,
    priority: Priority,
    enqueued_at: Instant,
    responder: Responder<T>,
}

struct InFlight<T> {
    abort: AbortHandle,
    responder: Option<Responder<T>>,
}

struct QueueState<T> {
    tiers: [VecDeque<QueueEntry<T>>; 3],
    in_flight: Option<InFlight<T>>,
    draining: bool,
    rate_limited_streak: u32,
}

impl<T> QueueState<T> {
    fn pop_next(&mut self) -> Option<QueueEntry<T>> {
        self.tiers.iter_mut().find_map(VecDeque::pop_front)
    }

    fn queued(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }
}

struct QueueInner<T> {
    state: Mutex<QueueState<T>>,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
}

impl<T> QueueInner<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn backoff(&self, streak: u32) -> Duration {
        let factor = 1u64.checked_shl(streak.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor).min(self.backoff_max_ms))
    }
}

/// Serialises RPC work for one session.
pub struct RequestQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for RequestQueue<T> {
    fn clone(&self) -> Self {
        RequestQueue {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> RequestQueue<T> {
    pub fn new(backoff_base_ms: u64, backoff_max_ms: u64) -> Self {
        RequestQueue {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    tiers: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                    in_flight: None,
                    draining: false,
                    rate_limited_streak: 0,
                }),
                backoff_base_ms,
                backoff_max_ms,
            }),
        }
    }

    pub fn from_config(config: &ConnectConfig) -> Self {
        Self::new(config.backoff_base_ms, config.backoff_max_ms)
    }

    /// Queue `task` and return a future for its result.
    ///
    /// The entry is placed synchronously, so ordering follows call order even
    /// if the returned futures are polled later. Must be called within a
    /// tokio runtime.
    pub fn enqueue<F>(&self, priority: Priority, task: F) -> impl Future<Output = Nip46Result<T>> + Send + 'static
    where
        F: Future<Output = Nip46Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let spawn_drain = {
            let mut state = self.inner.lock();
            state.tiers[priority.tier()].push_back(QueueEntry {
                task: Box::pin(task),
                priority,
                enqueued_at: Instant::now(),
                responder: tx,
            });
            !std::mem::replace(&mut state.draining, true)
        };

        if spawn_drain {
            tokio::spawn(drain(self.inner.clone()));
        }

        async move { rx.await.unwrap_or(Err(Nip46Error::Cancelled)) }
    }

    /// Reject every queued entry and the in-flight entry with `error`,
    /// aborting the in-flight task.
    pub fn clear(&self, error: Nip46Error) {
        let (queued, in_flight) = {
            let mut state = self.inner.lock();
            let queued: Vec<QueueEntry<T>> = state.tiers.iter_mut().flat_map(|tier| tier.drain(..)).collect();
            state.rate_limited_streak = 0;
            (queued, state.in_flight.take())
        };

        if !queued.is_empty() {
            debug!("[nip46] clearing {} queued request(s): {}", queued.len(), error);
        }
        for entry in queued {
            let _ = entry.responder.send(Err(error.clone()));
        }
        if let Some(mut in_flight) = in_flight {
            in_flight.abort.abort();
            if let Some(responder) = in_flight.responder.take() {
                let _ = responder.send(Err(error.clone()));
            }
        }
    }

    /// Queued entries, excluding the one in flight.
    pub fn len(&self) -> usize {
        self.inner.lock().queued()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_idle(&self) -> bool {
        let state = self.inner.lock();
        !state.draining && state.in_flight.is_none() && state.queued() == 0
    }
}

async fn drain<T: Send + 'static>(inner: Arc<QueueInner<T>>) {
    loop {
        // Entries stay in their tier during the backoff so `clear` still sees them.
        let streak = {
            let mut state = inner.lock();
            if state.queued() == 0 {
                state.draining = false;
                return;
            }
            state.rate_limited_streak
        };
        if streak > 0 {
            let delay = inner.backoff(streak);
            warn!("[nip46] rate limited, backing off {:?} before next request", delay);
            tokio::time::sleep(delay).await;
        }

        let entry = {
            let mut state = inner.lock();
            match state.pop_next() {
                Some(entry) => entry,
                None => {
                    state.draining = false;
                    return;
                }
            }
        };

        let QueueEntry {
            task,
            priority,
            enqueued_at,
            responder,
        } = entry;
        debug!(
            "[nip46] running {:?} request after {:?} in queue",
            priority,
            enqueued_at.elapsed()
        );

        let (abort, registration) = AbortHandle::new_pair();
        inner.lock().in_flight = Some(InFlight {
            abort,
            responder: Some(responder),
        });

        let outcome = Abortable::new(task, registration).await;

        let responder = {
            let mut state = inner.lock();
            let responder = state.in_flight.take().and_then(|mut f| f.responder.take());
            match &outcome {
                Ok(Err(Nip46Error::RateLimited(_))) => state.rate_limited_streak += 1,
                Ok(_) => state.rate_limited_streak = 0,
                Err(_) => {}
            }
            responder
        };

        match (outcome, responder) {
            (Ok(result), Some(responder)) => {
                let _ = responder.send(result);
            }
            (Err(_aborted), _) => debug!("[nip46] in-flight request aborted"),
            (Ok(_), None) => {}
        }
    }
}
