//! Per-user sliding-window flood control.
//!
//! A user may hold at most `max_requests` entries in the queue, and an entry
//! leaves the queue once it is older than `window_seconds`. All state lives in
//! the [`WindowStore`]; the engine only decides, so any number of engines may
//! share one store.

use crate::clock::{Clock, SystemClock};
use crate::config::FloodControlConfig;
use crate::entry::Entry;
use crate::error::{FloodControlError, Result};
use crate::store::{with_deadline, CounterDrift, PopOutcome, WindowStore};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[async_trait]
pub trait FloodControl: Send + Sync {
    /// Returns `false` once the user has reached the request limit for the window.
    async fn check(&self, user_id: i64) -> Result<bool>;

    /// Checks and records a request at the current time as one atomic step.
    async fn add_request(&self, user_id: i64) -> Result<bool>;

    /// Records a request for `user_id` at `timestamp` (Unix seconds) unconditionally.
    async fn insert_request(&self, user_id: i64, timestamp: i64) -> Result<()>;

    /// Evicts every request older than the window from the head of the queue.
    async fn remove_old_requests(&self) -> Result<SweepReport>;

    /// The oldest recorded request, if any.
    async fn get_top_request(&self) -> Result<Option<Entry>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    pub drift_repaired: usize,
}

pub struct SlidingWindowFloodControl<S, C = SystemClock> {
    store: Arc<S>,
    clock: C,
    window_seconds: i64,
    limit: u64,
    sweep_on_check: bool,
    store_timeout: Duration,
    sweep_lock: Mutex<()>,
}

impl<S: WindowStore + 'static> SlidingWindowFloodControl<S, SystemClock> {
    pub fn new(store: S, config: &FloodControlConfig) -> Result<Self> {
        Self::with_clock(store, SystemClock, config)
    }
}

impl<S: WindowStore + 'static, C: Clock> SlidingWindowFloodControl<S, C> {
    pub fn with_clock(store: S, clock: C, config: &FloodControlConfig) -> Result<Self> {
        config.validate().map_err(FloodControlError::InvalidArgument)?;

        Ok(SlidingWindowFloodControl {
            store: Arc::new(store),
            clock,
            window_seconds: config.window_seconds as i64,
            limit: config.max_requests,
            sweep_on_check: config.sweep_on_check,
            store_timeout: config.store_timeout(),
            sweep_lock: Mutex::new(()),
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds as u64)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// The user's occupancy counter as currently stored.
    pub async fn occupancy(&self, user_id: i64) -> Result<i64> {
        let count = self
            .timed("counter_get", self.store.counter_get(user_id))
            .await?;
        if count < 0 {
            return Err(FloodControlError::InvariantViolation {
                user_id,
                detail: format!("occupancy counter is negative ({})", count),
            });
        }
        Ok(count)
    }

    pub async fn queue_length(&self) -> Result<u64> {
        self.timed("queue_length", self.store.queue_length()).await
    }

    /// Recomputes every occupancy counter from the queue, repairing drift.
    pub async fn reconcile(&self) -> Result<Vec<CounterDrift>> {
        let drift = self.timed("reconcile", self.store.reconcile()).await?;
        for d in &drift {
            warn!(
                "Repaired occupancy counter for user {}: recorded {}, queue holds {}",
                d.user_id, d.recorded, d.actual
            );
        }
        Ok(drift)
    }

    /// Removes the head of the queue if, and only if, it cannot be decoded.
    ///
    /// Returns the discarded token. The entry's owner is unknown, so its
    /// counter is left to the next reconciliation.
    pub async fn discard_corrupt_head(&self) -> Result<Option<String>> {
        let _sweep = self.sweep_lock.lock().await;

        let head = match self
            .timed("queue_peek_head", self.store.queue_peek_head())
            .await?
        {
            Some(head) => head,
            None => return Ok(None),
        };
        if head.parse::<Entry>().is_ok() {
            return Ok(None);
        }

        let popped = self
            .timed("queue_pop_head", self.store.queue_pop_head())
            .await?;
        match popped {
            Some(token) if token == head => {
                warn!("Discarded corrupt queue entry {:?}", token);
                Ok(Some(token))
            }
            Some(token) => Err(FloodControlError::InvariantViolation {
                user_id: token.parse::<Entry>().map(|e| e.user_id).unwrap_or_default(),
                detail: format!(
                    "queue head changed from {:?} to {:?} while discarding it",
                    head, token
                ),
            }),
            None => Ok(None),
        }
    }

    async fn timed<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        with_deadline(self.store_timeout, operation, call).await
    }

    /// Runs a queue/counter pair operation on its own task.
    ///
    /// The task keeps running when the caller's future is dropped, so a pair
    /// is never abandoned between its store calls. The pair bounds each of
    /// its calls by the store timeout.
    async fn run_pair<T, F, Fut>(&self, pair: F) -> Result<T>
    where
        F: FnOnce(Arc<S>, Duration) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let task = tokio::spawn(pair(Arc::clone(&self.store), self.store_timeout));
        match task.await {
            Ok(result) => result,
            Err(err) => match err.try_into_panic() {
                Ok(panic) => std::panic::resume_unwind(panic),
                Err(err) => Err(FloodControlError::StoreUnavailable(format!(
                    "store task did not finish: {}",
                    err
                ))),
            },
        }
    }

    async fn sweep(&self) -> Result<SweepReport> {
        let _sweep = self.sweep_lock.lock().await;
        self.evict_expired().await
    }

    /// Sweep ahead of an admission decision, skipped while another sweep holds
    /// `sweep_lock`. Checks for different users never wait on each other.
    async fn sweep_inline(&self) -> Result<()> {
        if !self.sweep_on_check {
            return Ok(());
        }
        match self.sweep_lock.try_lock() {
            Ok(_sweep) => {
                self.evict_expired().await?;
            }
            Err(_) => debug!("Sweep already running, skipping inline sweep"),
        }
        Ok(())
    }

    /// Pops expired heads until the head is inside the window. Callers hold
    /// `sweep_lock`.
    async fn evict_expired(&self) -> Result<SweepReport> {
        let now = self.clock.now_unix();
        let mut report = SweepReport::default();

        loop {
            let token = match self
                .timed("queue_peek_head", self.store.queue_peek_head())
                .await?
            {
                Some(token) => token,
                None => break,
            };
            let head: Entry = token.parse()?;
            if head.age(now) <= self.window_seconds {
                break;
            }

            let user_id = head.user_id;
            let expected = token;
            let outcome = self
                .run_pair(move |store, timeout| async move {
                    store.pop_head_if(&expected, user_id, timeout).await
                })
                .await?;
            match outcome {
                PopOutcome::Empty => break,
                PopOutcome::HeadMoved => continue,
                PopOutcome::Popped { remaining } => {
                    report.evicted += 1;
                    debug!(
                        "Evicted request of user {} from {} (age {}s)",
                        head.user_id,
                        head.timestamp,
                        head.age(now)
                    );
                    if remaining < 0 {
                        warn!(
                            "Occupancy counter of user {} went negative during eviction",
                            head.user_id
                        );
                        report.drift_repaired += self.reconcile().await?.len();
                    }
                }
            }
        }

        Ok(report)
    }
}

#[async_trait]
impl<S: WindowStore + 'static, C: Clock> FloodControl for SlidingWindowFloodControl<S, C> {
    async fn check(&self, user_id: i64) -> Result<bool> {
        self.sweep_inline().await?;
        let count = self.occupancy(user_id).await?;
        Ok((count as u64) < self.limit)
    }

    async fn add_request(&self, user_id: i64) -> Result<bool> {
        self.sweep_inline().await?;

        let entry = Entry::new(user_id, self.clock.now_unix())?;
        let limit = self.limit;
        let admitted = self
            .run_pair(move |store, timeout| async move {
                store.append_if_below(&entry, limit, timeout).await
            })
            .await?;

        match admitted {
            Some(count) => {
                info!("Request allowed for user: {} ({}/{})", user_id, count, self.limit);
                Ok(true)
            }
            None => {
                warn!("Request denied for user: {}", user_id);
                Ok(false)
            }
        }
    }

    async fn insert_request(&self, user_id: i64, timestamp: i64) -> Result<()> {
        let entry = Entry::new(user_id, timestamp)?;
        self.run_pair(move |store, timeout| async move {
            store.append_and_increment(&entry, timeout).await
        })
        .await?;
        Ok(())
    }

    async fn remove_old_requests(&self) -> Result<SweepReport> {
        self.sweep().await
    }

    async fn get_top_request(&self) -> Result<Option<Entry>> {
        match self
            .timed("queue_peek_head", self.store.queue_peek_head())
            .await?
        {
            Some(token) => Ok(Some(token.parse()?)),
            None => Ok(None),
        }
    }
}
