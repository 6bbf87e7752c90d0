//! Shared window state: the chronological queue of admitted requests and the
//! per-user occupancy counters.
//!
//! Every mutation that adds or removes a queue entry must move the matching
//! counter with it. Stores that can do this natively (a single lock, a Lua
//! script) override the pair operations; stores that only offer the
//! primitives inherit defaults that keep the counters consistent through
//! compensating updates and surface `InvariantViolation` when a compensation
//! cannot be applied. `reconcile` repairs whatever drift remains.

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use crate::entry::Entry;
use crate::error::{FloodControlError, Result};
use crate::retry::{retry_store_call, RetryPolicy};
use async_trait::async_trait;
use log::warn;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

/// Result of a conditional head removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopOutcome {
    /// The queue was empty.
    Empty,
    /// The head is no longer the expected token; nothing was removed.
    HeadMoved,
    /// The head was removed and its user's counter decremented to `remaining`.
    /// A negative value means the counter had drifted low and was reset to zero.
    Popped { remaining: i64 },
}

/// A counter that disagreed with the queue and was rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterDrift {
    pub user_id: i64,
    pub recorded: i64,
    pub actual: i64,
}

/// Runs one store call, failing with `DeadlineExceeded` once `timeout` elapses.
pub async fn with_deadline<T, F>(timeout: Duration, operation: &'static str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(FloodControlError::DeadlineExceeded { operation, timeout }),
    }
}

#[async_trait]
pub trait WindowStore: Send + Sync {
    async fn queue_append(&self, token: &str) -> Result<()>;
    async fn queue_peek_head(&self) -> Result<Option<String>>;
    async fn queue_pop_head(&self) -> Result<Option<String>>;
    async fn queue_length(&self) -> Result<u64>;
    async fn queue_snapshot(&self) -> Result<Vec<String>>;

    async fn counter_get(&self, user_id: i64) -> Result<i64>;
    async fn counter_increment(&self, user_id: i64) -> Result<i64>;
    async fn counter_decrement(&self, user_id: i64) -> Result<i64>;
    /// Writing zero removes the counter.
    async fn counter_set(&self, user_id: i64, value: i64) -> Result<()>;
    async fn counter_snapshot(&self) -> Result<HashMap<i64, i64>>;

    /// Policy used when a compensating counter update has to be retried.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Appends `entry` to the tail and increments its user's counter.
    ///
    /// Pair operations bound every store call they make by `timeout`, so a
    /// slow call fails on its own and the compensation still runs.
    async fn append_and_increment(&self, entry: &Entry, timeout: Duration) -> Result<i64> {
        with_deadline(timeout, "queue_append", self.queue_append(&entry.encode())).await?;

        let store = self;
        let user_id = entry.user_id;
        retry_store_call(&self.retry_policy(), "counter_increment", move || {
            with_deadline(timeout, "counter_increment", store.counter_increment(user_id))
        })
        .await
        .map_err(|err| FloodControlError::InvariantViolation {
            user_id,
            detail: format!("entry {} appended but counter increment failed: {}", entry, err),
        })
    }

    /// Appends `entry` only while its user holds fewer than `limit` entries.
    ///
    /// Returns the user's new count, or `None` when the request was rejected.
    /// The default reserves a slot with an atomic increment first, so two
    /// concurrent callers can never both take the last slot.
    async fn append_if_below(
        &self,
        entry: &Entry,
        limit: u64,
        timeout: Duration,
    ) -> Result<Option<i64>> {
        let user_id = entry.user_id;
        let reserved = with_deadline(
            timeout,
            "counter_increment",
            self.counter_increment(user_id),
        )
        .await?;

        if reserved > limit as i64 {
            release_reservation(self, user_id, timeout, "admission rejected").await?;
            return Ok(None);
        }

        let appended = with_deadline(timeout, "queue_append", self.queue_append(&entry.encode())).await;
        if let Err(err) = appended {
            release_reservation(self, user_id, timeout, "queue append failed").await?;
            return Err(err);
        }

        Ok(Some(reserved))
    }

    /// Removes the head if it is still `token`, decrementing `user_id`'s counter.
    ///
    /// The default is only safe with a single sweeper per store.
    async fn pop_head_if(&self, token: &str, user_id: i64, timeout: Duration) -> Result<PopOutcome> {
        match with_deadline(timeout, "queue_peek_head", self.queue_peek_head()).await? {
            None => return Ok(PopOutcome::Empty),
            Some(head) if head != token => return Ok(PopOutcome::HeadMoved),
            Some(_) => {}
        }

        let popped = match with_deadline(timeout, "queue_pop_head", self.queue_pop_head()).await? {
            None => return Ok(PopOutcome::Empty),
            Some(popped) => popped,
        };
        let owner = if popped == token {
            user_id
        } else {
            popped.parse::<Entry>()?.user_id
        };

        let store = self;
        let remaining = retry_store_call(&self.retry_policy(), "counter_decrement", move || {
            with_deadline(timeout, "counter_decrement", store.counter_decrement(owner))
        })
        .await
        .map_err(|err| FloodControlError::InvariantViolation {
            user_id: owner,
            detail: format!("entry {:?} popped but counter decrement failed: {}", popped, err),
        })?;

        if remaining < 0 {
            with_deadline(timeout, "counter_set", self.counter_set(owner, 0)).await?;
        }
        Ok(PopOutcome::Popped { remaining })
    }

    /// Recomputes every counter from the queue and rewrites the ones that drifted.
    ///
    /// The default reads the queue and the counters in separate calls and is
    /// only exact while no other writer is active.
    async fn reconcile(&self) -> Result<Vec<CounterDrift>> {
        let actual = count_by_user(&self.queue_snapshot().await?);
        let recorded = self.counter_snapshot().await?;
        let drift = diff_counters(&recorded, &actual);

        for d in &drift {
            self.counter_set(d.user_id, d.actual).await?;
        }
        Ok(drift)
    }
}

async fn release_reservation<S: WindowStore + ?Sized>(
    store: &S,
    user_id: i64,
    timeout: Duration,
    reason: &str,
) -> Result<()> {
    retry_store_call(&store.retry_policy(), "counter_decrement", move || {
        with_deadline(timeout, "counter_decrement", store.counter_decrement(user_id))
    })
    .await
    .map(|_| ())
    .map_err(|err| FloodControlError::InvariantViolation {
        user_id,
        detail: format!("reservation not released after {}: {}", reason, err),
    })
}

/// Occupancy per user as implied by the queue. Undecodable tokens are skipped.
pub(crate) fn count_by_user(tokens: &[String]) -> HashMap<i64, i64> {
    let mut counts = HashMap::new();
    for token in tokens {
        match token.parse::<Entry>() {
            Ok(entry) => *counts.entry(entry.user_id).or_insert(0) += 1,
            Err(err) => warn!("Skipping undecodable queue entry during recount: {}", err),
        }
    }
    counts
}

pub(crate) fn diff_counters(
    recorded: &HashMap<i64, i64>,
    actual: &HashMap<i64, i64>,
) -> Vec<CounterDrift> {
    let mut drift: Vec<CounterDrift> = recorded
        .iter()
        .filter_map(|(&user_id, &count)| {
            let expected = actual.get(&user_id).copied().unwrap_or(0);
            (count != expected).then_some(CounterDrift {
                user_id,
                recorded: count,
                actual: expected,
            })
        })
        .collect();

    drift.extend(
        actual
            .iter()
            .filter(|(user_id, _)| !recorded.contains_key(user_id))
            .map(|(&user_id, &actual)| CounterDrift {
                user_id,
                recorded: 0,
                actual,
            }),
    );
    drift.sort_by_key(|d| d.user_id);
    drift
}
