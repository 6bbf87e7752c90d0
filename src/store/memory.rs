use super::{count_by_user, diff_counters, with_deadline, CounterDrift, PopOutcome, WindowStore};
use crate::entry::Entry;
use crate::error::{FloodControlError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Default)]
struct WindowState {
    queue: VecDeque<String>,
    counters: HashMap<i64, i64>,
}

impl WindowState {
    fn adjust(&mut self, user_id: i64, delta: i64) -> i64 {
        let counter = self.counters.entry(user_id).or_insert(0);
        *counter += delta;
        let value = *counter;
        if value == 0 {
            self.counters.remove(&user_id);
        }
        value
    }
}

/// Window store held in process memory.
///
/// Queue and counters sit behind one mutex, so every pair operation is a
/// single critical section.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<WindowState>,
    injected_failures: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `calls` store calls fail with `StoreUnavailable`.
    pub fn fail_next_calls(&self, calls: usize) {
        self.injected_failures.store(calls, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        let injected = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(FloodControlError::StoreUnavailable(
                "injected memory store failure".into(),
            )),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn queue_append(&self, token: &str) -> Result<()> {
        self.check_available()?;
        self.state.lock().await.queue.push_back(token.to_owned());
        Ok(())
    }

    async fn queue_peek_head(&self) -> Result<Option<String>> {
        self.check_available()?;
        Ok(self.state.lock().await.queue.front().cloned())
    }

    async fn queue_pop_head(&self) -> Result<Option<String>> {
        self.check_available()?;
        Ok(self.state.lock().await.queue.pop_front())
    }

    async fn queue_length(&self) -> Result<u64> {
        self.check_available()?;
        Ok(self.state.lock().await.queue.len() as u64)
    }

    async fn queue_snapshot(&self) -> Result<Vec<String>> {
        self.check_available()?;
        Ok(self.state.lock().await.queue.iter().cloned().collect())
    }

    async fn counter_get(&self, user_id: i64) -> Result<i64> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .await
            .counters
            .get(&user_id)
            .copied()
            .unwrap_or(0))
    }

    async fn counter_increment(&self, user_id: i64) -> Result<i64> {
        self.check_available()?;
        Ok(self.state.lock().await.adjust(user_id, 1))
    }

    async fn counter_decrement(&self, user_id: i64) -> Result<i64> {
        self.check_available()?;
        Ok(self.state.lock().await.adjust(user_id, -1))
    }

    async fn counter_set(&self, user_id: i64, value: i64) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if value == 0 {
            state.counters.remove(&user_id);
        } else {
            state.counters.insert(user_id, value);
        }
        Ok(())
    }

    async fn counter_snapshot(&self) -> Result<HashMap<i64, i64>> {
        self.check_available()?;
        Ok(self.state.lock().await.counters.clone())
    }

    async fn append_and_increment(&self, entry: &Entry, timeout: Duration) -> Result<i64> {
        self.check_available()?;
        with_deadline(timeout, "append_and_increment", async {
            let mut state = self.state.lock().await;
            state.queue.push_back(entry.encode());
            Ok::<_, FloodControlError>(state.adjust(entry.user_id, 1))
        })
        .await
    }

    async fn append_if_below(
        &self,
        entry: &Entry,
        limit: u64,
        timeout: Duration,
    ) -> Result<Option<i64>> {
        self.check_available()?;
        with_deadline(timeout, "append_if_below", async {
            let mut state = self.state.lock().await;
            let current = state.counters.get(&entry.user_id).copied().unwrap_or(0);
            if current >= limit as i64 {
                return Ok(None);
            }
            state.queue.push_back(entry.encode());
            Ok::<_, FloodControlError>(Some(state.adjust(entry.user_id, 1)))
        })
        .await
    }

    async fn pop_head_if(&self, token: &str, user_id: i64, timeout: Duration) -> Result<PopOutcome> {
        self.check_available()?;
        with_deadline(timeout, "pop_head_if", async {
            let mut state = self.state.lock().await;
            match state.queue.front() {
                None => return Ok(PopOutcome::Empty),
                Some(head) if head != token => return Ok(PopOutcome::HeadMoved),
                Some(_) => {}
            }
            state.queue.pop_front();
            let remaining = state.adjust(user_id, -1);
            if remaining < 0 {
                state.counters.remove(&user_id);
            }
            Ok::<_, FloodControlError>(PopOutcome::Popped { remaining })
        })
        .await
    }

    async fn reconcile(&self) -> Result<Vec<CounterDrift>> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let actual = count_by_user(state.queue.make_contiguous());
        let drift = diff_counters(&state.counters, &actual);
        state.counters = actual;
        Ok(drift)
    }
}
