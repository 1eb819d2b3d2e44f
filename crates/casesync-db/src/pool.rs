//! Blocking connection pool used by the SQLite backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct PoolState<T> {
    idle: Vec<T>,
}

type Factory<T> = Box<dyn Fn() -> Result<T, String> + Send + Sync>;

/// A bounded pool for reusable connection-like objects.
pub struct Pool<T> {
    max: usize,
    factory: Factory<T>,
    state: Mutex<PoolState<T>>,
    available: Condvar,
    in_flight: AtomicUsize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AcquireError {
    Timeout,
    Cancelled,
    Create(String),
}

/// A pooled value that returns to the pool on drop.
pub struct Pooled<T> {
    pool: Arc<Pool<T>>,
    value: Option<T>,
}

impl<T> Pool<T> {
    pub fn new<F, E>(max: usize, factory: F) -> Arc<Self>
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
        E: std::fmt::Display,
    {
        Arc::new(Self {
            max: max.max(1),
            factory: Box::new(move || factory().map_err(|err| err.to_string())),
            state: Mutex::new(PoolState { idle: Vec::new() }),
            available: Condvar::new(),
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn acquire(self: &Arc<Self>, timeout: Option<Duration>) -> Result<Pooled<T>, AcquireError> {
        self.acquire_with_cancel(timeout, || false)
    }

    pub fn acquire_with_cancel<F>(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        mut cancel_check: F,
    ) -> Result<Pooled<T>, AcquireError>
    where
        F: FnMut() -> bool,
    {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        let poll = Duration::from_millis(5);
        loop {
            if cancel_check() {
                return Err(AcquireError::Cancelled);
            }
            let state = self.lock_state();
            if let Some(item) = self.take_idle(state)? {
                return Ok(item);
            }

            if cancel_check() {
                return Err(AcquireError::Cancelled);
            }
            let state = self.lock_state();
            let wait = match deadline {
                None => poll,
                Some(limit) => {
                    let now = Instant::now();
                    if now >= limit {
                        return Err(AcquireError::Timeout);
                    }
                    (limit - now).min(poll)
                }
            };
            let _ = self
                .available
                .wait_timeout(state, wait)
                .unwrap_or_else(PoisonError::into_inner);
            if deadline.is_some_and(|limit| Instant::now() >= limit) {
                return Err(AcquireError::Timeout);
            }
        }
    }

    // Pops an idle value or creates a new one while under the limit.
    fn take_idle(
        self: &Arc<Self>,
        mut state: MutexGuard<'_, PoolState<T>>,
    ) -> Result<Option<Pooled<T>>, AcquireError> {
        if let Some(item) = state.idle.pop() {
            return Ok(Some(Pooled {
                pool: Arc::clone(self),
                value: Some(item),
            }));
        }
        if self.in_flight.load(Ordering::SeqCst) >= self.max {
            return Ok(None);
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        drop(state);
        match (self.factory)() {
            Ok(item) => Ok(Some(Pooled {
                pool: Arc::clone(self),
                value: Some(item),
            })),
            Err(err) => {
                self.discard();
                Err(AcquireError::Create(err))
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.lock_state().idle.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, item: T) {
        let mut state = self.lock_state();
        state.idle.push(item);
        self.available.notify_one();
    }

    fn discard(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.available.notify_one();
    }
}

impl<T> Pooled<T> {
    /// Drops the value instead of returning it, freeing a slot for a fresh one.
    pub fn discard(mut self) {
        if self.value.take().is_some() {
            self.pool.discard();
        }
    }
}

impl<T> std::ops::Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value
            .as_ref()
            .expect("Pooled value missing (already released)")
    }
}

impl<T> std::ops::DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value
            .as_mut()
            .expect("Pooled value missing (already released)")
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.value.take() {
            self.pool.release(item);
        }
    }
}
