//! Async bounded pool for Postgres connections.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, sleep};

use crate::CancelToken;

type CreateFuture<T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send>>;
type Factory<T> = Box<dyn Fn() -> CreateFuture<T> + Send + Sync>;

/// Holds at most `max` live values; idle ones are handed out first.
pub struct AsyncPool<T> {
    max: usize,
    create: Factory<T>,
    idle: Mutex<Vec<T>>,
    available: Notify,
    live: AtomicUsize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AsyncAcquireError {
    Timeout,
    Cancelled,
    /// The factory failed; its slot is free again.
    Create(String),
}

/// A value checked out of an [`AsyncPool`]. Goes back to the pool on drop.
pub struct AsyncPooled<T> {
    pool: Arc<AsyncPool<T>>,
    value: Option<T>,
}

impl<T> AsyncPool<T> {
    pub fn new<F, Fut, E>(max: usize, factory: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::fmt::Display,
    {
        let create: Factory<T> = Box::new(move || {
            let fut = factory();
            Box::pin(async move { fut.await.map_err(|err| err.to_string()) }) as CreateFuture<T>
        });
        Arc::new(Self {
            max: max.max(1),
            create,
            idle: Mutex::new(Vec::new()),
            available: Notify::new(),
            live: AtomicUsize::new(0),
        })
    }

    /// Checks out an idle value, creates one while below `max`, or waits.
    pub async fn acquire(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<AsyncPooled<T>, AsyncAcquireError> {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        loop {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(AsyncAcquireError::Cancelled);
            }
            if let Some(value) = self.lock_idle().pop() {
                return Ok(self.wrap(value));
            }
            if self.reserve_slot() {
                return match (self.create)().await {
                    Ok(value) => Ok(self.wrap(value)),
                    Err(err) => {
                        self.free_slot();
                        Err(AsyncAcquireError::Create(err))
                    }
                };
            }
            let remaining = match deadline {
                Some(limit) => match limit.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => Some(left),
                    _ => return Err(AsyncAcquireError::Timeout),
                },
                None => None,
            };
            self.wait_for_release(remaining, cancel).await?;
        }
    }

    pub fn in_flight(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.lock_idle().len()
    }

    async fn wait_for_release(
        &self,
        remaining: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<(), AsyncAcquireError> {
        let timer = async {
            match remaining {
                Some(left) => sleep(left).await,
                None => std::future::pending().await,
            }
        };
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = self.available.notified() => Ok(()),
            _ = cancelled => Err(AsyncAcquireError::Cancelled),
            _ = timer => Err(AsyncAcquireError::Timeout),
        }
    }

    fn reserve_slot(&self) -> bool {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < self.max).then_some(live + 1)
            })
            .is_ok()
    }

    fn free_slot(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.available.notify_one();
    }

    fn wrap(self: &Arc<Self>, value: T) -> AsyncPooled<T> {
        AsyncPooled {
            pool: Arc::clone(self),
            value: Some(value),
        }
    }

    fn lock_idle(&self) -> MutexGuard<'_, Vec<T>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> AsyncPooled<T> {
    /// Drops the value instead of returning it, e.g. after a broken connection.
    pub fn discard(mut self) {
        if self.value.take().is_some() {
            self.pool.free_slot();
        }
    }
}

impl<T> std::ops::Deref for AsyncPooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("pooled value is present until drop")
    }
}

impl<T> std::ops::DerefMut for AsyncPooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pooled value is present until drop")
    }
}

impl<T> Drop for AsyncPooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.lock_idle().push(value);
            self.pool.available.notify_one();
        }
    }
}
