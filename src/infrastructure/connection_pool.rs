// Bounded connection pool shared by every store caller
use crate::application::errors::StoreError;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Hands out at most `size` concurrent leases on a shared connection handle.
///
/// The pool is built once in `main`, injected into the store adapters and
/// closed on shutdown. Acquisition never hangs: it is bounded by
/// `acquire_timeout` and exhaustion surfaces as `StoreError::Unavailable`.
#[derive(Debug)]
pub struct ConnectionPool<C> {
    connection: C,
    permits: Arc<Semaphore>,
    size: usize,
    acquire_timeout: Duration,
}

/// A lease on the pool; the slot is released when this is dropped
#[derive(Debug)]
pub struct PooledConnection<C> {
    connection: C,
    _permit: OwnedSemaphorePermit,
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl<C: Clone> ConnectionPool<C> {
    pub fn new(connection: C, size: usize, acquire_timeout: Duration) -> Self {
        Self {
            connection,
            permits: Arc::new(Semaphore::new(size)),
            size,
            acquire_timeout,
        }
    }

    pub async fn acquire(&self) -> Result<PooledConnection<C>, StoreError> {
        let permit = tokio::time::timeout(self.acquire_timeout, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| {
                tracing::warn!(
                    "Connection pool exhausted: {} leases held for {:?}",
                    self.size,
                    self.acquire_timeout
                );
                StoreError::Unavailable(format!(
                    "connection pool exhausted after {:?}",
                    self.acquire_timeout
                ))
            })?
            .map_err(|_| StoreError::Unavailable("connection pool closed".to_string()))?;

        Ok(PooledConnection {
            connection: self.connection.clone(),
            _permit: permit,
        })
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Refuse new leases; outstanding leases finish normally
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_unavailable_not_hang() {
        let pool = ConnectionPool::new((), 1, Duration::from_millis(50));
        let _held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_lease_released_on_drop() {
        let pool = ConnectionPool::new((), 2, Duration::from_millis(50));
        {
            let _a = pool.acquire().await.unwrap();
            let _b = pool.acquire().await.unwrap();
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_leases() {
        let pool = ConnectionPool::new((), 2, Duration::from_millis(50));
        pool.close();
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(
            err,
            StoreError::Unavailable("connection pool closed".to_string())
        );
    }
}
