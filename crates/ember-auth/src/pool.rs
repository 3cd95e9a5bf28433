// src/pool.rs
//! Fixed-size blocking pool of backend connections.

use crate::error::{AuthError, AuthResult};
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub struct ConnPool<C> {
    idle: Mutex<Vec<C>>,
    returned: Condvar,
    size: usize,
}

impl<C> ConnPool<C> {
    pub fn new(conns: Vec<C>) -> Self {
        let size = conns.len();
        Self {
            idle: Mutex::new(conns),
            returned: Condvar::new(),
            size,
        }
    }

    /// Builds `size` connections with `connect`.
    pub fn build<F>(size: usize, mut connect: F) -> AuthResult<Self>
    where
        F: FnMut() -> AuthResult<C>,
    {
        let conns = (0..size).map(|_| connect()).collect::<AuthResult<Vec<_>>>()?;
        Ok(Self::new(conns))
    }

    fn lock(&self) -> MutexGuard<'_, Vec<C>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until a connection is free.
    pub fn get(&self) -> PooledConn<'_, C> {
        let mut idle = self.lock();
        loop {
            if let Some(conn) = idle.pop() {
                return PooledConn::new(self, conn);
            }
            idle = self
                .returned
                .wait(idle)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn try_get(&self) -> Option<PooledConn<'_, C>> {
        self.lock().pop().map(|conn| PooledConn::new(self, conn))
    }

    /// Waits at most `timeout` for a connection.
    pub fn get_timeout(&self, timeout: Duration) -> AuthResult<PooledConn<'_, C>> {
        let deadline = Instant::now() + timeout;
        let mut idle = self.lock();
        loop {
            if let Some(conn) = idle.pop() {
                return Ok(PooledConn::new(self, conn));
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(AuthError::PoolExhausted(timeout));
            }
            idle = self
                .returned
                .wait_timeout(idle, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn free_count(&self) -> usize {
        self.lock().len()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn put_back(&self, conn: C) {
        self.lock().push(conn);
        self.returned.notify_one();
    }
}

/// A checked-out connection. Goes back to the pool on drop.
pub struct PooledConn<'a, C> {
    pool: &'a ConnPool<C>,
    conn: ManuallyDrop<C>,
}

impl<'a, C> PooledConn<'a, C> {
    fn new(pool: &'a ConnPool<C>, conn: C) -> Self {
        Self {
            pool,
            conn: ManuallyDrop::new(conn),
        }
    }
}

impl<C> Deref for PooledConn<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for PooledConn<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C> Drop for PooledConn<'_, C> {
    fn drop(&mut self) {
        // SAFETY: `conn` is never touched again after this take
        let conn = unsafe { ManuallyDrop::take(&mut self.conn) };
        self.pool.put_back(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn guard_returns_connection() {
        let pool = ConnPool::new(vec![1, 2]);
        assert_eq!(pool.size(), 2);
        {
            let a = pool.get();
            let b = pool.try_get().unwrap();
            assert_eq!(*a + *b, 3);
            assert_eq!(pool.free_count(), 0);
            assert!(pool.try_get().is_none());
        }
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn get_timeout_gives_up() {
        let pool = ConnPool::new(vec![()]);
        let _held = pool.get();
        let err = pool.get_timeout(Duration::from_millis(30)).err().unwrap();
        assert!(matches!(err, AuthError::PoolExhausted(_)));
    }

    #[test]
    fn blocked_get_wakes_on_release() {
        let pool = Arc::new(ConnPool::new(vec![String::from("conn")]));
        let held = pool.get();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.get().len())
        };
        thread::sleep(Duration::from_millis(30));
        drop(held);
        assert_eq!(waiter.join().unwrap(), 4);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn build_propagates_connect_errors() {
        let mut n = 0;
        let res = ConnPool::<u8>::build(3, || {
            n += 1;
            if n == 2 {
                Err(AuthError::Malformed("boom".into()))
            } else {
                Ok(n)
            }
        });
        assert!(res.is_err());
    }
}
