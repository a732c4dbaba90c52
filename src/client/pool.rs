//! A lazy, unbounded, non-reentrant pool of idle connections. Checkouts are
//! exclusive for their whole lifetime; idle connections are kept LIFO so the
//! warmest socket is reused first. A checkout that is marked discarded (any
//! request error does this) is dropped instead of returned.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

pub(crate) struct Pool<C> {
    idle: Arc<Mutex<Vec<C>>>,
}

impl<C> Pool<C> {
    pub fn new() -> Pool<C> {
        Pool {
            idle: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Pops the most recently released idle connection, if any.
    pub fn checkout(&self) -> Option<Checked<C>> {
        let conn = self.idle.lock().expect("connection pool lock poisoned").pop();
        conn.map(|conn| self.wrap(conn))
    }

    /// Wraps a freshly built connection so it is released into the idle set
    /// when the checkout is dropped.
    pub fn admit(&self, conn: C) -> Checked<C> {
        self.wrap(conn)
    }

    fn wrap(&self, conn: C) -> Checked<C> {
        Checked {
            conn: Some(conn),
            discard: false,
            idle: Arc::clone(&self.idle),
        }
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.idle.lock().unwrap().len()
    }
}

/// An exclusive borrow of one pooled connection.
pub(crate) struct Checked<C> {
    conn: Option<C>,
    discard: bool,
    idle: Arc<Mutex<Vec<C>>>,
}

impl<C> Checked<C> {
    /// Marks the connection as unusable; it will be closed on release
    /// instead of returned to the idle set.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl<C> Deref for Checked<C> {
    type Target = C;
    fn deref(&self) -> &C {
        self.conn.as_ref().expect("connection already released")
    }
}

impl<C> DerefMut for Checked<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("connection already released")
    }
}

impl<C> Drop for Checked<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.discard {
                self.idle
                    .lock()
                    .expect("connection pool lock poisoned")
                    .push(conn);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn released_connections_are_reused_lifo() {
        let pool: Pool<u32> = Pool::new();
        let first = pool.admit(1);
        let second = pool.admit(2);
        drop(first);
        drop(second);
        assert_eq!(2, pool.idle_count());

        // 2 was released last, so it comes back first
        let checked = pool.checkout().unwrap();
        assert_eq!(2, *checked);
        drop(checked);
        assert_eq!(2, pool.idle_count());
    }

    #[test]
    fn discarded_connections_are_not_returned() {
        let pool: Pool<u32> = Pool::new();
        let mut checked = pool.admit(7);
        checked.discard();
        drop(checked);
        assert_eq!(0, pool.idle_count());
        assert!(pool.checkout().is_none());
    }

    #[test]
    fn empty_pool_yields_no_connection() {
        let pool: Pool<u32> = Pool::new();
        assert!(pool.checkout().is_none());
    }
}
