//! Client connection pooling.
//!
//! Idle connections are bucketed by connect-method key. A request that
//! is mid-dial also registers a waiter; a connection returned to the
//! pool is handed to a waiter directly ("late binding"), letting the
//! returning connection win over a slower dial.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use futures_channel::oneshot;
use tracing::trace;

use super::conn::PersistConn;

/// (proxy-URL-or-empty, target scheme, target address)
pub(crate) type Key = (String, String, String);

pub(crate) struct Pool {
    inner: Arc<StdMutex<PoolInner>>,
}

impl Clone for Pool {
    fn clone(&self) -> Pool {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

struct PoolInner {
    idle: HashMap<Key, Vec<Arc<PersistConn>>>,
    waiters: HashMap<Key, VecDeque<oneshot::Sender<Arc<PersistConn>>>>,
    /// Global insertion order, oldest first, for LRU eviction.
    order: VecDeque<Weak<PersistConn>>,
    /// Set by `close_idle`; cleared again by the next waiter.
    reject: bool,
    max_idle: usize,
    max_idle_per_host: usize,
    idle_timeout: Option<Duration>,
}

impl Pool {
    pub(crate) fn new(
        max_idle: usize,
        max_idle_per_host: usize,
        idle_timeout: Option<Duration>,
    ) -> Pool {
        Pool {
            inner: Arc::new(StdMutex::new(PoolInner {
                idle: HashMap::new(),
                waiters: HashMap::new(),
                order: VecDeque::new(),
                reject: false,
                max_idle,
                max_idle_per_host,
                idle_timeout,
            })),
        }
    }

    /// Offers `pc` back to the pool. Returns false when the pool refused
    /// it, in which case the caller owns closing it.
    pub(crate) fn put_idle(&self, pc: Arc<PersistConn>) -> bool {
        if pc.is_broken() {
            return false;
        }
        let timeout = {
            let mut inner = self.inner.lock().unwrap();
            if inner.reject {
                trace!("pool is rejecting idle conns");
                return false;
            }
            // hand off to a waiter first: late binding
            if let Some(queue) = inner.waiters.get_mut(&pc.key) {
                while let Some(waiter) = queue.pop_front() {
                    if waiter.send(pc.clone()).is_ok() {
                        trace!("handing idle conn to waiter for {:?}", pc.key);
                        return true;
                    }
                }
            }
            let max_per_host = inner.max_idle_per_host;
            let list = inner.idle.entry(pc.key.clone()).or_insert_with(Vec::new);
            debug_assert!(
                !list.iter().any(|other| Arc::ptr_eq(other, &pc)),
                "connection already pooled"
            );
            if list.len() >= max_per_host {
                trace!("per-host idle limit reached for {:?}", pc.key);
                return false;
            }
            if !pc.mark_idle() {
                return false;
            }
            list.push(pc.clone());
            inner.order.push_back(Arc::downgrade(&pc));

            // global limit: evict least-recently pooled
            while inner.total_idle() > inner.max_idle {
                match inner.evict_oldest() {
                    Some(evicted) => evicted.close(),
                    None => break,
                }
            }
            inner.idle_timeout
        };

        if let Some(timeout) = timeout {
            let generation = pc.idle_generation();
            let pool = self.clone();
            let pc = pc.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                // the reuse race is settled by the conn's state: a conn
                // that was taken in the meantime refuses to expire
                if pc.expire_if_idle(generation) {
                    trace!("closing idle conn for {:?} after timeout", pc.key);
                    pool.remove(&pc);
                    pc.close();
                }
            });
        }
        true
    }

    /// Most-recently pooled healthy connection for `key`, if any.
    pub(crate) fn get_idle(&self, key: &Key) -> Option<Arc<PersistConn>> {
        let mut inner = self.inner.lock().unwrap();
        let list = inner.idle.get_mut(key)?;
        while let Some(pc) = list.pop() {
            // losing the race against the idle timer means the conn is
            // already doomed; skip it
            if pc.acquire_idle() && !pc.is_broken() {
                if list.is_empty() {
                    inner.idle.remove(key);
                }
                return Some(pc);
            }
            pc.close();
        }
        inner.idle.remove(key);
        None
    }

    /// Registers a waiter for `key`. The receiver fires if another
    /// request returns a matching connection before our dial finishes.
    pub(crate) fn waiter(&self, key: &Key) -> oneshot::Receiver<Arc<PersistConn>> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        inner.reject = false;
        inner
            .waiters
            .entry(key.clone())
            .or_insert_with(VecDeque::new)
            .push_back(tx);
        rx
    }

    /// Closes every cached connection and rejects puts until the next
    /// waiter registration.
    pub(crate) fn close_idle(&self) {
        let drained: Vec<Arc<PersistConn>> = {
            let mut inner = self.inner.lock().unwrap();
            inner.reject = true;
            inner.order.clear();
            inner.idle.drain().flat_map(|(_, list)| list).collect()
        };
        for pc in drained {
            pc.close();
        }
    }

    pub(crate) fn remove(&self, pc: &Arc<PersistConn>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(list) = inner.idle.get_mut(&pc.key) {
            list.retain(|other| !Arc::ptr_eq(other, pc));
            if list.is_empty() {
                inner.idle.remove(&pc.key);
            }
        }
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.inner.lock().unwrap().total_idle()
    }
}

impl PoolInner {
    fn total_idle(&self) -> usize {
        self.idle.values().map(|list| list.len()).sum()
    }

    fn evict_oldest(&mut self) -> Option<Arc<PersistConn>> {
        while let Some(weak) = self.order.pop_front() {
            let pc = match weak.upgrade() {
                Some(pc) => pc,
                None => continue,
            };
            if !pc.acquire_idle() {
                // taken or expired since it was pooled
                continue;
            }
            if let Some(list) = self.idle.get_mut(&pc.key) {
                list.retain(|other| !Arc::ptr_eq(other, &pc));
                if list.is_empty() {
                    self.idle.remove(&pc.key);
                }
            }
            return Some(pc);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::super::conn::{ConnParams, PersistConn};
    use super::*;
    use crate::net::BoxedStream;

    fn params(pool: &Pool) -> ConnParams {
        ConnParams {
            pool: pool.clone(),
            max_response_header_bytes: 4096,
            disable_keep_alives: false,
        }
    }

    fn key(host: &str) -> Key {
        (String::new(), "http".to_owned(), host.to_owned())
    }

    fn conn(pool: &Pool, host: &str) -> Arc<PersistConn> {
        let (_tx, rx) = tokio::io::duplex(64);
        PersistConn::spawn(
            Box::new(rx) as BoxedStream,
            key(host),
            false,
            None,
            params(pool),
        )
    }

    #[tokio::test]
    async fn put_then_get_is_lifo() {
        let pool = Pool::new(16, 4, None);
        let first = conn(&pool, "a:80");
        let second = conn(&pool, "a:80");
        assert!(pool.put_idle(first.clone()));
        assert!(pool.put_idle(second.clone()));
        assert_eq!(pool.idle_count(), 2);

        let got = pool.get_idle(&key("a:80")).unwrap();
        assert!(Arc::ptr_eq(&got, &second), "most recent conn first");
        let got = pool.get_idle(&key("a:80")).unwrap();
        assert!(Arc::ptr_eq(&got, &first));
        assert!(pool.get_idle(&key("a:80")).is_none());
    }

    #[tokio::test]
    async fn keys_do_not_mix() {
        let pool = Pool::new(16, 4, None);
        let pc = conn(&pool, "a:80");
        assert!(pool.put_idle(pc));
        assert!(pool.get_idle(&key("b:80")).is_none());
        assert!(pool.get_idle(&key("a:80")).is_some());
    }

    #[tokio::test]
    async fn per_host_limit_rejects() {
        let pool = Pool::new(16, 1, None);
        assert!(pool.put_idle(conn(&pool, "a:80")));
        assert!(!pool.put_idle(conn(&pool, "a:80")));
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn global_limit_evicts_oldest() {
        let pool = Pool::new(2, 4, None);
        let oldest = conn(&pool, "a:80");
        assert!(pool.put_idle(oldest.clone()));
        assert!(pool.put_idle(conn(&pool, "b:80")));
        assert!(pool.put_idle(conn(&pool, "c:80")));
        assert_eq!(pool.idle_count(), 2);
        assert!(pool.get_idle(&key("a:80")).is_none(), "oldest was evicted");
        assert!(oldest.is_broken());
    }

    #[tokio::test]
    async fn waiter_gets_conn_directly() {
        let pool = Pool::new(16, 4, None);
        let rx = pool.waiter(&key("a:80"));
        let pc = conn(&pool, "a:80");
        assert!(pool.put_idle(pc.clone()));
        // handed off, never entered the idle list
        assert_eq!(pool.idle_count(), 0);
        let got = rx.await.unwrap();
        assert!(Arc::ptr_eq(&got, &pc));
    }

    #[tokio::test]
    async fn close_idle_flag_rejects_until_next_waiter() {
        let pool = Pool::new(16, 4, None);
        let pc = conn(&pool, "a:80");
        assert!(pool.put_idle(pc.clone()));
        pool.close_idle();
        assert_eq!(pool.idle_count(), 0);
        assert!(pc.is_broken());

        assert!(!pool.put_idle(conn(&pool, "a:80")), "puts rejected");
        let _rx = pool.waiter(&key("a:80"));
        assert!(pool.put_idle(conn(&pool, "b:80")), "activity un-flags");
    }

    #[tokio::test]
    async fn idle_timeout_expires_conn() {
        tokio::time::pause();
        let pool = Pool::new(16, 4, Some(Duration::from_secs(1)));
        let pc = conn(&pool, "a:80");
        assert!(pool.put_idle(pc.clone()));
        assert_eq!(pool.idle_count(), 1);

        tokio::time::advance(Duration::from_millis(1500)).await;
        // let the timer task run
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(pool.idle_count(), 0);
        assert!(pool.get_idle(&key("a:80")).is_none());
    }

    #[tokio::test]
    async fn reuse_beats_idle_timer() {
        tokio::time::pause();
        let pool = Pool::new(16, 4, Some(Duration::from_secs(1)));
        let pc = conn(&pool, "a:80");
        assert!(pool.put_idle(pc.clone()));
        let got = pool.get_idle(&key("a:80")).unwrap();
        assert!(Arc::ptr_eq(&got, &pc));

        tokio::time::advance(Duration::from_millis(1500)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        // the timer lost the race; the conn is still usable
        assert!(!got.is_broken());
    }
}
