//! SessionPool - per-client inventory of engine sessions
//!
//! Sessions are either *active* (checked out by one batch) or *idle*; the two
//! sets are disjoint and together form the client's whole inventory. A
//! checkout hands out a `SessionGuard` that puts the session back when it is
//! dropped, so the return happens on every exit path of a batch, panics
//! included.
//!
//! Teardown marks the pool closed and releases idle sessions. Sessions still
//! checked out are released when their guard drops instead of going back to
//! the idle set.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture};
use parking_lot::Mutex;
use thiserror::Error;

use crate::engine::{EngineError, EngineSession};

pub type SessionFactory = Box<dyn Fn() -> BoxFuture<'static, Result<Box<dyn EngineSession>, EngineError>> + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("session pool is closed")]
    Closed,

    #[error("failed to create session: {0}")]
    Create(EngineError),
}

/// Outcome of one acquisition attempt.
pub enum Checkout {
    Ready(SessionGuard),
    /// Nothing idle and no room (or no luck) creating one; retry later.
    Exhausted,
}

struct IdleSession {
    slot: u64,
    session: Arc<dyn EngineSession>,
}

struct PoolState {
    idle: Vec<IdleSession>,
    active: HashSet<u64>,
    /// Sessions being created right now; they count against the cap.
    creating: usize,
    next_slot: u64,
    closed: bool,
}

impl PoolState {
    fn inventory(&self) -> usize {
        self.idle.len() + self.active.len() + self.creating
    }

    fn allocate_slot(&mut self) -> u64 {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }
}

pub struct SessionPool {
    max_sessions: usize,
    factory: SessionFactory,
    state: Mutex<PoolState>,
}

impl SessionPool {
    pub fn new(max_sessions: usize, factory: SessionFactory) -> Arc<Self> {
        Arc::new(Self {
            max_sessions: max_sessions.max(1),
            factory,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                active: HashSet::new(),
                creating: 0,
                next_slot: 0,
                closed: false,
            }),
        })
    }

    /// Add an already-authenticated session to the idle set.
    pub fn seed(&self, session: Box<dyn EngineSession>) {
        let mut state = self.state.lock();
        let slot = state.allocate_slot();
        state.idle.push(IdleSession { slot, session: Arc::from(session) });
    }

    /// Try to check out a session.
    ///
    /// Reuses an idle session first, then creates one if the inventory is
    /// below the cap. A creation failure is only an error when no other
    /// session is alive to wait for.
    pub async fn checkout(self: &Arc<Self>) -> Result<Checkout, PoolError> {
        let slot = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            if let Some(idle) = state.idle.pop() {
                state.active.insert(idle.slot);
                return Ok(Checkout::Ready(self.guard(idle.slot, idle.session)));
            }
            if state.inventory() >= self.max_sessions {
                return Ok(Checkout::Exhausted);
            }
            state.creating += 1;
            state.allocate_slot()
        };

        let reservation = CreateReservation { pool: Arc::as_ref(self), settled: false };
        let created = (self.factory)().await;

        let mut state = self.state.lock();
        reservation.settle(&mut state);
        match created {
            Ok(session) => {
                let session: Arc<dyn EngineSession> = Arc::from(session);
                if state.closed {
                    drop(state);
                    spawn_release(session);
                    return Err(PoolError::Closed);
                }
                state.active.insert(slot);
                Ok(Checkout::Ready(self.guard(slot, session)))
            }
            Err(err) => {
                if state.active.is_empty() && state.idle.is_empty() {
                    Err(PoolError::Create(err))
                } else {
                    tracing::warn!("session creation failed, waiting for an active session: {}", err);
                    Ok(Checkout::Exhausted)
                }
            }
        }
    }

    fn guard(self: &Arc<Self>, slot: u64, session: Arc<dyn EngineSession>) -> SessionGuard {
        SessionGuard {
            pool: Arc::clone(self),
            slot,
            session,
            broken: false,
        }
    }

    fn give_back(&self, slot: u64, session: Arc<dyn EngineSession>, broken: bool) {
        let mut state = self.state.lock();
        state.active.remove(&slot);
        if state.closed || broken {
            drop(state);
            spawn_release(session);
        } else {
            state.idle.push(IdleSession { slot, session });
        }
    }

    /// Close the pool and release every idle session. Idempotent.
    pub async fn teardown(&self) {
        let idle = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        future::join_all(idle.iter().map(|s| s.session.release())).await;
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Holds one unit of `creating` while the factory runs; gives it back on
/// unwind if the factory panics.
struct CreateReservation<'a> {
    pool: &'a SessionPool,
    settled: bool,
}

impl CreateReservation<'_> {
    fn settle(mut self, state: &mut PoolState) {
        state.creating -= 1;
        self.settled = true;
    }
}

impl Drop for CreateReservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.pool.state.lock().creating -= 1;
        }
    }
}

fn spawn_release(session: Arc<dyn EngineSession>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { session.release().await });
        }
        Err(_) => tracing::debug!("no runtime to release session on; dropping it"),
    }
}

/// A checked-out session. Returns itself to the pool on drop.
pub struct SessionGuard {
    pool: Arc<SessionPool>,
    slot: u64,
    session: Arc<dyn EngineSession>,
    broken: bool,
}

impl SessionGuard {
    pub fn session(&self) -> &dyn EngineSession {
        self.session.as_ref()
    }

    /// Discard the session on return instead of reusing it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.pool.give_back(self.slot, Arc::clone(&self.session), self.broken);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ResultSet;
    use crate::value::ParameterMap;
    use async_trait::async_trait;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSession {
        released: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EngineSession for CountingSession {
        async fn execute(&self, _statement: &str, _params: &ParameterMap) -> Result<ResultSet, EngineError> {
            Ok(ResultSet::new(vec![], vec![]))
        }

        async fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_factory(created: Arc<AtomicUsize>, released: Arc<AtomicUsize>) -> SessionFactory {
        Box::new(move || {
            let created = Arc::clone(&created);
            let released = Arc::clone(&released);
            async move {
                created.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(CountingSession { released }) as Box<dyn EngineSession>)
            }
            .boxed()
        })
    }

    fn failing_factory() -> SessionFactory {
        Box::new(|| async { Err::<Box<dyn EngineSession>, _>(EngineError::Other("connection refused".into())) }.boxed())
    }

    /// Panics on its first call, then behaves like `counting_factory`.
    fn panicking_once_factory(released: Arc<AtomicUsize>) -> SessionFactory {
        let calls = Arc::new(AtomicUsize::new(0));
        Box::new(move || {
            let calls = Arc::clone(&calls);
            let released = Arc::clone(&released);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("driver failed while dialing");
                }
                Ok(Box::new(CountingSession { released }) as Box<dyn EngineSession>)
            }
            .boxed()
        })
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn ready(checkout: Checkout) -> SessionGuard {
        match checkout {
            Checkout::Ready(guard) => guard,
            Checkout::Exhausted => panic!("expected a session"),
        }
    }

    #[tokio::test]
    async fn test_seeded_session_reused() {
        let created = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicUsize::new(0));
        let pool = SessionPool::new(2, counting_factory(created.clone(), released.clone()));
        pool.seed(Box::new(CountingSession { released: released.clone() }));

        let guard = ready(pool.checkout().await.unwrap());
        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.idle_count(), 0);
        drop(guard);

        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_creates_up_to_cap_then_exhausted() {
        let created = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicUsize::new(0));
        let pool = SessionPool::new(2, counting_factory(created.clone(), released));

        let first = ready(pool.checkout().await.unwrap());
        let second = ready(pool.checkout().await.unwrap());
        assert!(matches!(pool.checkout().await.unwrap(), Checkout::Exhausted));
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.active_count(), 2);

        drop(first);
        let _third = ready(pool.checkout().await.unwrap());
        assert_eq!(created.load(Ordering::SeqCst), 2);
        drop(second);
    }

    #[tokio::test]
    async fn test_broken_session_discarded() {
        let created = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicUsize::new(0));
        let pool = SessionPool::new(1, counting_factory(created.clone(), released.clone()));

        let mut guard = ready(pool.checkout().await.unwrap());
        guard.mark_broken();
        drop(guard);
        settle().await;

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(released.load(Ordering::SeqCst), 1);

        let _fresh = ready(pool.checkout().await.unwrap());
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_teardown_releases_idle_and_late_returns() {
        let created = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicUsize::new(0));
        let pool = SessionPool::new(3, counting_factory(created, released.clone()));
        pool.seed(Box::new(CountingSession { released: released.clone() }));
        pool.seed(Box::new(CountingSession { released: released.clone() }));

        let in_flight = ready(pool.checkout().await.unwrap());
        pool.teardown().await;
        assert!(pool.is_closed());
        assert_eq!(released.load(Ordering::SeqCst), 1);

        drop(in_flight);
        settle().await;
        assert_eq!(released.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_count(), 0);
        assert!(matches!(pool.checkout().await, Err(PoolError::Closed)));

        pool.teardown().await;
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_factory_frees_its_slot() {
        let released = Arc::new(AtomicUsize::new(0));
        let pool = SessionPool::new(1, panicking_once_factory(released));

        let outcome = std::panic::AssertUnwindSafe(pool.checkout()).catch_unwind().await;
        assert!(outcome.is_err());
        assert_eq!(pool.active_count(), 0);

        let _guard = ready(pool.checkout().await.unwrap());
        assert_eq!(pool.active_count(), 1);
    }

    #[tokio::test]
    async fn test_create_failure_with_nothing_alive_is_error() {
        let pool = SessionPool::new(2, failing_factory());
        assert!(matches!(pool.checkout().await, Err(PoolError::Create(_))));
    }

    #[tokio::test]
    async fn test_create_failure_with_active_session_waits() {
        let released = Arc::new(AtomicUsize::new(0));
        let pool = SessionPool::new(2, failing_factory());
        pool.seed(Box::new(CountingSession { released }));

        let _held = ready(pool.checkout().await.unwrap());
        assert!(matches!(pool.checkout().await.unwrap(), Checkout::Exhausted));
        assert_eq!(pool.active_count(), 1);
    }
}
