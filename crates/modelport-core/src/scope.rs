//! Thread-local "default session" stack.
//!
//! A graph predictor pins its session for the duration of each call by holding
//! a [`SessionScope`]; runtimes check [`active`] before touching their graph.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

thread_local! {
    static ACTIVE: RefCell<Vec<SessionId>> = const { RefCell::new(Vec::new()) };
}

/// The innermost session pinned on this thread.
pub fn active() -> Option<SessionId> {
    ACTIVE.with(|stack| stack.borrow().last().copied())
}

/// Makes a session the thread's default until dropped. Scopes nest.
#[must_use = "the session is only active while the scope is held"]
pub struct SessionScope {
    id: SessionId,
    // Scopes are tied to the thread-local stack they were pushed on.
    _not_send: PhantomData<*const ()>,
}

impl SessionScope {
    pub fn enter(id: SessionId) -> Self {
        ACTIVE.with(|stack| stack.borrow_mut().push(id));
        Self {
            id,
            _not_send: PhantomData,
        }
    }
}

impl Drop for SessionScope {
    fn drop(&mut self) {
        ACTIVE.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert_eq!(popped, Some(self.id), "session scopes dropped out of order");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_nest_and_unwind() {
        let outer = SessionId::next();
        let inner = SessionId::next();
        assert_eq!(active(), None);
        {
            let _outer = SessionScope::enter(outer);
            assert_eq!(active(), Some(outer));
            {
                let _inner = SessionScope::enter(inner);
                assert_eq!(active(), Some(inner));
            }
            assert_eq!(active(), Some(outer));
        }
        assert_eq!(active(), None);
    }

    #[test]
    fn scope_is_released_on_early_return() {
        fn fails(id: SessionId) -> Result<(), ()> {
            let _scope = SessionScope::enter(id);
            Err(())
        }
        assert!(fails(SessionId::next()).is_err());
        assert_eq!(active(), None);
    }

    #[test]
    fn scopes_are_per_thread() {
        let id = SessionId::next();
        let _scope = SessionScope::enter(id);
        let seen = std::thread::spawn(active).join().unwrap();
        assert_eq!(seen, None);
    }
}
