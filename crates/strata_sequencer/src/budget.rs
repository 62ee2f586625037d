//! Token budget bounding concurrent background operations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counted semaphore bounding concurrent background operations.
///
/// Acquisition is non-blocking. The limit may be lowered below the number of
/// tokens currently out; the budget then shrinks as tokens come back.
#[derive(Clone, Debug)]
pub struct ResourceBudget {
    inner: Arc<BudgetInner>,
}

#[derive(Debug)]
struct BudgetInner {
    limit: AtomicUsize,
    in_use: AtomicUsize,
}

impl ResourceBudget {
    pub fn new(limit: usize) -> Self {
        ResourceBudget {
            inner: Arc::new(BudgetInner {
                limit: AtomicUsize::new(limit),
                in_use: AtomicUsize::new(0),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.limit.load(Ordering::Acquire)
    }

    pub fn set_limit(&self, limit: usize) {
        self.inner.limit.store(limit, Ordering::Release);
    }

    /// Tokens currently out.
    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Acquire)
    }

    /// Credits still available for acquisition.
    pub fn available(&self) -> usize {
        self.limit().saturating_sub(self.in_use())
    }

    /// Draw one credit, or `None` when the budget is exhausted.
    pub fn acquire(&self) -> Option<Token> {
        let mut current = self.inner.in_use.load(Ordering::Acquire);
        loop {
            if current >= self.inner.limit.load(Ordering::Acquire) {
                return None;
            }
            match self.inner.in_use.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(Token {
                        inner: Some(Arc::clone(&self.inner)),
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }
}

/// A credit drawn from a [`ResourceBudget`].
///
/// A token is affine: it can be moved into the record of an in-flight
/// operation with [`Token::take`] or given back with [`Token::release`],
/// never duplicated. Dropping a live token releases it.
#[derive(Debug)]
pub struct Token {
    inner: Option<Arc<BudgetInner>>,
}

impl Token {
    pub fn valid(&self) -> bool {
        self.inner.is_some()
    }

    /// Return the credit to the budget. Safe to call twice.
    pub fn release(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.in_use.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Move the credit out, leaving this handle invalid.
    pub fn take(&mut self) -> Token {
        Token {
            inner: self.inner.take(),
        }
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.release();
    }
}
