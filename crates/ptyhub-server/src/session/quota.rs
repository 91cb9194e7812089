//! Per-user session quota.
//!
//! A [`QuotaPermit`] is taken before a shell is spawned and travels with the
//! registry entry, so concurrent creates for one user cannot overshoot and
//! the slot frees itself when the entry is dropped.

use ptyhub_core::{PtyError, PtyResult, QuotaScope};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct Counts {
    per_user: HashMap<String, usize>,
    total: usize,
}

/// Counts live (and in-flight) sessions per user and overall.
#[derive(Debug, Clone)]
pub struct QuotaLedger {
    per_user_limit: usize,
    total_limit: usize,
    counts: Arc<Mutex<Counts>>,
}

impl QuotaLedger {
    pub fn new(per_user_limit: usize, total_limit: usize) -> Self {
        Self {
            per_user_limit,
            total_limit,
            counts: Arc::new(Mutex::new(Counts::default())),
        }
    }

    /// Reserve a slot for `user`, or fail with `ResourceExhausted`.
    pub fn try_acquire(&self, user: &str) -> PtyResult<QuotaPermit> {
        let mut counts = lock(&self.counts);
        let used = counts.per_user.get(user).copied().unwrap_or(0);
        if used >= self.per_user_limit {
            return Err(PtyError::ResourceExhausted {
                user: user.to_string(),
                limit: self.per_user_limit,
                scope: QuotaScope::User,
            });
        }
        if counts.total >= self.total_limit {
            return Err(PtyError::ResourceExhausted {
                user: user.to_string(),
                limit: self.total_limit,
                scope: QuotaScope::Global,
            });
        }

        *counts.per_user.entry(user.to_string()).or_insert(0) += 1;
        counts.total += 1;
        debug!(user, used = used + 1, "quota slot acquired");

        Ok(QuotaPermit {
            user: user.to_string(),
            counts: self.counts.clone(),
        })
    }

    /// Slots currently held by `user`.
    pub fn in_use(&self, user: &str) -> usize {
        lock(&self.counts).per_user.get(user).copied().unwrap_or(0)
    }
}

/// One reserved session slot. Released on drop.
#[derive(Debug)]
pub struct QuotaPermit {
    user: String,
    counts: Arc<Mutex<Counts>>,
}

impl Drop for QuotaPermit {
    fn drop(&mut self) {
        let mut counts = lock(&self.counts);
        counts.total = counts.total.saturating_sub(1);
        if let Some(n) = counts.per_user.get_mut(&self.user) {
            *n -= 1;
            if *n == 0 {
                counts.per_user.remove(&self.user);
            }
        }
    }
}

fn lock(m: &Mutex<Counts>) -> MutexGuard<'_, Counts> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_user_limit_is_enforced() {
        let ledger = QuotaLedger::new(2, 100);
        let a = ledger.try_acquire("alice").unwrap();
        let _b = ledger.try_acquire("alice").unwrap();
        assert!(matches!(
            ledger.try_acquire("alice"),
            Err(PtyError::ResourceExhausted {
                limit: 2,
                scope: QuotaScope::User,
                ..
            })
        ));
        // Other users are unaffected.
        let _c = ledger.try_acquire("bob").unwrap();

        drop(a);
        assert_eq!(ledger.in_use("alice"), 1);
        assert!(ledger.try_acquire("alice").is_ok());
    }

    #[test]
    fn total_limit_is_enforced() {
        let ledger = QuotaLedger::new(10, 2);
        let _a = ledger.try_acquire("alice").unwrap();
        let _b = ledger.try_acquire("bob").unwrap();
        let err = ledger.try_acquire("carol").unwrap_err();
        match err {
            PtyError::ResourceExhausted { user, limit, scope } => {
                assert_eq!(user, "carol");
                assert_eq!(limit, 2);
                assert_eq!(scope, QuotaScope::Global);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(ledger.in_use("carol"), 0);
    }

    #[test]
    fn dropping_permits_clears_counts() {
        let ledger = QuotaLedger::new(3, 3);
        let permits: Vec<_> = (0..3).map(|_| ledger.try_acquire("alice").unwrap()).collect();
        assert!(ledger.try_acquire("bob").is_err());
        drop(permits);
        assert_eq!(ledger.in_use("alice"), 0);
        // The global slots are free again too.
        assert!(ledger.try_acquire("bob").is_ok());
    }

    #[test]
    fn concurrent_acquires_never_overshoot() {
        let ledger = QuotaLedger::new(5, 100);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || ledger.try_acquire("alice").ok())
            })
            .collect();
        let granted: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(granted.len(), 5);
        assert_eq!(ledger.in_use("alice"), 5);
    }
}
