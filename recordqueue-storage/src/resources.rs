//! Byte budgets shared by all queues of a storage.
//!
//! A [`ResourceBudget`] caps the number of bytes that may be reserved at the same time. The
//! storage owns two of them: one for bytes on disk and one for bytes staged in memory. Every
//! queue holds a handle to both, so reservations made by one queue are visible to all others.
//!
//! Reservations are either released explicitly with [`ResourceBudget::release`], or held by a
//! [`ScopedReservation`] that returns its bytes when dropped.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A named byte quota with atomic reserve/release.
#[derive(Clone)]
pub struct ResourceBudget(Arc<BudgetInner>);

struct BudgetInner {
    name: &'static str,
    total: u64,
    used: AtomicU64,
}

impl ResourceBudget {
    /// Creates a new budget with the given capacity in bytes.
    pub fn new(name: &'static str, total: u64) -> Self {
        Self(Arc::new(BudgetInner {
            name,
            total,
            used: AtomicU64::new(0),
        }))
    }

    /// Returns the name of this budget, used for diagnostics.
    pub fn name(&self) -> &'static str {
        self.0.name
    }

    /// Returns the capacity of this budget in bytes.
    pub fn total(&self) -> u64 {
        self.0.total
    }

    /// Returns the number of bytes currently reserved.
    pub fn used(&self) -> u64 {
        self.0.used.load(Ordering::Acquire)
    }

    /// Returns the number of bytes that can still be reserved.
    pub fn available(&self) -> u64 {
        self.total().saturating_sub(self.used())
    }

    /// Reserves `bytes` if the budget can hold them.
    ///
    /// Returns `false` and reserves nothing otherwise. A reservation is never truncated.
    pub fn try_reserve(&self, bytes: u64) -> bool {
        let total = self.0.total;
        self.0
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&new| new <= total)
            })
            .is_ok()
    }

    /// Reserves `bytes` and returns a guard that releases them on drop.
    pub fn try_reserve_scoped(&self, bytes: u64) -> Option<ScopedReservation> {
        self.try_reserve(bytes).then(|| ScopedReservation {
            budget: Some(self.clone()),
            size: bytes,
        })
    }

    /// Returns `bytes` to the budget.
    ///
    /// Releasing more than is reserved is a bug. Debug builds panic, release builds clamp the
    /// usage to zero.
    pub fn release(&self, bytes: u64) {
        let previous = self
            .0
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            })
            .unwrap_or_default();

        debug_assert!(
            previous >= bytes,
            "released {bytes} bytes from {} budget with only {previous} reserved",
            self.0.name
        );
        if previous < bytes {
            tracing::error!(
                budget = self.0.name,
                bytes,
                reserved = previous,
                "released more bytes than reserved"
            );
        }
    }

    /// Periodically calls `emit` with the current usage.
    ///
    /// This future runs forever and is intended to be spawned as a background task alongside the
    /// storage.
    pub async fn run_emitter<F, Fut>(&self, interval: Duration, mut emit: F)
    where
        F: FnMut(u64, u64) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            emit(self.used(), self.total()).await;
        }
    }
}

impl fmt::Debug for ResourceBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceBudget")
            .field("name", &self.0.name)
            .field("total", &self.0.total)
            .field("used", &self.used())
            .finish()
    }
}

/// RAII guard for bytes reserved in a [`ResourceBudget`].
///
/// Dropping the guard releases the reserved bytes back to the budget.
#[derive(Debug)]
pub struct ScopedReservation {
    budget: Option<ResourceBudget>,
    size: u64,
}

impl ScopedReservation {
    /// Returns a reservation that holds nothing.
    pub fn empty() -> Self {
        Self {
            budget: None,
            size: 0,
        }
    }

    /// Returns the number of reserved bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Shrinks the reservation to `new_size`, releasing the difference immediately.
    ///
    /// Growing a reservation is not possible, larger values are ignored.
    pub fn reduce(&mut self, new_size: u64) {
        if new_size >= self.size {
            return;
        }
        if let Some(budget) = &self.budget {
            budget.release(self.size - new_size);
        }
        self.size = new_size;
    }
}

impl Drop for ScopedReservation {
    fn drop(&mut self) {
        if let Some(budget) = self.budget.take() {
            budget.release(self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::thread;

    use super::*;

    #[test]
    fn reserve_and_release() {
        let budget = ResourceBudget::new("disk", 100);
        assert_eq!(budget.used(), 0);

        assert!(budget.try_reserve(60));
        assert_eq!(budget.used(), 60);

        assert!(budget.try_reserve(40));
        assert_eq!(budget.used(), 100);
        assert_eq!(budget.available(), 0);

        budget.release(60);
        assert_eq!(budget.used(), 40);

        budget.release(40);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn over_capacity_rejects_without_reserving() {
        let budget = ResourceBudget::new("disk", 100);
        assert!(budget.try_reserve(70));

        assert!(!budget.try_reserve(31));
        assert_eq!(budget.used(), 70);

        assert!(budget.try_reserve(30));
        assert!(!budget.try_reserve(1));
    }

    #[test]
    fn scoped_reservation_releases_on_drop() {
        let budget = ResourceBudget::new("memory", 10);

        let reservation = budget.try_reserve_scoped(8).unwrap();
        assert_eq!(reservation.size(), 8);
        assert!(budget.try_reserve_scoped(3).is_none());

        drop(reservation);
        assert_eq!(budget.used(), 0);
        assert!(budget.try_reserve_scoped(10).is_some());
    }

    #[test]
    fn scoped_reservation_reduce() {
        let budget = ResourceBudget::new("memory", 10);
        let mut reservation = budget.try_reserve_scoped(8).unwrap();

        reservation.reduce(3);
        assert_eq!(budget.used(), 3);

        reservation.reduce(5);
        assert_eq!(reservation.size(), 3);

        drop(reservation);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn shared_between_clones() {
        let budget = ResourceBudget::new("disk", 10);
        let other = budget.clone();

        assert!(budget.try_reserve(6));
        assert!(!other.try_reserve(6));
        assert_eq!(other.used(), 6);
    }

    #[test]
    fn concurrent_reservations_never_exceed_total() {
        let budget = ResourceBudget::new("disk", 1000);
        let granted = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let budget = budget.clone();
                let granted = Arc::clone(&granted);
                thread::spawn(move || {
                    for _ in 0..100 {
                        if budget.try_reserve(7) {
                            granted.fetch_add(7, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(budget.used() <= budget.total());
        assert_eq!(budget.used(), granted.load(Ordering::Relaxed));
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn release_clamps_to_zero() {
        let budget = ResourceBudget::new("disk", 10);
        assert!(budget.try_reserve(4));
        budget.release(9);
        assert_eq!(budget.used(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn emitter_reports_usage() {
        let budget = ResourceBudget::new("disk", 50);
        assert!(budget.try_reserve(20));

        let reported = Arc::new(AtomicU64::new(0));
        let reported_clone = Arc::clone(&reported);

        let emitter = budget.run_emitter(Duration::from_secs(1), move |used, _total| {
            let reported = Arc::clone(&reported_clone);
            async move {
                reported.store(used, Ordering::Relaxed);
            }
        });

        tokio::select! {
            _ = emitter => unreachable!("emitter runs forever"),
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }

        assert_eq!(reported.load(Ordering::Relaxed), 20);
    }
}
