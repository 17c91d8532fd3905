//! Client-side buffer budget
//!
//! Counts documents held by all partitions of one query: reserved for an
//! in-flight fetch or queued in a page. A cursor's current document is
//! released when the cursor moves onto it, so `used` never includes it.
//!
//! # Admission
//!
//! - Prefetch is admitted only while `used + ceil(page_size * 1.1)` fits below
//!   `capacity - headroom`; the headroom is kept for demand fetches
//! - A demand fetch takes what is free minus one unit, shrinking its page to
//!   fit. The last unit is a single-document slot: only a demand fetch that
//!   finds exactly one unit free may take it, and its document becomes a
//!   cursor's current document the moment it arrives
//! - A demand fetch that finds nothing free waits for a release
//!
//! `used` therefore never exceeds `capacity`, and the slot is always
//! returned without help from other partitions, so a merge waiting on one
//! partition's head cannot stall.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{QueryError, QueryResult};
use crate::observability::Event;

/// Shared buffered-document counter for one query execution
#[derive(Debug)]
pub struct BufferBudget {
    capacity: usize,
    used: AtomicUsize,
    high_water: AtomicUsize,
    released: Notify,
}

impl BufferBudget {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            used: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            released: Notify::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    /// Most documents ever held at once
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }

    fn headroom(&self) -> usize {
        (self.capacity / 4).max(1).min(self.capacity)
    }

    /// Reserves a full page for a background fetch, if the estimate fits.
    pub fn try_reserve_prefetch(self: &Arc<Self>, page_size: usize) -> Option<Reservation> {
        let estimate = (page_size as f64 * 1.1).ceil() as usize;
        let limit = self.capacity - self.headroom();

        let mut current = self.used.load(Ordering::SeqCst);
        loop {
            if current.saturating_add(estimate) > limit {
                return None;
            }
            match self.used.compare_exchange(
                current,
                current + page_size,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.high_water.fetch_max(current + page_size, Ordering::SeqCst);
                    return Some(self.reservation(page_size));
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Reserves up to `page_size` documents for a fetch the consumer is
    /// waiting on, without waiting. `None` when the budget is full.
    pub fn try_reserve_demand(self: &Arc<Self>, page_size: usize) -> Option<Reservation> {
        let wanted = page_size.max(1);

        let mut current = self.used.load(Ordering::SeqCst);
        loop {
            let amount = match self.capacity.saturating_sub(current) {
                0 => return None,
                1 => 1,
                free => wanted.min(free - 1),
            };

            match self.used.compare_exchange(
                current,
                current + amount,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.high_water.fetch_max(current + amount, Ordering::SeqCst);
                    return Some(self.reservation(amount));
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Reserves up to `page_size` documents for a fetch the consumer is
    /// waiting on, waiting for a release while the budget is full.
    pub async fn reserve_demand(
        self: &Arc<Self>,
        page_size: usize,
        cancel: &CancellationToken,
    ) -> QueryResult<Reservation> {
        let mut logged = false;
        loop {
            // Registered before the check so a release in between is not missed.
            let released = self.released.notified();
            if let Some(reservation) = self.try_reserve_demand(page_size) {
                return Ok(reservation);
            }

            if !logged {
                debug!(
                    event = %Event::BufferWait,
                    capacity = self.capacity,
                    used = self.used(),
                    "buffer full; demand fetch waiting"
                );
                logged = true;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(QueryError::Cancelled),
                _ = released => {}
            }
        }
    }

    /// Returns `count` documents to the budget.
    pub fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some(used.saturating_sub(count))
            });
        self.released.notify_waiters();
    }

    fn reservation(self: &Arc<Self>, amount: usize) -> Reservation {
        Reservation {
            budget: Arc::clone(self),
            amount,
        }
    }
}

/// Budget held for one fetch; released on drop unless committed
#[derive(Debug)]
pub struct Reservation {
    budget: Arc<BufferBudget>,
    amount: usize,
}

impl Reservation {
    pub fn amount(&self) -> usize {
        self.amount
    }

    /// Keeps `items` of the reservation as buffered documents and returns
    /// the rest.
    pub fn commit(mut self, items: usize) {
        let kept = items.min(self.amount);
        self.budget.release(self.amount - kept);
        self.amount = 0;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.budget.release(self.amount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefetch_respects_headroom() {
        let budget = BufferBudget::new(100);
        let first = budget.try_reserve_prefetch(30).unwrap();
        let second = budget.try_reserve_prefetch(30).unwrap();
        assert_eq!(budget.used(), 60);

        // 60 + 33 exceeds 100 - 25
        assert!(budget.try_reserve_prefetch(30).is_none());

        drop(first);
        assert_eq!(budget.used(), 30);
        drop(second);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn test_commit_keeps_received_items() {
        let budget = BufferBudget::new(100);
        let reservation = budget.try_reserve_prefetch(20).unwrap();
        reservation.commit(7);
        assert_eq!(budget.used(), 7);

        budget.release(7);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn test_demand_keeps_the_last_unit_back() {
        let budget = BufferBudget::new(10);
        let held = budget.try_reserve_demand(8).unwrap();
        assert_eq!(held.amount(), 8);

        // 2 free: one for this page, one kept for the single-document slot
        let rest = budget.try_reserve_demand(8).unwrap();
        assert_eq!(rest.amount(), 1);

        let slot = budget.try_reserve_demand(8).unwrap();
        assert_eq!(slot.amount(), 1);
        assert!(budget.try_reserve_demand(8).is_none());
        assert_eq!(budget.high_water(), 10);
    }

    #[test]
    fn test_capacity_of_one_is_all_slot() {
        let budget = BufferBudget::new(1);
        assert!(budget.try_reserve_prefetch(1).is_none());

        let slot = budget.try_reserve_demand(5).unwrap();
        assert_eq!(slot.amount(), 1);
        assert!(budget.try_reserve_demand(5).is_none());

        drop(slot);
        assert_eq!(budget.try_reserve_demand(5).unwrap().amount(), 1);
    }

    #[tokio::test]
    async fn test_full_budget_waits_for_release() {
        let budget = BufferBudget::new(2);
        let cancel = CancellationToken::new();
        let held = budget.reserve_demand(2, &cancel).await.unwrap();
        let slot = budget.reserve_demand(2, &cancel).await.unwrap();
        assert_eq!((held.amount(), slot.amount()), (1, 1));

        let waiter = {
            let budget = Arc::clone(&budget);
            let cancel = cancel.clone();
            tokio::spawn(async move { budget.reserve_demand(2, &cancel).await.map(|r| r.amount()) })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        slot.commit(1);
        budget.release(1);
        assert_eq!(waiter.await.unwrap().unwrap(), 1);
        assert!(budget.high_water() <= budget.capacity());
        drop(held);
    }

    #[tokio::test]
    async fn test_waiting_demand_observes_cancellation() {
        let budget = BufferBudget::new(1);
        let cancel = CancellationToken::new();
        let _slot = budget.reserve_demand(1, &cancel).await.unwrap();

        cancel.cancel();
        let result = budget.reserve_demand(1, &cancel).await;
        assert!(matches!(result, Err(QueryError::Cancelled)));
    }

    #[tokio::test]
    async fn test_concurrent_demands_never_exceed_capacity() {
        let budget = BufferBudget::new(2);
        let cancel = CancellationToken::new();

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let budget = Arc::clone(&budget);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let reservation = budget.reserve_demand(4, &cancel).await?;
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                // The document becomes the cursor's current one.
                reservation.commit(1);
                budget.release(1);
                Ok::<_, QueryError>(())
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(budget.used(), 0);
        assert!(budget.high_water() <= budget.capacity());
    }

    #[test]
    fn test_release_saturates() {
        let budget = BufferBudget::new(4);
        budget.release(3);
        assert_eq!(budget.used(), 0);
    }
}
