//! Per-order fill state shared between broker callbacks and fill waits

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::order::{Fill, OrderStatus};

/// Outcome of waiting on an order
#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    Filled(Fill),
    /// Terminal status without a fill
    Rejected(OrderStatus),
    TimedOut,
}

impl FillOutcome {
    pub fn fill(&self) -> Option<&Fill> {
        match self {
            Self::Filled(fill) => Some(fill),
            _ => None,
        }
    }
}

/// Which side of an order is done with its entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Done {
    Waiter,
    Tracker,
}

/// order id -> latest status and fill. Cloning shares the same maps.
///
/// An entry is dropped once both the fill waiter and the status tracker
/// feeding it are done, whichever finishes last.
#[derive(Debug, Clone, Default)]
pub struct FillBook {
    statuses: Arc<DashMap<i32, OrderStatus>>,
    fills: Arc<DashMap<i32, Fill>>,
    done: Arc<DashMap<i32, Done>>,
}

impl FillBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_status(&self, order_id: i32, status: OrderStatus) {
        debug!(order_id, %status, "order status");
        self.statuses.insert(order_id, status);
    }

    pub fn record_fill(&self, order_id: i32, fill: Fill) {
        debug!(order_id, price = fill.avg_fill_price, qty = fill.filled_quantity, "order filled");
        self.statuses.insert(order_id, fill.status.clone());
        self.fills.insert(order_id, fill);
    }

    pub fn status(&self, order_id: i32) -> Option<OrderStatus> {
        self.statuses.get(&order_id).map(|s| s.clone())
    }

    /// Current outcome if the order has reached a terminal state
    pub fn poll(&self, order_id: i32) -> Option<FillOutcome> {
        if let Some(fill) = self.fills.get(&order_id) {
            return Some(FillOutcome::Filled(fill.clone()));
        }
        match self.statuses.get(&order_id) {
            Some(status) if status.is_rejection() => Some(FillOutcome::Rejected(status.clone())),
            _ => None,
        }
    }

    /// Poll every `poll_interval` until the order fills, is rejected, or
    /// `timeout` elapses.
    pub async fn wait(&self, order_id: i32, timeout: Duration, poll_interval: Duration) -> FillOutcome {
        let waiting = async {
            loop {
                if let Some(outcome) = self.poll(order_id) {
                    return outcome;
                }
                tokio::time::sleep(poll_interval).await;
            }
        };
        tokio::time::timeout(timeout, waiting)
            .await
            .unwrap_or(FillOutcome::TimedOut)
    }

    /// Drop state for an order nobody will wait on again
    pub fn forget(&self, order_id: i32) {
        self.statuses.remove(&order_id);
        self.fills.remove(&order_id);
        self.done.remove(&order_id);
    }

    /// The waiter has its outcome, or gave up on a timeout
    pub fn release(&self, order_id: i32) {
        self.finish(order_id, Done::Waiter);
    }

    /// The status tracker has stopped receiving updates
    pub fn settle(&self, order_id: i32) {
        self.finish(order_id, Done::Tracker);
    }

    fn finish(&self, order_id: i32, side: Done) {
        let both = match self.done.entry(order_id) {
            Entry::Occupied(entry) if *entry.get() != side => {
                entry.remove();
                true
            }
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(side);
                false
            }
        };
        if both {
            debug!(order_id, "order state released");
            self.statuses.remove(&order_id);
            self.fills.remove(&order_id);
        }
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_sees_late_fill() {
        let book = FillBook::new();
        let writer = book.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer.record_status(7, OrderStatus::Submitted);
            writer.record_fill(7, Fill::at(101.25, 5.0));
        });

        let outcome = book
            .wait(7, Duration::from_secs(2), Duration::from_millis(5))
            .await;
        assert_eq!(outcome.fill().map(|f| f.avg_fill_price), Some(101.25));
        assert_eq!(book.status(7), Some(OrderStatus::Filled));
    }

    #[tokio::test]
    async fn test_wait_rejection() {
        let book = FillBook::new();
        book.record_status(3, OrderStatus::Rejected);
        let outcome = book
            .wait(3, Duration::from_secs(1), Duration::from_millis(5))
            .await;
        assert_eq!(outcome, FillOutcome::Rejected(OrderStatus::Rejected));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let book = FillBook::new();
        book.record_status(9, OrderStatus::Submitted);
        let outcome = book
            .wait(9, Duration::from_millis(40), Duration::from_millis(5))
            .await;
        assert_eq!(outcome, FillOutcome::TimedOut);

        book.forget(9);
        assert_eq!(book.status(9), None);
    }

    #[tokio::test]
    async fn test_late_fill_after_timeout_is_released() {
        let book = FillBook::new();
        book.record_status(11, OrderStatus::Submitted);
        let outcome = book
            .wait(11, Duration::from_millis(20), Duration::from_millis(5))
            .await;
        assert_eq!(outcome, FillOutcome::TimedOut);
        book.release(11);
        assert_eq!(book.len(), 1);

        // the tracker sees the fill after the waiter left
        book.record_fill(11, Fill::at(50.0, 2.0));
        book.settle(11);
        assert!(book.is_empty());
    }

    #[test]
    fn test_tracker_done_before_waiter() {
        let book = FillBook::new();
        book.record_fill(12, Fill::at(20.0, 1.0));
        book.settle(12);
        assert!(book.poll(12).is_some());
        book.release(12);
        assert!(book.is_empty());
        assert_eq!(book.status(12), None);
    }
}
