//! Per-venue, per-order-category mutual exclusion.
//!
//! The table is indexed by [`Venue`] and [`OrderCategory`]. A slot is held
//! while one operation of that category is outstanding. Every acquisition
//! arms a timer that force-releases the slot after `timeout`, so a hung venue
//! call cannot wedge a category. Each acquisition bumps a generation counter;
//! late releases and timers from an older generation are ignored.

use crate::events::{EngineEvent, EventLog};
use crate::exchange::{
    OpenOrder, OrderCategory, OrderSide, OrderStatus, Venue, VenueClient, VenueResult,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// State of one lock slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LockState {
    pub locked: bool,
    pub pending_order_id: Option<String>,
    pub unlock_deadline: Option<Instant>,
    generation: u64,
}

type LockTable = [[LockState; 4]; 2];

#[derive(Debug, Clone)]
pub struct OrderTypeLocks {
    table: Arc<Mutex<LockTable>>,
    timeout: Duration,
    events: EventLog,
}

impl OrderTypeLocks {
    pub fn new(timeout: Duration, events: EventLog) -> Self {
        Self {
            table: Arc::new(Mutex::new(Default::default())),
            timeout,
            events,
        }
    }

    /// Takes the slot if it is free. Must be called inside a tokio runtime.
    pub fn try_acquire(&self, venue: Venue, category: OrderCategory) -> bool {
        self.acquire_generation(venue, category).is_some()
    }

    /// Like [`try_acquire`](Self::try_acquire) but returns a guard that releases
    /// its own acquisition on drop.
    pub fn acquire_guard(&self, venue: Venue, category: OrderCategory) -> Option<LockGuard> {
        let generation = self.acquire_generation(venue, category)?;
        Some(LockGuard {
            locks: self.clone(),
            venue,
            category,
            generation,
        })
    }

    fn acquire_generation(&self, venue: Venue, category: OrderCategory) -> Option<u64> {
        let deadline = Instant::now() + self.timeout;
        let generation = {
            let mut table = self.table.lock();
            let slot = &mut table[venue.index()][category.index()];
            if slot.locked {
                debug!(%venue, %category, "Order category busy");
                return None;
            }
            slot.generation += 1;
            slot.locked = true;
            slot.pending_order_id = None;
            slot.unlock_deadline = Some(deadline);
            slot.generation
        };

        let locks = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            locks.expire(venue, category, generation);
        });

        Some(generation)
    }

    fn expire(&self, venue: Venue, category: OrderCategory, generation: u64) {
        let pending_order_id = {
            let mut table = self.table.lock();
            let slot = &mut table[venue.index()][category.index()];
            if !slot.locked || slot.generation != generation {
                return;
            }
            let pending = slot.pending_order_id.take();
            slot.locked = false;
            slot.unlock_deadline = None;
            pending
        };

        warn!(%venue, %category, ?pending_order_id, "Lock timed out, force-released");
        self.events.record(EngineEvent::LockTimeout {
            venue,
            category,
            pending_order_id,
        });
    }

    /// Releases the slot. Releasing a free slot is a no-op; returns whether
    /// anything changed.
    pub fn release(&self, venue: Venue, category: OrderCategory) -> bool {
        let mut table = self.table.lock();
        let slot = &mut table[venue.index()][category.index()];
        if !slot.locked {
            return false;
        }
        slot.locked = false;
        slot.pending_order_id = None;
        slot.unlock_deadline = None;
        true
    }

    fn release_generation(&self, venue: Venue, category: OrderCategory, generation: u64) {
        let current = self.table.lock()[venue.index()][category.index()].generation;
        if current == generation {
            self.release(venue, category);
        }
    }

    /// Records the order the current holder is waiting on.
    pub fn set_pending(&self, venue: Venue, category: OrderCategory, order_id: &str) {
        let mut table = self.table.lock();
        let slot = &mut table[venue.index()][category.index()];
        if slot.locked {
            slot.pending_order_id = Some(order_id.to_string());
        }
    }

    /// Releases the slot when its pending order has reached a terminal status.
    pub fn observe(
        &self,
        venue: Venue,
        category: OrderCategory,
        order_id: &str,
        status: OrderStatus,
    ) {
        if !status.is_terminal() {
            return;
        }
        let mut table = self.table.lock();
        let slot = &mut table[venue.index()][category.index()];
        if slot.locked && slot.pending_order_id.as_deref() == Some(order_id) {
            debug!(%venue, %category, %order_id, ?status, "Pending order settled, releasing lock");
            slot.locked = false;
            slot.pending_order_id = None;
            slot.unlock_deadline = None;
        }
    }

    pub fn state(&self, venue: Venue, category: OrderCategory) -> LockState {
        self.table.lock()[venue.index()][category.index()].clone()
    }

    pub fn is_locked(&self, venue: Venue, category: OrderCategory) -> bool {
        self.table.lock()[venue.index()][category.index()].locked
    }
}

/// Releases one specific acquisition on drop.
#[derive(Debug)]
pub struct LockGuard {
    locks: OrderTypeLocks,
    venue: Venue,
    category: OrderCategory,
    generation: u64,
}

impl LockGuard {
    pub fn set_pending(&self, order_id: &str) {
        self.locks.set_pending(self.venue, self.category, order_id);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.locks
            .release_generation(self.venue, self.category, self.generation);
    }
}

/// Open orders of `(category, side)` that should be cancelled: all but the
/// most recently placed one.
pub fn stale_duplicates(
    orders: &[OpenOrder],
    category: OrderCategory,
    side: OrderSide,
) -> Vec<&OpenOrder> {
    let mut matching: Vec<&OpenOrder> = orders
        .iter()
        .filter(|o| o.category == category && o.side == side)
        .collect();
    if matching.len() <= 1 {
        return Vec::new();
    }
    matching.sort_by_key(|o| std::cmp::Reverse(o.placement_key()));
    matching.split_off(1)
}

/// Cancels duplicate open orders on one venue, keeping the latest placed.
/// Returns the open orders that survive.
pub async fn cancel_duplicates(
    client: &dyn VenueClient,
    venue: Venue,
    category: OrderCategory,
    side: OrderSide,
    events: &EventLog,
) -> VenueResult<Vec<OpenOrder>> {
    let orders = client.get_open_orders().await?;
    let stale: Vec<String> = stale_duplicates(&orders, category, side)
        .into_iter()
        .map(|o| o.order_id.clone())
        .collect();

    if stale.is_empty() {
        return Ok(orders);
    }

    let mut cancelled = 0;
    for order_id in &stale {
        match client.cancel_order(order_id).await {
            Ok(()) => cancelled += 1,
            Err(e) => warn!(%venue, %order_id, error = %e, "Failed to cancel duplicate order"),
        }
    }
    events.record(EngineEvent::DuplicatesCancelled {
        venue,
        category,
        cancelled,
    });

    Ok(orders
        .into_iter()
        .filter(|o| !stale.contains(&o.order_id))
        .collect())
}
