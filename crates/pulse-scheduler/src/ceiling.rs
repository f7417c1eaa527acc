use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Per-process cap on how many jobs may be locked at once.
///
/// Not shared between processes: every worker enforces its own ceiling, so
/// fleet-wide concurrency can exceed any one worker's limit.
#[derive(Debug)]
pub struct LockCeiling {
    limit: AtomicI64,
    locked: AtomicUsize,
}

impl LockCeiling {
    pub fn new(limit: i64) -> Self {
        Self {
            limit: AtomicI64::new(limit),
            locked: AtomicUsize::new(0),
        }
    }

    /// Takes effect on the next reservation. Zero or negative stops dispatch.
    pub fn set_limit(&self, limit: i64) {
        self.limit.store(limit, Ordering::Release);
    }

    pub fn limit(&self) -> i64 {
        self.limit.load(Ordering::Acquire)
    }

    /// Slots currently held by reservations and claimed jobs.
    pub fn locked(&self) -> usize {
        self.locked.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        free_slots(self.limit(), self.locked())
    }

    /// Atomically take up to `wanted` free slots.
    ///
    /// Slots not converted into [`LockSlot`]s are returned when the
    /// reservation drops, so a claim that finds fewer due jobs than reserved
    /// gives the difference back.
    pub fn reserve(self: &Arc<Self>, wanted: usize) -> Reservation {
        let mut locked = self.locked.load(Ordering::Acquire);
        loop {
            let take = free_slots(self.limit(), locked).min(wanted);
            if take == 0 {
                return Reservation {
                    ceiling: Arc::clone(self),
                    remaining: 0,
                };
            }
            match self.locked.compare_exchange_weak(
                locked,
                locked + take,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Reservation {
                        ceiling: Arc::clone(self),
                        remaining: take,
                    }
                }
                Err(current) => locked = current,
            }
        }
    }

    fn release(&self, n: usize) {
        if n > 0 {
            self.locked.fetch_sub(n, Ordering::AcqRel);
        }
    }
}

fn free_slots(limit: i64, locked: usize) -> usize {
    if limit <= 0 {
        return 0;
    }
    usize::try_from(limit).unwrap_or(usize::MAX).saturating_sub(locked)
}

/// Slots taken from a [`LockCeiling`] but not yet bound to a job.
#[derive(Debug)]
pub struct Reservation {
    ceiling: Arc<LockCeiling>,
    remaining: usize,
}

impl Reservation {
    pub fn len(&self) -> usize {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// Convert one reserved slot into a slot held by a claimed job.
    pub fn take(&mut self) -> Option<LockSlot> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(LockSlot {
            ceiling: Arc::clone(&self.ceiling),
        })
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.ceiling.release(self.remaining);
    }
}

/// One locked job's share of the ceiling. Released on drop.
#[derive(Debug)]
pub struct LockSlot {
    ceiling: Arc<LockCeiling>,
}

impl Drop for LockSlot {
    fn drop(&mut self) {
        self.ceiling.release(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_caps_at_limit() {
        let ceiling = Arc::new(LockCeiling::new(3));
        let r = ceiling.reserve(5);
        assert_eq!(r.len(), 3);
        assert_eq!(ceiling.available(), 0);
        assert!(ceiling.reserve(1).is_empty());
    }

    #[test]
    fn non_positive_limit_never_reserves() {
        let ceiling = Arc::new(LockCeiling::new(0));
        assert!(ceiling.reserve(10).is_empty());
        ceiling.set_limit(-4);
        assert!(ceiling.reserve(10).is_empty());
        assert_eq!(ceiling.locked(), 0);
    }

    #[test]
    fn unused_reservation_is_returned_on_drop() {
        let ceiling = Arc::new(LockCeiling::new(4));
        let slot = {
            let mut r = ceiling.reserve(4);
            r.take()
        };
        assert!(slot.is_some());
        assert_eq!(ceiling.locked(), 1);
        drop(slot);
        assert_eq!(ceiling.locked(), 0);
    }

    #[test]
    fn lowering_limit_below_locked_blocks_new_reservations() {
        let ceiling = Arc::new(LockCeiling::new(5));
        let mut r = ceiling.reserve(2);
        let _a = r.take();
        let _b = r.take();
        ceiling.set_limit(1);
        assert_eq!(ceiling.available(), 0);
        assert!(ceiling.reserve(1).is_empty());
    }

    #[test]
    fn concurrent_reservations_never_overshoot() {
        let ceiling = Arc::new(LockCeiling::new(8));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ceiling = Arc::clone(&ceiling);
                std::thread::spawn(move || ceiling.reserve(1).take())
            })
            .collect();
        let slots: Vec<LockSlot> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(slots.len(), 8);
        assert_eq!(ceiling.locked(), 8);
        drop(slots);
        assert_eq!(ceiling.locked(), 0);
    }
}
