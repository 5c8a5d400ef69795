//! Per-reservation mutual exclusion.
//!
//! Cancellation, payment and reconciliation of the same reservation are
//! serialized so that confirm-versus-cancel races resolve to exactly one
//! outcome. Different reservations never block each other.

use crate::types::ReservationId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    users: usize,
}

type LockTable = Arc<Mutex<HashMap<ReservationId, Slot>>>;

/// Keyed async locks, one per reservation in use.
///
/// A slot counts its holder and waiters. It is removed when the last of them
/// goes away, including a waiter whose `lock` future is dropped before it
/// acquires the lock.
#[derive(Clone, Debug, Default)]
pub struct ReservationLocks {
    table: LockTable,
}

impl ReservationLocks {
    /// Create an empty lock table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `reservation_id`.
    pub async fn lock(&self, reservation_id: ReservationId) -> ReservationGuard {
        let mutex = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            let slot = table.entry(reservation_id).or_default();
            slot.users += 1;
            Arc::clone(&slot.mutex)
        };
        let registration = Registration {
            reservation_id,
            table: Arc::clone(&self.table),
        };
        let guard = mutex.lock_owned().await;
        ReservationGuard {
            _guard: guard,
            _registration: registration,
        }
    }

    /// Number of reservations currently locked or awaited.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// One holder or waiter counted in a slot.
#[derive(Debug)]
struct Registration {
    reservation_id: ReservationId,
    table: LockTable,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = table.get_mut(&self.reservation_id) {
            slot.users -= 1;
            if slot.users == 0 {
                table.remove(&self.reservation_id);
            }
        }
    }
}

/// Exclusive access to one reservation until dropped.
#[derive(Debug)]
pub struct ReservationGuard {
    // Declared first so the mutex is released before the slot is retired.
    _guard: OwnedMutexGuard<()>,
    _registration: Registration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_reservation_is_exclusive() {
        let locks = ReservationLocks::new();
        let id = ReservationId::new();

        let guard = locks.lock(id).await;
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(id).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        let joined = tokio::time::timeout(Duration::from_secs(1), contender).await;
        assert!(matches!(joined, Ok(Ok(()))));
        assert_eq!(locks.in_use(), 0);
    }

    #[tokio::test]
    async fn different_reservations_do_not_block() {
        let locks = ReservationLocks::new();
        let _first = locks.lock(ReservationId::new()).await;
        let second =
            tokio::time::timeout(Duration::from_millis(100), locks.lock(ReservationId::new())).await;
        assert!(second.is_ok());
        assert_eq!(locks.in_use(), 2);
    }

    #[tokio::test]
    async fn abandoned_waiter_leaves_no_entry() {
        let locks = ReservationLocks::new();
        let id = ReservationId::new();

        let holder = locks.lock(id).await;
        let mut waiter = Box::pin(locks.lock(id));
        assert!(futures::poll!(waiter.as_mut()).is_pending());
        assert_eq!(locks.in_use(), 1);

        drop(waiter);
        assert_eq!(locks.in_use(), 1);
        drop(holder);
        assert_eq!(locks.in_use(), 0);

        let timed_out = tokio::time::timeout(Duration::from_millis(10), async {
            let _holder = locks.lock(id).await;
            std::future::pending::<()>().await;
        })
        .await;
        assert!(timed_out.is_err());
        assert_eq!(locks.in_use(), 0);
    }
}
