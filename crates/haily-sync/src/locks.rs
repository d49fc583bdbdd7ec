//! Per-date write exclusion and the single-flight reimport registry.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::NaiveDate;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct DateLocks {
    writers: Mutex<HashMap<NaiveDate, Arc<AsyncMutex<()>>>>,
    reimports: Arc<Mutex<HashSet<NaiveDate>>>,
}

impl DateLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive write access to `date`. Held for the whole
    /// read-compare-write or replace sequence.
    pub async fn write(&self, date: NaiveDate) -> OwnedMutexGuard<()> {
        let slot = {
            let mut writers = lock(&self.writers);
            writers.retain(|_, slot| Arc::strong_count(slot) > 1);
            writers.entry(date).or_default().clone()
        };
        slot.lock_owned().await
    }

    /// Claims the reimport slot for `date`, or `None` if one is already running.
    pub fn begin_reimport(&self, date: NaiveDate) -> Option<ReimportTicket> {
        if lock(&self.reimports).insert(date) {
            Some(ReimportTicket {
                date,
                registry: Arc::clone(&self.reimports),
            })
        } else {
            None
        }
    }

    pub fn is_reimporting(&self, date: NaiveDate) -> bool {
        lock(&self.reimports).contains(&date)
    }

    pub fn reimports_in_flight(&self) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = lock(&self.reimports).iter().copied().collect();
        dates.sort();
        dates
    }
}

/// Releases the reimport slot when dropped, including on error paths.
#[derive(Debug)]
pub struct ReimportTicket {
    date: NaiveDate,
    registry: Arc<Mutex<HashSet<NaiveDate>>>,
}

impl ReimportTicket {
    pub fn date(&self) -> NaiveDate {
        self.date
    }
}

impl Drop for ReimportTicket {
    fn drop(&mut self) {
        lock(&self.registry).remove(&self.date);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    #[test]
    fn reimport_slot_is_single_flight_per_date() {
        let locks = DateLocks::new();
        let ticket = locks.begin_reimport(day(3)).unwrap();
        assert!(locks.begin_reimport(day(3)).is_none());
        assert!(locks.begin_reimport(day(4)).is_some());
        assert!(locks.is_reimporting(day(3)));
        assert_eq!(locks.reimports_in_flight(), vec![day(3)]);
        drop(ticket);
        assert!(!locks.is_reimporting(day(3)));
        assert!(locks.begin_reimport(day(3)).is_some());
    }

    #[tokio::test]
    async fn writers_on_one_date_are_serialized() {
        let locks = Arc::new(DateLocks::new());
        let guard = locks.write(day(3)).await;

        let other_date = tokio::time::timeout(Duration::from_millis(50), locks.write(day(4))).await;
        assert!(other_date.is_ok(), "different dates must not block each other");

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.write(day(3)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
