use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per year, created on first use.
///
/// Multi-year acquisition always proceeds in ascending year order.
#[derive(Debug, Default)]
pub struct YearLocks {
    per_year: Mutex<HashMap<i32, Arc<Mutex<()>>>>,
}

/// Holds the year locks until dropped.
#[derive(Debug)]
pub struct YearGuard {
    years: BTreeSet<i32>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl YearGuard {
    pub fn years(&self) -> &BTreeSet<i32> {
        &self.years
    }

    pub fn covers(&self, year: i32) -> bool {
        self.years.contains(&year)
    }
}

impl YearLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_for(&self, year: i32) -> Arc<Mutex<()>> {
        let mut map = self.per_year.lock().await;
        map.entry(year)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn acquire(&self, years: impl IntoIterator<Item = i32>) -> YearGuard {
        let years: BTreeSet<i32> = years.into_iter().collect();
        let mut guards = Vec::with_capacity(years.len());
        for year in &years {
            let lock = self.lock_for(*year).await;
            guards.push(lock.lock_owned().await);
        }
        YearGuard {
            years,
            _guards: guards,
        }
    }
}
