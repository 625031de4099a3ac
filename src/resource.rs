//! Resource Manager: an in-process admission controller over three bounded
//! counters (job slots, CPU cores, memory bytes). Hands out scoped loans
//! released on scope exit, mirroring `system::locker::Locker`'s RAII guard
//! but generalized from a binary semaphore to balanced counter decrements.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("not enough resources available: {0}")]
    NotEnoughResources(String),
}

struct Counters {
    available: HashMap<&'static str, i64>,
}

/// Bounded counter bank over the `job`, `cpu`, and `mem` keys.
pub struct Manager {
    counters: Arc<Mutex<Counters>>,
}

impl Manager {
    pub fn new(job: i64, cpu: i64, mem: i64) -> Self {
        let mut available = HashMap::new();
        available.insert("job", job);
        available.insert("cpu", cpu);
        available.insert("mem", mem);
        Self {
            counters: Arc::new(Mutex::new(Counters { available })),
        }
    }

    pub fn available(&self, key: &str) -> i64 {
        *self.counters.lock().available.get(key).unwrap_or(&0)
    }

    /// Scoped acquisition: under a single mutex, atomically check that every
    /// requested amount is available; if any key is short, raise
    /// `NotEnoughResources` and hold nothing. Otherwise decrement all and
    /// return a `Loan` that re-increments them on `Drop`.
    pub fn capture(&self, request: &[(&'static str, i64)]) -> Result<Loan, ResourceError> {
        let mut counters = self.counters.lock();

        for (key, amount) in request {
            let have = *counters.available.get(key).unwrap_or(&0);
            if have < *amount {
                return Err(ResourceError::NotEnoughResources((*key).to_string()));
            }
        }

        for (key, amount) in request {
            *counters.available.get_mut(key).unwrap() -= amount;
        }

        Ok(Loan {
            counters: self.counters.clone(),
            held: request.to_vec(),
        })
    }
}

/// RAII guard for a resource capture. Releases all held amounts back to the
/// counter bank on drop; never a partial release.
pub struct Loan {
    counters: Arc<Mutex<Counters>>,
    held: Vec<(&'static str, i64)>,
}

impl Drop for Loan {
    fn drop(&mut self) {
        let mut counters = self.counters.lock();
        for (key, amount) in &self.held {
            *counters.available.get_mut(key).unwrap() += amount;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_and_release_balance() {
        let manager = Manager::new(2, 4, 1024);
        assert_eq!(manager.available("job"), 2);

        let loan = manager.capture(&[("job", 1), ("cpu", 2), ("mem", 512)]).unwrap();
        assert_eq!(manager.available("job"), 1);
        assert_eq!(manager.available("cpu"), 2);
        assert_eq!(manager.available("mem"), 512);

        drop(loan);
        assert_eq!(manager.available("job"), 2);
        assert_eq!(manager.available("cpu"), 4);
        assert_eq!(manager.available("mem"), 1024);
    }

    #[test]
    fn test_capture_holds_nothing_on_failure() {
        let manager = Manager::new(1, 1, 1024);
        let result = manager.capture(&[("job", 1), ("cpu", 5)]);
        assert!(result.is_err());
        // cpu was short; job must not have been decremented either.
        assert_eq!(manager.available("job"), 1);
        assert_eq!(manager.available("cpu"), 1);
    }

    #[test]
    fn test_counters_never_go_negative_under_contention() {
        let manager = Arc::new(Manager::new(3, 3, 3));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = manager.clone();
            handles.push(std::thread::spawn(move || {
                manager.capture(&[("job", 1)]).ok()
            }));
        }
        let loans: Vec<_> = handles.into_iter().filter_map(|h| h.join().unwrap()).collect();
        assert!(loans.len() <= 3);
        assert!(manager.available("job") >= 0);
        drop(loans);
        assert_eq!(manager.available("job"), 3);
    }
}
