use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A counting semaphore.
///
/// Used for the rendezvous points of the multifd channels, where nothing but
/// a count is shared.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    /// Creates a semaphore with `count` initial permits.
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Adds a permit and wakes one waiter.
    pub fn post(&self) {
        *self.count.lock() += 1;
        self.cond.notify_one();
    }

    /// Takes a permit, blocking until one is available.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Takes a permit, blocking for at most `timeout`.
    ///
    /// Returns `false` if no permit became available in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        while *count == 0 {
            if self.cond.wait_for(&mut count, timeout).timed_out() && *count == 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }

    /// Takes a permit if one is available.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn rendezvous() {
        let sem = Arc::new(Semaphore::new(0));
        assert!(!sem.try_wait());

        let poster = {
            let sem = sem.clone();
            std::thread::spawn(move || sem.post())
        };

        sem.wait();
        poster.join().expect("poster thread");
        assert!(!sem.wait_timeout(Duration::from_millis(5)));
    }
}
