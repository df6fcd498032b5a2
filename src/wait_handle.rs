//! A one-shot, resettable binary signal threads can block on.
//!
//! A [`WaitHandle`] begins closed. Threads that call [`WaitHandle::wait`]
//! block until some other thread calls [`WaitHandle::set`], which releases
//! every current and future waiter at once. [`WaitHandle::reset`] closes the
//! handle again, making it reusable, although most handles in this crate are
//! set exactly once and then discarded.
//!
//! The timed variant, [`WaitHandle::wait_timeout`], reports expiry as an
//! ordinary `false` return. A timeout is a normal outcome the caller must
//! check, never an error.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A binary open/closed signal supporting blocking waits with an optional
/// timeout. Any number of threads may wait concurrently; `set` releases them
/// all together.
pub struct WaitHandle {
    open: Mutex<bool>,
    signal: Condvar,
}

impl WaitHandle {
    /// Creates a new handle in the closed state.
    pub fn new() -> WaitHandle {
        WaitHandle {
            open: Mutex::new(false),
            signal: Condvar::new(),
        }
    }

    /// Opens the handle, releasing all waiting threads.
    pub fn set(&self) {
        let mut open = self.open.lock();
        *open = true;
        self.signal.notify_all();
    }

    /// Closes the handle again. Threads that wait after this call will block
    /// until the next `set`.
    pub fn reset(&self) {
        let mut open = self.open.lock();
        *open = false;
        self.signal.notify_all();
    }

    /// Returns `true` if the handle is currently open.
    pub fn is_set(&self) -> bool {
        *self.open.lock()
    }

    /// Blocks the calling thread until the handle is set.
    pub fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.signal.wait(&mut open);
        }
    }

    /// Blocks the calling thread until the handle is set or the timeout
    /// elapses. Returns `true` if the handle was set, `false` on expiry.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        let mut open = self.open.lock();
        while !*open {
            if self.signal.wait_until(&mut open, deadline).timed_out() {
                // One final check covers a set that raced the timeout.
                return *open;
            }
        }
        true
    }
}

impl Default for WaitHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn set_releases_waiter() {
        let handle = Arc::new(WaitHandle::new());
        let waiter = {
            let handle = Arc::clone(&handle);
            thread::spawn(move || handle.wait())
        };
        // Give the waiter a moment to block, then release it.
        thread::sleep(Duration::from_millis(10));
        handle.set();
        waiter.join().unwrap();
        assert!(handle.is_set());
    }

    #[test]
    fn set_releases_all_waiters_together() {
        let handle = Arc::new(WaitHandle::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let handle = Arc::clone(&handle);
                thread::spawn(move || handle.wait())
            })
            .collect();
        thread::sleep(Duration::from_millis(10));
        handle.set();
        for waiter in waiters {
            waiter.join().unwrap();
        }
    }

    #[test]
    fn timed_wait_expires_with_false() {
        let handle = WaitHandle::new();
        let start = Instant::now();
        let signalled = handle.wait_timeout(Duration::from_millis(50));
        assert!(!signalled);
        // Allow generous scheduling slack, but the wait must not block
        // indefinitely.
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn timed_wait_returns_true_when_set() {
        let handle = Arc::new(WaitHandle::new());
        let setter = {
            let handle = Arc::clone(&handle);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                handle.set();
            })
        };
        assert!(handle.wait_timeout(Duration::from_secs(5)));
        setter.join().unwrap();
    }

    #[test]
    fn reset_closes_the_handle_again() {
        let handle = WaitHandle::new();
        handle.set();
        assert!(handle.is_set());
        handle.reset();
        assert!(!handle.is_set());
        assert!(!handle.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn wait_returns_immediately_when_already_set() {
        let handle = WaitHandle::new();
        handle.set();
        handle.wait();
    }
}
