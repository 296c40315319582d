//! Mutex wrapper - uses parking_lot if available, std otherwise.
//!
//! Also provides [`ExplicitLock`], a reentrant lock acquired and released by
//! separate calls, which backs the `HeapLock`/`HeapUnlock` pair of the heap
//! API.

use std::thread::{self, ThreadId};

#[cfg(feature = "parking_lot")]
pub use parking_lot::Mutex;

#[cfg(not(feature = "parking_lot"))]
mod std_mutex {
    use std::sync::{Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};

    /// Thin wrapper around std::sync::Mutex.
    ///
    /// Poisoning is ignored: an error callback that panics must not wedge
    /// every later allocation.
    pub struct Mutex<T>(StdMutex<T>);

    impl<T> Mutex<T> {
        /// Create a new mutex.
        pub const fn new(value: T) -> Self {
            Self(StdMutex::new(value))
        }

        /// Lock the mutex.
        pub fn lock(&self) -> MutexGuard<'_, T> {
            MutexGuard(self.0.lock().unwrap_or_else(PoisonError::into_inner))
        }
    }

    impl<T: Default> Default for Mutex<T> {
        fn default() -> Self {
            Self::new(T::default())
        }
    }

    /// Guard for std mutex.
    pub struct MutexGuard<'a, T>(StdMutexGuard<'a, T>);

    impl<'a, T> std::ops::Deref for MutexGuard<'a, T> {
        type Target = T;

        fn deref(&self) -> &Self::Target {
            &self.0
        }
    }

    impl<'a, T> std::ops::DerefMut for MutexGuard<'a, T> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            &mut self.0
        }
    }
}

#[cfg(not(feature = "parking_lot"))]
pub use std_mutex::Mutex;

#[cfg(feature = "parking_lot")]
mod explicit {
    use parking_lot::{Condvar, Mutex};

    use super::Owner;

    /// A reentrant lock with separate `lock` and `unlock` calls and no guard.
    pub struct ExplicitLock {
        owner: Mutex<Owner>,
        released: Condvar,
    }

    impl ExplicitLock {
        /// Create an unlocked lock.
        pub fn new() -> Self {
            Self {
                owner: Mutex::new(Owner::FREE),
                released: Condvar::new(),
            }
        }

        /// Block until the calling thread owns the lock.
        pub fn lock(&self) {
            let mut owner = self.owner.lock();
            while !owner.try_enter() {
                self.released.wait(&mut owner);
            }
        }

        /// Release one level of the calling thread's ownership. Returns
        /// false if the calling thread does not own the lock.
        pub fn unlock(&self) -> bool {
            let mut owner = self.owner.lock();
            let (owned, free) = owner.leave();
            if free {
                self.released.notify_all();
            }
            owned
        }
    }
}

#[cfg(not(feature = "parking_lot"))]
mod explicit {
    use std::sync::{Condvar, Mutex, PoisonError};

    use super::Owner;

    /// A reentrant lock with separate `lock` and `unlock` calls and no guard.
    pub struct ExplicitLock {
        owner: Mutex<Owner>,
        released: Condvar,
    }

    impl ExplicitLock {
        /// Create an unlocked lock.
        pub fn new() -> Self {
            Self {
                owner: Mutex::new(Owner::FREE),
                released: Condvar::new(),
            }
        }

        /// Block until the calling thread owns the lock.
        pub fn lock(&self) {
            let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
            while !owner.try_enter() {
                owner = self
                    .released
                    .wait(owner)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }

        /// Release one level of the calling thread's ownership. Returns
        /// false if the calling thread does not own the lock.
        pub fn unlock(&self) -> bool {
            let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
            let (owned, free) = owner.leave();
            if free {
                self.released.notify_all();
            }
            owned
        }
    }
}

/// Owning thread and recursion depth of an [`ExplicitLock`].
struct Owner {
    thread: Option<ThreadId>,
    depth: usize,
}

impl Owner {
    const FREE: Self = Self {
        thread: None,
        depth: 0,
    };

    fn try_enter(&mut self) -> bool {
        let current = thread::current().id();
        match self.thread {
            Some(thread) if thread != current => false,
            _ => {
                self.thread = Some(current);
                self.depth += 1;
                true
            }
        }
    }

    /// Returns whether the caller owned the lock and whether it is now free.
    fn leave(&mut self) -> (bool, bool) {
        if self.thread != Some(thread::current().id()) {
            return (false, false);
        }
        self.depth -= 1;
        if self.depth == 0 {
            self.thread = None;
            return (true, true);
        }
        (true, false)
    }
}

pub use explicit::ExplicitLock;

impl ExplicitLock {
    /// Run `f` while owning the lock.
    pub fn hold<R>(&self, f: impl FnOnce() -> R) -> R {
        struct Release<'a>(&'a ExplicitLock);

        impl Drop for Release<'_> {
            fn drop(&mut self) {
                self.0.unlock();
            }
        }

        self.lock();
        let _release = Release(self);
        f()
    }
}

impl Default for ExplicitLock {
    fn default() -> Self {
        Self::new()
    }
}
