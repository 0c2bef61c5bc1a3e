//! Single seam through which every synchronisation primitive used by this
//! crate is obtained. Everything downstream imports from here instead of
//! reaching into `std::sync` directly, so that the `loom` feature can swap in
//! `loom`'s model-checked equivalents without touching a single line of
//! engine logic.

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{
    fence, AtomicBool, AtomicU64, AtomicUsize, Ordering,
};
#[cfg(loom)]
pub(crate) use loom::sync::Arc;

#[cfg(not(loom))]
pub(crate) use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};
#[cfg(not(loom))]
pub(crate) use std::sync::Arc;

#[cfg(loom)]
type InnerMutex<T> = loom::sync::Mutex<T>;
#[cfg(not(loom))]
type InnerMutex<T> = parking_lot::Mutex<T>;

#[cfg(loom)]
pub(crate) type MutexGuard<'a, T> = loom::sync::MutexGuard<'a, T>;
#[cfg(not(loom))]
pub(crate) type MutexGuard<'a, T> = parking_lot::MutexGuard<'a, T>;

/// Wraps the platform mutex since loom and parking_lot have different APIs
/// (loom poisons on error, parking_lot does not).
pub(crate) struct Mutex<T> {
    inner: InnerMutex<T>,
}

impl<T> Mutex<T> {
    pub fn new(t: T) -> Mutex<T> {
        Mutex {
            inner: InnerMutex::new(t),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        #[cfg(loom)]
        return self.inner.lock().unwrap();
        #[cfg(not(loom))]
        return self.inner.lock();
    }
}

/// Wraps the platform condvar. `wait_while` is expressed once here so call
/// sites never have to special-case loom's `Result`-returning `wait`.
pub(crate) struct Condvar {
    #[cfg(loom)]
    inner: loom::sync::Condvar,
    #[cfg(not(loom))]
    inner: parking_lot::Condvar,
}

impl Condvar {
    pub fn new() -> Condvar {
        #[cfg(loom)]
        return Condvar {
            inner: loom::sync::Condvar::new(),
        };
        #[cfg(not(loom))]
        return Condvar {
            inner: parking_lot::Condvar::new(),
        };
    }

    pub fn notify_all(&self) {
        #[cfg(loom)]
        self.inner.notify_all();
        #[cfg(not(loom))]
        self.inner.notify_all();
    }

    /// Blocks `guard`'s holder until `condition` returns `false`, handing
    /// the (possibly reacquired) guard back to the caller. Takes and returns
    /// the guard by value so the loom and parking_lot implementations can
    /// share one call signature despite loom's `wait` consuming its guard.
    pub fn wait_while<'a, T, F>(
        &self,
        mut guard: MutexGuard<'a, T>,
        mut condition: F,
    ) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        #[cfg(loom)]
        {
            while condition(&mut *guard) {
                guard = self.inner.wait(guard).unwrap();
            }
            guard
        }
        #[cfg(not(loom))]
        {
            self.inner.wait_while(&mut guard, |t| condition(t));
            guard
        }
    }
}
