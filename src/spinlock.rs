// This file is base on spin crate (MIT license). See COPYRIGHT for copyright information.
// spin-rs (https://github.com/mvdnes/spin-rs)

use core::cell::UnsafeCell;
use core::fmt;
use core::fmt::Formatter;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{spin_loop_hint as cpu_relax, AtomicBool, Ordering};

/// A mutual exclusion primitive useful for protecting shared data, using a
/// spin lock rather than blocking the current core.
///
/// # Examples
///
/// ```
/// use spinlock;
///
/// static LOCK: spinlock::Mutex<usize> = spinlock::Mutex::new(0);
///
/// {
///     let mut guard = LOCK.lock();
///     *guard += 1;
/// }
/// ```
pub(crate) struct Mutex<T: ?Sized> {
    lock: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new spinlock wrapping the supplied data.
    ///
    /// May be used statically:
    ///
    /// ```
    /// use spinlock;
    ///
    /// static MUTEX: spinlock::Mutex<()> = spinlock::Mutex::new(());
    /// ```
    #[inline]
    pub(crate) const fn new(data: T) -> Mutex<T> {
        Mutex {
            lock: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes this mutex, returning the underlying data.
    #[inline]
    pub(crate) fn into_inner(self) -> T {
        let Mutex { data, .. } = self;
        data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Locks the mutex, spinning the current core until it is acquired.
    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<T> {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.lock.load(Ordering::Relaxed) {
                cpu_relax();
            }
        }
        MutexGuard { lock: self }
    }

    /// Tries to lock the mutex without spinning.
    #[inline]
    pub(crate) fn try_lock(&self) -> Option<MutexGuard<T>> {
        if self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(MutexGuard { lock: self })
        } else {
            None
        }
    }

    /// Returns `true` if the lock is currently held.
    #[inline]
    pub(crate) fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => write!(f, "Mutex {{ data: ")
                .and_then(|()| (&*guard).fmt(f))
                .and_then(|()| write!(f, "}}")),
            None => write!(f, "Mutex {{ <locked> }}"),
        }
    }
}

impl<T: ?Sized + Default> Default for Mutex<T> {
    fn default() -> Mutex<T> {
        Mutex::new(Default::default())
    }
}

/// An RAII guard returned by `Mutex::lock` / `Mutex::try_lock`. Releases the
/// mutex's lock when dropped.
pub(crate) struct MutexGuard<'a, T: ?Sized + 'a> {
    lock: &'a Mutex<T>,
}

impl<'a, T: ?Sized> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.lock.store(false, Ordering::Release);
    }
}
