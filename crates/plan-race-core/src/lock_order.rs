//! Ranked lock wrappers shared by the plan cache and the harness.
//!
//! The reproduction deliberately parks threads while they hold the plan
//! cache's build lock, so a single inconsistent acquisition order between the
//! cache and the harness sequencer would turn a race reproduction into a
//! deadlock. Every lock that participates is wrapped here and ranked.
//!
//! A thread holding ranked locks may only take a lock whose
//! [`LockLevel::rank`] is strictly greater than the last one it took.
//!
//! Ordering checks compile to no-ops outside `debug_assertions`.

#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{
    Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    WaitTimeoutResult,
};
use std::time::Duration;

/// Rank of every lock that can be nested during a reproduction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockLevel {
    // ---------------------------------------------------------------------
    // Plan cache
    // ---------------------------------------------------------------------
    /// The build lock every slow-path caller contends on.
    SlotBuild,
    /// The published key -> plan map read by the unlocked fast path.
    SlotPublished,

    // ---------------------------------------------------------------------
    // Harness
    // ---------------------------------------------------------------------
    /// Rendezvous/gate state; touched from inside the build lock.
    SequencerState,
}

impl LockLevel {
    /// Unique per variant.
    #[must_use]
    pub const fn rank(self) -> u16 {
        match self {
            Self::SlotBuild => 10,
            Self::SlotPublished => 20,
            Self::SequencerState => 30,
        }
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}@{}", self.rank())
    }
}

#[cfg(debug_assertions)]
thread_local! {
    static HELD_LOCKS: RefCell<Vec<LockLevel>> = const { RefCell::new(Vec::new()) };
}

#[inline]
fn check_before_acquire(level: LockLevel) {
    #[cfg(debug_assertions)]
    HELD_LOCKS.with(|held| {
        let held = held.borrow();
        let Some(&last) = held.last() else {
            return;
        };
        assert!(
            level.rank() > last.rank(),
            "lock order violation: acquiring {} while holding {} (held: {:?})",
            level,
            last,
            held.as_slice()
        );
    });
}

#[inline]
fn did_acquire(level: LockLevel) {
    #[cfg(debug_assertions)]
    HELD_LOCKS.with(|held| held.borrow_mut().push(level));
}

#[inline]
fn did_release(level: LockLevel) {
    #[cfg(debug_assertions)]
    HELD_LOCKS.with(|held| {
        let mut held = held.borrow_mut();
        let last = held.pop();
        assert!(
            last == Some(level),
            "lock release out of order: releasing {} but top of stack was {:?} (held: {:?})",
            level,
            last,
            held.as_slice()
        );
    });
}

/// `Mutex` whose acquisitions are rank-checked in debug builds.
#[derive(Debug)]
pub struct OrderedMutex<T> {
    level: LockLevel,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    #[must_use]
    pub const fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: Mutex::new(value),
        }
    }

    #[must_use]
    pub const fn level(&self) -> LockLevel {
        self.level
    }

    pub fn lock(&self) -> OrderedMutexGuard<'_, T> {
        check_before_acquire(self.level);
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        did_acquire(self.level);
        OrderedMutexGuard {
            level: self.level,
            guard: Some(guard),
        }
    }

    /// Non-blocking acquisition. `None` means another thread holds the lock,
    /// which is exactly the contention signal the plan cache reports.
    pub fn try_lock(&self) -> Option<OrderedMutexGuard<'_, T>> {
        check_before_acquire(self.level);
        let guard = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(std::sync::TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(std::sync::TryLockError::WouldBlock) => return None,
        };
        did_acquire(self.level);
        Some(OrderedMutexGuard {
            level: self.level,
            guard: Some(guard),
        })
    }
}

/// Guard for [`OrderedMutex`].
///
/// The inner guard is only ever absent for the duration of
/// [`wait_timeout_while`](Self::wait_timeout_while).
pub struct OrderedMutexGuard<'a, T> {
    level: LockLevel,
    guard: Option<MutexGuard<'a, T>>,
}

impl<T> OrderedMutexGuard<'_, T> {
    /// Block on `condvar` until `condition` returns false or `timeout`
    /// elapses, releasing the mutex while parked.
    ///
    /// The lock stays recorded as held for ordering purposes: the parked
    /// thread cannot acquire anything else until it wakes up.
    pub fn wait_timeout_while<F>(
        &mut self,
        condvar: &Condvar,
        timeout: Duration,
        condition: F,
    ) -> WaitTimeoutResult
    where
        F: FnMut(&mut T) -> bool,
    {
        let Some(inner) = self.guard.take() else {
            unreachable!("ordered guard re-entered while waiting");
        };
        let (inner, result) = condvar
            .wait_timeout_while(inner, timeout, condition)
            .unwrap_or_else(PoisonError::into_inner);
        self.guard = Some(inner);
        result
    }
}

impl<T> Drop for OrderedMutexGuard<'_, T> {
    fn drop(&mut self) {
        did_release(self.level);
    }
}

impl<T> Deref for OrderedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.guard
            .as_deref()
            .unwrap_or_else(|| unreachable!("ordered guard read while waiting"))
    }
}

impl<T> DerefMut for OrderedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("ordered guard written while waiting"))
    }
}

/// `RwLock` counterpart of [`OrderedMutex`].
#[derive(Debug)]
pub struct OrderedRwLock<T> {
    level: LockLevel,
    inner: RwLock<T>,
}

impl<T> OrderedRwLock<T> {
    #[must_use]
    pub const fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: RwLock::new(value),
        }
    }

    #[must_use]
    pub const fn level(&self) -> LockLevel {
        self.level
    }

    pub fn read(&self) -> OrderedRwLockReadGuard<'_, T> {
        check_before_acquire(self.level);
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        did_acquire(self.level);
        OrderedRwLockReadGuard {
            level: self.level,
            guard,
        }
    }

    pub fn write(&self) -> OrderedRwLockWriteGuard<'_, T> {
        check_before_acquire(self.level);
        let guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        did_acquire(self.level);
        OrderedRwLockWriteGuard {
            level: self.level,
            guard,
        }
    }
}

pub struct OrderedRwLockReadGuard<'a, T> {
    level: LockLevel,
    guard: RwLockReadGuard<'a, T>,
}

impl<T> Drop for OrderedRwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        did_release(self.level);
    }
}

impl<T> Deref for OrderedRwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

pub struct OrderedRwLockWriteGuard<'a, T> {
    level: LockLevel,
    guard: RwLockWriteGuard<'a, T>,
}

impl<T> Drop for OrderedRwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        did_release(self.level);
    }
}

impl<T> Deref for OrderedRwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for OrderedRwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn ordered_mutex_allows_increasing_order() {
        let build = OrderedMutex::new(LockLevel::SlotBuild, ());
        let published = OrderedRwLock::new(LockLevel::SlotPublished, ());
        let sequencer = OrderedMutex::new(LockLevel::SequencerState, ());

        let _build = build.lock();
        let _published = published.write();
        let _sequencer = sequencer.lock();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order violation")]
    fn ordered_mutex_panics_on_out_of_order() {
        let sequencer = OrderedMutex::new(LockLevel::SequencerState, ());
        let build = OrderedMutex::new(LockLevel::SlotBuild, ());

        let _sequencer = sequencer.lock();
        let _build = build.lock();
    }

    #[test]
    fn try_lock_reports_contention() {
        let build = Arc::new(OrderedMutex::new(LockLevel::SlotBuild, 0_u32));
        let held = build.lock();

        let other = Arc::clone(&build);
        let contended = thread::spawn(move || other.try_lock().is_none())
            .join()
            .expect("thread panicked");
        assert!(contended);

        drop(held);
        assert!(build.try_lock().is_some());
    }

    #[test]
    fn wait_timeout_while_releases_and_reacquires() {
        let state = Arc::new((
            OrderedMutex::new(LockLevel::SequencerState, false),
            Condvar::new(),
        ));

        let signaller = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                let (lock, cv) = &*state;
                *lock.lock() = true;
                cv.notify_all();
            })
        };

        let (lock, cv) = &*state;
        let mut guard = lock.lock();
        let result = guard.wait_timeout_while(cv, Duration::from_secs(5), |ready| !*ready);
        assert!(!result.timed_out());
        assert!(*guard);
        drop(guard);
        signaller.join().expect("thread panicked");
    }

    #[test]
    fn wait_timeout_while_times_out() {
        let lock = OrderedMutex::new(LockLevel::SequencerState, 0_u8);
        let cv = Condvar::new();
        let started = Instant::now();
        let mut guard = lock.lock();
        let result = guard.wait_timeout_while(&cv, Duration::from_millis(20), |_| true);
        assert!(result.timed_out());
        assert!(started.elapsed() >= Duration::from_millis(20));
        *guard += 1;
        assert_eq!(*guard, 1);
    }

    #[test]
    fn stress_no_deadlock_under_contention_short() {
        let build = Arc::new(OrderedMutex::new(LockLevel::SlotBuild, ()));
        let published = Arc::new(OrderedRwLock::new(LockLevel::SlotPublished, ()));
        let sequencer = Arc::new(OrderedMutex::new(LockLevel::SequencerState, ()));

        let start = Instant::now();
        let run_for = Duration::from_millis(100);

        let handles = (0..32)
            .map(|i| {
                let build = Arc::clone(&build);
                let published = Arc::clone(&published);
                let sequencer = Arc::clone(&sequencer);
                thread::spawn(move || {
                    while start.elapsed() < run_for {
                        if i % 2 == 0 {
                            let _fast = published.read();
                        } else {
                            let _build = build.lock();
                            let _published = published.write();
                            let _sequencer = sequencer.lock();
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        for h in handles {
            h.join().expect("thread panicked");
        }
    }
}
