//! Atomic primitive layer.
//!
//! Every atomic, lock, cell and thread primitive the crate touches is
//! imported from here, so that the `loom` feature can swap the whole
//! substrate for loom's model-checked versions.

#[cfg(feature = "loom")]
mod imp {
    pub(crate) use loom::{
        cell::UnsafeCell,
        hint,
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering},
        },
    };
    use core::fmt;
    use std::sync::PoisonError;

    pub(crate) mod thread {
        pub(crate) use loom::thread::{JoinHandle, yield_now};
        use std::{io, time::Duration};

        /// Loom threads carry no names; the name is dropped.
        pub(crate) fn spawn_named<F>(_name: String, f: F) -> io::Result<JoinHandle<()>>
        where
            F: FnOnce() + Send + 'static,
        {
            Ok(loom::thread::spawn(f))
        }

        /// Loom has no clock, a timed sleep is modelled as a yield.
        pub(crate) fn sleep(_dur: Duration) {
            yield_now();
        }
    }

    /// `parking_lot`-shaped facade over `loom::sync::Mutex`.
    pub(crate) struct Mutex<T>(loom::sync::Mutex<T>);

    impl<T> Mutex<T> {
        pub(crate) fn new(value: T) -> Self {
            Self(loom::sync::Mutex::new(value))
        }

        pub(crate) fn lock(&self) -> loom::sync::MutexGuard<'_, T> {
            self.0.lock().unwrap_or_else(PoisonError::into_inner)
        }

        pub(crate) fn try_lock(&self) -> Option<loom::sync::MutexGuard<'_, T>> {
            self.0.try_lock().ok()
        }
    }

    impl<T> fmt::Debug for Mutex<T> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Mutex").finish_non_exhaustive()
        }
    }
}

#[cfg(not(feature = "loom"))]
mod imp {
    pub(crate) use core::{
        hint,
        sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering},
    };
    pub(crate) use parking_lot::Mutex;
    pub(crate) use std::sync::Arc;

    pub(crate) mod thread {
        pub(crate) use std::thread::{JoinHandle, sleep, yield_now};
        use std::io;

        pub(crate) fn spawn_named<F>(name: String, f: F) -> io::Result<JoinHandle<()>>
        where
            F: FnOnce() + Send + 'static,
        {
            std::thread::Builder::new().name(name).spawn(f)
        }
    }

    /// Mirror of `loom::cell::UnsafeCell`'s closure-based access API.
    #[derive(Debug)]
    #[repr(transparent)]
    pub(crate) struct UnsafeCell<T>(core::cell::UnsafeCell<T>);

    impl<T> UnsafeCell<T> {
        pub(crate) const fn new(value: T) -> Self {
            Self(core::cell::UnsafeCell::new(value))
        }

        #[inline(always)]
        pub(crate) fn with<R>(&self, f: impl FnOnce(*const T) -> R) -> R {
            f(self.0.get())
        }

        #[inline(always)]
        pub(crate) fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
            f(self.0.get())
        }
    }
}

pub(crate) use imp::*;

/// Increment/decrement that report the value *after* the update, the way a
/// pending-count is reasoned about ("did this decrement bring it to zero?").
pub(crate) trait AtomicCounter {
    type Value;

    /// Atomically adds one and returns the new value.
    fn increment(&self, order: Ordering) -> Self::Value;

    /// Atomically subtracts one and returns the new value.
    ///
    /// Decrementing a counter that is already zero is a protocol violation;
    /// debug builds catch it.
    fn decrement(&self, order: Ordering) -> Self::Value;
}

macro_rules! impl_atomic_counter {
    ($($atomic:ty => $value:ty),* $(,)?) => {
        $(
            impl AtomicCounter for $atomic {
                type Value = $value;

                #[inline]
                fn increment(&self, order: Ordering) -> $value {
                    self.fetch_add(1, order).wrapping_add(1)
                }

                #[inline]
                fn decrement(&self, order: Ordering) -> $value {
                    let prev = self.fetch_sub(1, order);
                    debug_assert_ne!(prev, 0, "AtomicCounter::decrement: underflow");
                    prev.wrapping_sub(1)
                }
            }
        )*
    };
}

impl_atomic_counter!(AtomicU32 => u32, AtomicUsize => usize);
