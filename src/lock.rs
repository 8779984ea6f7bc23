//! The switchable engine lock.
//!
//! With the default `sync` feature the ring state of every engine sits
//! behind a real mutex. Without it the lock compiles down to a
//! `RefCell`, for embeddings whose runtime guarantees a single mutator
//! thread; the engines then stop being `Sync`, which is exactly the
//! discipline such a runtime imposes anyway.

#[cfg(feature = "sync")]
pub(crate) use self::enabled::Lock;
#[cfg(not(feature = "sync"))]
pub(crate) use self::disabled::Lock;

#[cfg(feature = "sync")]
mod enabled {
    use parking_lot::Mutex;

    pub(crate) struct Lock<T>(Mutex<T>);

    impl<T> Lock<T> {
        pub(crate) fn new(value: T) -> Lock<T> {
            Lock(Mutex::new(value))
        }

        #[inline]
        pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
            f(&mut self.0.lock())
        }
    }
}

#[cfg(not(feature = "sync"))]
mod disabled {
    use std::cell::RefCell;

    pub(crate) struct Lock<T>(RefCell<T>);

    impl<T> Lock<T> {
        pub(crate) fn new(value: T) -> Lock<T> {
            Lock(RefCell::new(value))
        }

        #[inline]
        pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
            f(&mut self.0.borrow_mut())
        }
    }
}
